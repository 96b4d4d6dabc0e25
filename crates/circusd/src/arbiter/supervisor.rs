//! The concrete arbiter used by the daemon.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use circus_core::ProcessInfo;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{retire, Arbiter, ArbiterError, Retired, Watcher, WatcherState};

/// Owns every watcher and drives them on behalf of the controller.
///
/// State lives behind a mutex so deferred command tasks can reach it from
/// outside the reactor. The shutdown token is cancelled once
/// [`Arbiter::stop`] has finished tearing every process down.
pub struct Supervisor {
    watchers: Mutex<BTreeMap<String, Watcher>>,
    shutdown: CancellationToken,
    stopping: AtomicBool,
}

impl Supervisor {
    pub fn new(watchers: impl IntoIterator<Item = Watcher>) -> Self {
        let watchers = watchers
            .into_iter()
            .map(|w| (w.name().to_string(), w))
            .collect();
        Self {
            watchers: Mutex::new(watchers),
            shutdown: CancellationToken::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Token cancelled once the supervisor has fully stopped.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns true once `stop` has been called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Watcher>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_watcher<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Watcher) -> Result<T, ArbiterError>,
    ) -> Result<T, ArbiterError> {
        let mut watchers = self.lock();
        let watcher = watchers
            .get_mut(name)
            .ok_or_else(|| ArbiterError::UnknownWatcher(name.to_string()))?;
        f(watcher)
    }
}

impl Arbiter for Supervisor {
    fn manage_watchers(&self) {
        if self.is_stopping() {
            return;
        }
        let mut retired = Retired::new();
        for watcher in self.lock().values_mut() {
            retired.extend(watcher.manage());
        }
        retire(retired);
    }

    fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut retired = Retired::new();
        for watcher in self.lock().values_mut() {
            retired.extend(watcher.stop());
        }
        info!(processes = retired.len(), "Supervisor stopping");

        let shutdown = self.shutdown.clone();
        let teardown = move || {
            let stopped = retired.stop_all();
            info!(stopped, "All processes stopped");
            shutdown.cancel();
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(teardown);
            }
            Err(_) => teardown(),
        }
    }

    fn watcher_names(&self) -> Result<Vec<String>, ArbiterError> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn watcher_status(&self, name: &str) -> Result<WatcherState, ArbiterError> {
        self.with_watcher(name, |w| Ok(w.state()))
    }

    fn start_watcher(&self, name: &str) -> Result<(), ArbiterError> {
        if self.is_stopping() {
            return Err(ArbiterError::InvalidArgument(
                "the supervisor is shutting down".to_string(),
            ));
        }
        self.with_watcher(name, |w| {
            if let Err(e) = w.start() {
                warn!(watcher = %name, error = %e, "Watcher failed to start");
                return Err(e.into());
            }
            Ok(())
        })
    }

    fn stop_watcher(&self, name: &str) -> Result<Retired, ArbiterError> {
        self.with_watcher(name, |w| Ok(w.stop()))
    }

    fn numprocesses(&self, name: &str) -> Result<usize, ArbiterError> {
        self.with_watcher(name, |w| Ok(w.numprocesses()))
    }

    fn set_numprocesses(&self, name: &str, numprocesses: usize) -> Result<usize, ArbiterError> {
        self.with_watcher(name, |w| {
            w.set_numprocesses(numprocesses);
            Ok(numprocesses)
        })
    }

    fn pids(&self, name: &str) -> Result<Vec<u32>, ArbiterError> {
        self.with_watcher(name, |w| Ok(w.pids()))
    }

    fn process_info(&self, name: &str) -> Result<Vec<ProcessInfo>, ArbiterError> {
        if !self.lock().contains_key(name) {
            return Err(ArbiterError::UnknownWatcher(name.to_string()));
        }
        // Sample outside the lock: refresh_all walks the whole process table
        let mut system = System::new();
        system.refresh_all();
        self.with_watcher(name, |w| Ok(w.process_info(&system)))
    }

    fn signal_watcher(&self, name: &str, signum: i32) -> Result<usize, ArbiterError> {
        self.with_watcher(name, |w| Ok(w.signal(signum)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circus_core::ProcessConfig;
    use std::time::Duration;

    fn supervisor() -> Supervisor {
        Supervisor::new([
            Watcher::new(
                "web",
                ProcessConfig::new("sleep").with_args("30"),
                2,
                Duration::from_secs(2),
            )
            .activated(),
            Watcher::new("idle", ProcessConfig::new("true"), 1, Duration::from_secs(1)),
        ])
    }

    #[test]
    fn test_names_and_status() {
        let supervisor = supervisor();
        assert_eq!(supervisor.watcher_names().unwrap(), vec!["idle", "web"]);
        assert_eq!(supervisor.watcher_status("web").unwrap(), WatcherState::Active);
        assert_eq!(supervisor.watcher_status("idle").unwrap(), WatcherState::Stopped);
        assert!(matches!(
            supervisor.watcher_status("nope"),
            Err(ArbiterError::UnknownWatcher(_))
        ));
    }

    #[test]
    fn test_manage_then_stop_without_runtime() {
        let supervisor = supervisor();
        supervisor.manage_watchers();
        assert_eq!(supervisor.pids("web").unwrap().len(), 2);
        assert!(supervisor.pids("idle").unwrap().is_empty());

        let token = supervisor.shutdown_token();
        supervisor.stop();
        // No runtime: teardown ran inline
        assert!(token.is_cancelled());
        assert!(supervisor.pids("web").unwrap().is_empty());

        // Second stop is a no-op, and nothing respawns
        supervisor.stop();
        supervisor.manage_watchers();
        assert!(supervisor.pids("web").unwrap().is_empty());
    }

    #[test]
    fn test_set_numprocesses() {
        let supervisor = supervisor();
        assert_eq!(supervisor.numprocesses("web").unwrap(), 2);
        assert_eq!(supervisor.set_numprocesses("web", 5).unwrap(), 5);
        assert_eq!(supervisor.numprocesses("web").unwrap(), 5);
        supervisor.stop();
    }
}
