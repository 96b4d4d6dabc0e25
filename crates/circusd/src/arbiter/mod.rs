//! The arbiter: the supervisory layer commands act on.
//!
//! The controller itself only needs two calls, [`Arbiter::manage_watchers`]
//! (every check delay) and [`Arbiter::stop`] (after a `quit`). The remaining
//! methods back the built-in commands and default to
//! [`ArbiterError::Unsupported`], so a minimal arbiter implements just the
//! two required calls.
//!
//! [`Supervisor`] is the concrete arbiter used by the daemon.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Poisoned locks are recovered, never propagated

mod supervisor;
mod watcher;

pub use supervisor::Supervisor;
pub use watcher::{Watcher, WatcherState};

use std::time::Duration;

use circus_core::{Process, ProcessError, ProcessInfo};
use thiserror::Error;
use tracing::debug;

/// Errors returned by arbiter operations.
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// No watcher with this name
    #[error("program {0} not found")]
    UnknownWatcher(String),

    /// The arbiter does not implement this operation
    #[error("{0} is not supported by this arbiter")]
    Unsupported(&'static str),

    /// Invalid argument (e.g. a negative process count)
    #[error("{0}")]
    InvalidArgument(String),

    /// A process operation failed
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// The supervisory collaborator driven by the controller.
///
/// Called from the reactor task, so implementations must not block.
/// Blocking teardown is handed back as [`Retired`] batches.
pub trait Arbiter: Send + Sync {
    /// Periodic health check: reap, respawn, scale.
    fn manage_watchers(&self);

    /// Stops everything. Called once after a `quit` command or a
    /// termination signal.
    fn stop(&self);

    /// Names of all watchers, sorted.
    fn watcher_names(&self) -> Result<Vec<String>, ArbiterError> {
        Err(ArbiterError::Unsupported("watcher_names"))
    }

    fn watcher_status(&self, _name: &str) -> Result<WatcherState, ArbiterError> {
        Err(ArbiterError::Unsupported("watcher_status"))
    }

    /// Activates a watcher and spawns its processes.
    fn start_watcher(&self, _name: &str) -> Result<(), ArbiterError> {
        Err(ArbiterError::Unsupported("start_watcher"))
    }

    /// Deactivates a watcher. The returned processes still have to be
    /// stopped by the caller.
    fn stop_watcher(&self, _name: &str) -> Result<Retired, ArbiterError> {
        Err(ArbiterError::Unsupported("stop_watcher"))
    }

    /// Target number of processes of a watcher.
    fn numprocesses(&self, _name: &str) -> Result<usize, ArbiterError> {
        Err(ArbiterError::Unsupported("numprocesses"))
    }

    /// Changes the target number of processes, returning the new target.
    fn set_numprocesses(&self, _name: &str, _numprocesses: usize) -> Result<usize, ArbiterError> {
        Err(ArbiterError::Unsupported("set_numprocesses"))
    }

    fn pids(&self, _name: &str) -> Result<Vec<u32>, ArbiterError> {
        Err(ArbiterError::Unsupported("pids"))
    }

    /// Runtime snapshot of every process of a watcher. May block briefly
    /// while system statistics are sampled.
    fn process_info(&self, _name: &str) -> Result<Vec<ProcessInfo>, ArbiterError> {
        Err(ArbiterError::Unsupported("process_info"))
    }

    /// Sends a signal to every process of a watcher, returning how many
    /// processes were signalled.
    fn signal_watcher(&self, _name: &str, _signum: i32) -> Result<usize, ArbiterError> {
        Err(ArbiterError::Unsupported("signal_watcher"))
    }
}

/// Processes taken out of supervision, waiting to be stopped.
#[derive(Debug, Default)]
pub struct Retired {
    entries: Vec<(Process, Duration)>,
}

impl Retired {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a process with the graceful timeout of its watcher.
    pub fn push(&mut self, process: Process, graceful_timeout: Duration) {
        self.entries.push((process, graceful_timeout));
    }

    /// Moves every entry of `other` into this batch.
    pub fn extend(&mut self, other: Retired) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stops every process: SIGTERM to all first, then each one gets its
    /// graceful timeout before SIGKILL. Blocks the calling thread.
    ///
    /// Returns the number of processes handled.
    pub fn stop_all(self) -> usize {
        let mut entries = self.entries;

        for (process, _) in entries.iter_mut() {
            if let Err(e) = process.send_signal(libc::SIGTERM) {
                debug!(wid = %process.wid(), error = %e, "SIGTERM skipped");
            }
        }

        for (process, timeout) in entries.iter_mut() {
            if let Err(e) = process.stop(*timeout) {
                debug!(wid = %process.wid(), error = %e, "Stop failed");
            }
        }

        entries.len()
    }
}

/// Stops a batch off the reactor thread.
///
/// Uses the tokio blocking pool when a runtime is available, and stops
/// inline otherwise.
pub fn retire(batch: Retired) {
    if batch.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || batch.stop_all());
        }
        Err(_) => {
            batch.stop_all();
        }
    }
}
