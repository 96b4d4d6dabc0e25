//! Termination signals.
//!
//! SIGTERM, SIGINT and SIGQUIT stop the arbiter, exactly like a `quit`
//! command. The listener task lives until [`SignalHandler::stop`].

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::arbiter::Arbiter;

/// Handle to the signal listener task.
pub struct SignalHandler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SignalHandler {
    /// Registers the handlers and spawns the listener task.
    ///
    /// Registration happens before this returns, so a signal delivered right
    /// after is not lost.
    pub fn install(arbiter: Arc<dyn Arbiter>) -> io::Result<Self> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let name = tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("Signal handler stopped");
                    return;
                }
                Some(()) = sigterm.recv() => "SIGTERM",
                Some(()) = sigint.recv() => "SIGINT",
                Some(()) = sigquit.recv() => "SIGQUIT",
                else => {
                    error!("Signal streams closed");
                    return;
                }
            };
            info!(signal = name, "Shutdown signal received");
            arbiter.stop();
        });

        Ok(Self { cancel, task })
    }

    /// Stops listening. The OS-level handlers stay registered, so later
    /// signals are swallowed.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingArbiter {
        stops: AtomicUsize,
    }

    impl Arbiter for CountingArbiter {
        fn manage_watchers(&self) {}

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_stop_ends_the_listener() {
        let arbiter = Arc::new(CountingArbiter::default());
        let handler = SignalHandler::install(arbiter.clone()).unwrap();
        handler.stop();

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handler.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(arbiter.stops.load(Ordering::SeqCst), 0);
    }
}
