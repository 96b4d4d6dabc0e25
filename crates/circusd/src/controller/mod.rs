//! The controller: a single reactor task that owns the control socket.
//!
//! The reactor multiplexes inbound frames, queued dispatch jobs, completions
//! of deferred commands, discovery probes and the periodic health check.
//! Nothing it runs may block; commands that would are deferred and their
//! results come back through the completion queue.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Command panics are caught and answered as command errors
//! - Shutdown never fails: flush and close errors are logged and dropped

mod dispatch;

pub use dispatch::{Completion, DispatchQueues, Dispatcher, Job, Reply, RequestContext};

use std::sync::Arc;
use std::time::Duration;

use circus_protocol::{Endpoint, MulticastEndpoint};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arbiter::Arbiter;
use crate::commands::CommandRegistry;
use crate::discovery::{DiscoveryError, DiscoveryResponder, Probe};
use crate::router::{Incoming, Outbound, RouterSocket, TransportError};
use crate::signals::SignalHandler;

/// Default health-check period
pub const DEFAULT_CHECK_DELAY: Duration = Duration::from_secs(1);

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub endpoint: Endpoint,
    pub multicast_endpoint: Option<MulticastEndpoint>,
    pub check_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            multicast_endpoint: None,
            check_delay: DEFAULT_CHECK_DELAY,
        }
    }
}

/// Errors raised while bringing the controller up.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("controller is not initialized")]
    NotInitialized,
}

/// Sockets and queues created by [`Controller::initialize`].
struct Bound {
    router: Arc<RouterSocket>,
    incoming: mpsc::UnboundedReceiver<Incoming>,
    dispatcher: Dispatcher,
    queues: DispatchQueues,
}

pub struct Controller {
    config: ControllerConfig,
    registry: Arc<CommandRegistry>,
    arbiter: Arc<dyn Arbiter>,
    bound: Option<Bound>,
    discovery: Option<DiscoveryResponder>,
    ticker: Option<Interval>,
    signals: Option<SignalHandler>,
    started: bool,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        registry: Arc<CommandRegistry>,
        arbiter: Arc<dyn Arbiter>,
    ) -> Self {
        Self {
            config,
            registry,
            arbiter,
            bound: None,
            discovery: None,
            ticker: None,
            signals: None,
            started: false,
        }
    }

    /// Binds the control socket and, if configured, the discovery socket.
    pub async fn initialize(&mut self) -> Result<(), ControllerError> {
        let (router, incoming) = RouterSocket::bind(&self.config.endpoint).await?;
        let router = Arc::new(router);
        let (dispatcher, queues) = Dispatcher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.arbiter),
            Arc::clone(&router) as Arc<dyn Outbound>,
        );

        if let Some(multicast) = &self.config.multicast_endpoint {
            let responder = DiscoveryResponder::bind(multicast, router.endpoint()).await?;
            self.discovery = Some(responder);
        }

        self.bound = Some(Bound {
            router,
            incoming,
            dispatcher,
            queues,
        });
        Ok(())
    }

    /// Initializes, schedules the health check and installs signal
    /// handlers.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        self.initialize().await?;

        let delay = self.config.check_delay;
        let mut ticker = interval_at(Instant::now() + delay, delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.started = true;

        let signals =
            SignalHandler::install(Arc::clone(&self.arbiter)).map_err(ControllerError::Signals)?;
        self.signals = Some(signals);

        info!(
            endpoint = %self.endpoint().map(ToString::to_string).unwrap_or_default(),
            check_delay_ms = delay.as_millis() as u64,
            "Controller started"
        );
        Ok(())
    }

    /// The bound control endpoint (with the actual port for `tcp://...:0`).
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.bound.as_ref().map(|b| b.router.endpoint())
    }

    /// Address of the discovery socket, if any.
    pub fn discovery_addr(&self) -> Option<std::net::SocketAddr> {
        self.discovery.as_ref().and_then(|d| d.local_addr().ok())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Runs the reactor until `shutdown` fires or the router goes away.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let bound = self.bound.as_mut().ok_or(ControllerError::NotInitialized)?;
        let discovery = self.discovery.as_ref();
        let ticker = &mut self.ticker;
        let arbiter = &self.arbiter;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Reactor shutdown requested");
                    break;
                }

                Some(completion) = bound.queues.completions.recv() => {
                    bound.dispatcher.complete(completion).await;
                }

                Some(job) = bound.queues.jobs.recv() => {
                    bound.dispatcher.dispatch(job).await;
                }

                incoming = bound.incoming.recv() => match incoming {
                    Some(Incoming { identity, payload }) => {
                        bound.dispatcher.handle_message(Some(identity), payload);
                    }
                    None => {
                        debug!("Router closed");
                        break;
                    }
                },

                probe = next_probe(discovery) => match probe {
                    Ok(probe) => {
                        if let Some(discovery) = discovery {
                            discovery.handle(probe).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Discovery receive failed"),
                },

                _ = next_tick(ticker) => {
                    arbiter.manage_watchers();
                }
            }
        }

        Ok(())
    }

    /// Shuts the controller down.
    ///
    /// The ticker and control socket are only torn down if the controller
    /// was started; discovery and signal handling always are.
    pub async fn stop(&mut self) {
        if self.started {
            self.ticker = None;
            if let Some(bound) = self.bound.take() {
                bound.router.flush_all().await;
                bound.router.close();
            }
            self.started = false;
            info!("Controller stopped");
        }

        self.discovery = None;
        if let Some(signals) = self.signals.take() {
            signals.stop();
        }
    }
}

async fn next_probe(discovery: Option<&DiscoveryResponder>) -> std::io::Result<Probe> {
    match discovery {
        Some(discovery) => discovery.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
