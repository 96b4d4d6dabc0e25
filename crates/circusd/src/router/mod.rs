//! Router socket: the controller's request/reply endpoint.
//!
//! Many clients connect to one bound endpoint (TCP or a Unix socket). Each
//! connection gets an opaque [`ClientIdentity`]; inbound frames reach the
//! controller as [`Incoming`] messages tagged with it, and replies are
//! routed back with [`Outbound::send`]. Frames are newline delimited JSON.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   RouterSocket   │
//! │ Tcp/UnixListener │
//! └────────┬─────────┘
//!          │ accept()
//!          ▼
//! ┌──────────────────┐   Incoming    ┌──────────────────┐
//! │ reader (per peer)│──────────────▶│    Controller    │
//! └──────────────────┘               └────────┬─────────┘
//! ┌──────────────────┐   Outgoing             │
//! │ writer (per peer)│◀───────────────────────┘
//! └──────────────────┘   send / flush
//! ```
//!
//! Replies to a peer that has gone away are dropped, like a ZeroMQ router
//! drops messages for unknown identities.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Accept errors are logged and the listener keeps going

mod connection;

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use circus_protocol::Endpoint;
use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use connection::Outgoing;

/// How long [`Outbound::flush`] waits for a peer's queue to drain
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Back-off after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type PeerMap = HashMap<ClientIdentity, mpsc::UnboundedSender<Outgoing>>;

// ============================================================================
// Messages
// ============================================================================

/// Opaque identity of a connected client.
///
/// Identities attached to [`Incoming`] frames hold a lease on their peer:
/// the peer stays registered until its reader has finished and every such
/// identity (queued jobs, deferred commands) has been dropped. A client
/// that half-closes its side after a request still gets the reply.
/// Equality and hashing only look at the identity bytes.
#[derive(Clone)]
pub struct ClientIdentity {
    id: Bytes,
    lease: Option<Arc<PeerLease>>,
}

impl ClientIdentity {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            id: bytes.into(),
            lease: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.id
    }

    fn from_counter(n: u64) -> Self {
        Self::new(format!("client-{n}"))
    }

    /// Same identity, without the lease.
    fn detached(&self) -> Self {
        Self::new(self.id.clone())
    }

    /// Same identity, unregistered from `peers` once the last leased copy
    /// is dropped.
    fn leased(&self, peers: &Arc<Mutex<PeerMap>>) -> Self {
        Self {
            id: self.id.clone(),
            lease: Some(Arc::new(PeerLease {
                identity: self.detached(),
                peers: Arc::downgrade(peers),
            })),
        }
    }
}

impl PartialEq for ClientIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientIdentity {}

impl Hash for ClientIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientIdentity").field(&self.id).finish()
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.id))
    }
}

/// Unregisters a peer when dropped. Dropping the peer's sender lets its
/// writer drain what is queued and shut the stream down.
struct PeerLease {
    identity: ClientIdentity,
    peers: Weak<Mutex<PeerMap>>,
}

impl Drop for PeerLease {
    fn drop(&mut self) {
        if let Some(peers) = self.peers.upgrade() {
            let removed = peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.identity);
            if removed.is_some() {
                debug!(peer = %self.identity, "Peer disconnected");
            }
        }
    }
}

/// A frame received from a client.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub identity: ClientIdentity,
    pub payload: Bytes,
}

/// A frame addressed to a client.
#[derive(Debug, Clone)]
pub struct Multipart {
    pub identity: ClientIdentity,
    pub payload: Bytes,
}

impl Multipart {
    pub fn new(identity: ClientIdentity, payload: impl Into<Bytes>) -> Self {
        Self {
            identity,
            payload: payload.into(),
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Errors raised by the router transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("unknown peer {0}")]
    UnknownPeer(ClientIdentity),

    #[error("router socket closed")]
    Closed,

    #[error("flush to {0} timed out")]
    FlushTimeout(ClientIdentity),
}

/// Reply path used by the dispatcher.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Queues a frame for a peer. Never blocks.
    fn send(&self, message: Multipart) -> Result<(), TransportError>;

    /// Waits until every frame queued for `identity` has been written.
    async fn flush(&self, identity: &ClientIdentity) -> Result<(), TransportError>;
}

// ============================================================================
// Router socket
// ============================================================================

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// The bound router endpoint.
///
/// Dropping the socket stops accepting and disconnects every peer.
pub struct RouterSocket {
    endpoint: Endpoint,
    ipc_path: Option<PathBuf>,
    peers: Arc<Mutex<PeerMap>>,
    cancel: CancellationToken,
}

impl RouterSocket {
    /// Binds `endpoint` and starts accepting.
    ///
    /// For `ipc://` endpoints a stale socket file is removed and the parent
    /// directory created. A `tcp://` endpoint with port 0 binds an ephemeral
    /// port; [`RouterSocket::endpoint`] reports the actual one.
    pub async fn bind(
        endpoint: &Endpoint,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Incoming>), TransportError> {
        let bind_error = |source| TransportError::Bind {
            endpoint: endpoint.clone(),
            source,
        };

        let (listener, bound, ipc_path) = match endpoint {
            Endpoint::Tcp(address) => {
                let listener = TcpListener::bind(address.as_str()).await.map_err(bind_error)?;
                let local = listener.local_addr().map_err(bind_error)?;
                (Listener::Tcp(listener), Endpoint::Tcp(local.to_string()), None)
            }
            Endpoint::Ipc(path) => {
                if path.exists() {
                    std::fs::remove_file(path).map_err(bind_error)?;
                }
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).map_err(bind_error)?;
                    }
                }
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                (Listener::Unix(listener), endpoint.clone(), Some(path.clone()))
            }
        };

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let socket = Self {
            endpoint: bound,
            ipc_path,
            peers: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        };

        info!(endpoint = %socket.endpoint, "Router socket listening");
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&socket.peers),
            incoming_tx,
            socket.cancel.clone(),
        ));

        Ok((socket, incoming_rx))
    }

    /// The bound endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    fn peers(&self) -> std::sync::MutexGuard<'_, PeerMap> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flushes every connected peer. Errors are logged and skipped.
    pub async fn flush_all(&self) {
        let identities: Vec<ClientIdentity> = self.peers().keys().cloned().collect();
        for identity in identities {
            if let Err(e) = self.flush(&identity).await {
                debug!(peer = %identity, error = %e, "Flush skipped");
            }
        }
    }

    /// Stops accepting and drops every peer without waiting for pending
    /// frames.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.peers().clear();
        if let Some(path) = &self.ipc_path {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
        info!(endpoint = %self.endpoint, "Router socket closed");
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn queue(&self, identity: &ClientIdentity, item: Outgoing) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let peers = self.peers();
        let sender = peers
            .get(identity)
            .ok_or_else(|| TransportError::UnknownPeer(identity.clone()))?;
        sender
            .send(item)
            .map_err(|_| TransportError::UnknownPeer(identity.clone()))
    }
}

#[async_trait]
impl Outbound for RouterSocket {
    fn send(&self, message: Multipart) -> Result<(), TransportError> {
        self.queue(&message.identity, Outgoing::Frame(message.payload))
    }

    async fn flush(&self, identity: &ClientIdentity) -> Result<(), TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.queue(identity, Outgoing::Flush(ack_tx))?;
        match tokio::time::timeout(FLUSH_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            // Writer ended before reaching the marker
            Ok(Err(_)) => Err(TransportError::UnknownPeer(identity.clone())),
            Err(_) => Err(TransportError::FlushTimeout(identity.clone())),
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: Listener,
    peers: Arc<Mutex<PeerMap>>,
    incoming: mpsc::UnboundedSender<Incoming>,
    cancel: CancellationToken,
) {
    let counter = AtomicU64::new(0);

    loop {
        let accepted = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            accepted = accept(&listener) => accepted,
        };

        let identity = ClientIdentity::from_counter(counter.fetch_add(1, Ordering::Relaxed));
        match accepted {
            Ok(Stream::Tcp(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                connection::spawn(stream, identity, Arc::clone(&peers), incoming.clone(), cancel.clone());
            }
            Ok(Stream::Unix(stream)) => {
                connection::spawn(stream, identity, Arc::clone(&peers), incoming.clone(), cancel.clone());
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("Accept loop stopped");
}

enum Stream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

async fn accept(listener: &Listener) -> io::Result<Stream> {
    match listener {
        Listener::Tcp(l) => l.accept().await.map(|(s, _)| Stream::Tcp(s)),
        Listener::Unix(l) => l.accept().await.map(|(s, _)| Stream::Unix(s)),
    }
}
