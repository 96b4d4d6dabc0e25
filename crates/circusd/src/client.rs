//! Control client for a running daemon.
//!
//! One connection per call: the request line is written, one response line
//! is read back. Casts are written and the connection closed.
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()`, `panic!()` outside
//! tests.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use circus_protocol::{
    ControlMessage, DiscoveryReply, Endpoint, MulticastEndpoint, Properties, Response,
    MAX_DISCOVERY_DATAGRAM, MAX_MESSAGE_SIZE,
};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::time::timeout;
use tracing::debug;

/// Default time to wait for a response
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before a response arrived")]
    Closed,

    #[error("response exceeds {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(#[source] serde_json::Error),
}

// ============================================================================
// Client
// ============================================================================

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Client bound to one control endpoint.
#[derive(Debug, Clone)]
pub struct CircusClient {
    endpoint: Endpoint,
    timeout: Duration,
}

impl CircusClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn Transport>, ClientError> {
        let connect_error = |source| ClientError::Connect {
            endpoint: self.endpoint.clone(),
            source,
        };
        let connect = async {
            let stream: Box<dyn Transport> = match &self.endpoint {
                Endpoint::Tcp(address) => {
                    Box::new(TcpStream::connect(address.as_str()).await.map_err(connect_error)?)
                }
                Endpoint::Ipc(path) => Box::new(UnixStream::connect(path).await.map_err(connect_error)?),
            };
            Ok(stream)
        };
        timeout(self.timeout, connect)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    /// Sends a request and waits for its response.
    pub async fn call(&self, message: &ControlMessage) -> Result<Response, ClientError> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, message).await?;

        let read = async {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            if line.len() > MAX_MESSAGE_SIZE {
                return Err(ClientError::TooLarge);
            }
            Response::parse(line.trim_ascii()).map_err(ClientError::InvalidResponse)
        };

        let response = timeout(self.timeout, read)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        debug!(command = %message.command, ok = response.is_ok(), "Response received");
        Ok(response)
    }

    /// Sends `command` with `properties` as a request, with a fresh id.
    pub async fn command(
        &self,
        command: &str,
        properties: Properties,
    ) -> Result<Response, ClientError> {
        let mut message = ControlMessage::new(next_id(), command);
        message.properties = properties;
        self.call(&message).await
    }

    /// Sends a fire-and-forget message.
    pub async fn cast(&self, message: &ControlMessage) -> Result<(), ClientError> {
        let mut message = message.clone();
        message.msg_type = circus_protocol::MsgType::Cast;

        let mut stream = self.connect().await?;
        write_frame(&mut stream, &message).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

fn next_id() -> Value {
    let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    Value::String(format!("{}-{n}", std::process::id()))
}

async fn write_frame<W>(writer: &mut W, message: &ControlMessage) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = message.to_frame().map_err(ClientError::Encode)?;
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Probes a discovery address and returns the first daemon endpoint that
/// answers.
pub async fn discover(
    multicast: &MulticastEndpoint,
    wait: Duration,
) -> Result<DiscoveryReply, ClientError> {
    let target = multicast.addr();
    let local = match target.ip() {
        IpAddr::V4(ip) if ip.is_loopback() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    };

    let socket = UdpSocket::bind(local).await?;
    if !multicast.is_multicast() && target.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.send_to(b"{}", target).await?;

    let mut buffer = vec![0u8; MAX_DISCOVERY_DATAGRAM];
    let (len, from) = timeout(wait, socket.recv_from(&mut buffer))
        .await
        .map_err(|_| ClientError::Timeout(wait))??;
    debug!(from = %from, "Discovery reply received");

    let payload = buffer.get(..len).unwrap_or_default();
    serde_json::from_slice(payload).map_err(ClientError::InvalidResponse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(next_id(), next_id());
    }

    #[tokio::test]
    async fn test_call_reads_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            let reply = format!(
                "{{\"id\": {}, \"status\": \"ok\", \"echo\": {}}}\n",
                request["id"], request["command"]
            );
            reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
        });

        let client = CircusClient::new(Endpoint::Ipc(path));
        let response = client.command("list", Properties::new()).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.get("echo"), Some(&Value::from("list")));
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client =
            CircusClient::new(Endpoint::Ipc(path)).with_timeout(Duration::from_millis(100));
        let err = client.command("list", Properties::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let client = CircusClient::new(Endpoint::Ipc("/nonexistent/circus.sock".into()));
        let err = client.command("list", Properties::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
