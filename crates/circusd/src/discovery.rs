//! Endpoint discovery over UDP.
//!
//! Clients that only know the multicast (or broadcast) address send any
//! JSON document there; every daemon listening answers the sender with its
//! control endpoint.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Bad probes and send failures are logged, never fatal

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use circus_protocol::{DiscoveryReply, Endpoint, MulticastEndpoint, MAX_DISCOVERY_DATAGRAM};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Errors raised while setting up discovery.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to join multicast group {group}: {source}")]
    Join {
        group: IpAddr,
        #[source]
        source: io::Error,
    },

    #[error("IPv6 multicast discovery is not supported: {0}")]
    Ipv6Multicast(IpAddr),
}

/// A probe read from the socket.
#[derive(Debug, Clone)]
pub struct Probe {
    pub payload: Vec<u8>,
    pub sender: SocketAddr,
}

/// Answers discovery probes with the control endpoint.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    reply: Vec<u8>,
}

impl DiscoveryResponder {
    /// Binds the discovery socket.
    ///
    /// A multicast address binds the wildcard address on the group's port
    /// and joins the group. Anything else binds that exact address with
    /// broadcast enabled.
    pub async fn bind(
        multicast: &MulticastEndpoint,
        control: &Endpoint,
    ) -> Result<Self, DiscoveryError> {
        let target = multicast.addr();
        let bind_addr = if multicast.is_multicast() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), target.port())
        } else {
            target
        };
        let bind_error = |source| DiscoveryError::Bind {
            addr: bind_addr,
            source,
        };

        let socket = UdpSocket::bind(bind_addr).await.map_err(bind_error)?;

        match target.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .map_err(|source| DiscoveryError::Join {
                        group: target.ip(),
                        source,
                    })?;
            }
            ip @ IpAddr::V6(v6) if v6.is_multicast() => {
                return Err(DiscoveryError::Ipv6Multicast(ip));
            }
            _ => socket.set_broadcast(true).map_err(bind_error)?,
        }

        let reply = DiscoveryReply {
            endpoint: control.to_string(),
        };
        // Serializing a single string field cannot fail
        let reply = serde_json::to_vec(&reply).unwrap_or_default();

        info!(discovery = %multicast, endpoint = %control, "Discovery responder listening");
        Ok(Self { socket, reply })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Waits for the next probe. Datagrams longer than the receive buffer
    /// are truncated.
    pub async fn recv(&self) -> io::Result<Probe> {
        let mut buffer = vec![0u8; MAX_DISCOVERY_DATAGRAM];
        let (len, sender) = self.socket.recv_from(&mut buffer).await?;
        buffer.truncate(len);
        Ok(Probe {
            payload: buffer,
            sender,
        })
    }

    /// Answers a probe if it is valid JSON.
    pub async fn handle(&self, probe: Probe) {
        if let Err(e) = serde_json::from_slice::<serde_json::Value>(&probe.payload) {
            debug!(sender = %probe.sender, error = %e, "Ignoring invalid discovery probe");
            return;
        }

        match self.socket.send_to(&self.reply, probe.sender).await {
            Ok(_) => debug!(sender = %probe.sender, "Answered discovery probe"),
            Err(e) => warn!(sender = %probe.sender, error = %e, "Failed to answer discovery probe"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn responder() -> DiscoveryResponder {
        let multicast: MulticastEndpoint = "udp://127.0.0.1:0".parse().unwrap();
        let control = Endpoint::Ipc("/tmp/circus-test.sock".into());
        DiscoveryResponder::bind(&multicast, &control).await.unwrap()
    }

    #[tokio::test]
    async fn test_probe_gets_endpoint() {
        let responder = responder().await;
        let target = responder.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"{}", target).await.unwrap();

        let probe = responder.recv().await.unwrap();
        assert_eq!(probe.payload, b"{}");
        responder.handle(probe).await;

        let mut buffer = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let reply: DiscoveryReply = serde_json::from_slice(&buffer[..len]).unwrap();
        assert_eq!(reply.endpoint, "ipc:///tmp/circus-test.sock");
    }

    #[tokio::test]
    async fn test_invalid_probe_is_ignored() {
        let responder = responder().await;
        let target = responder.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"not json", target).await.unwrap();
        let probe = responder.recv().await.unwrap();
        responder.handle(probe).await;

        let mut buffer = [0u8; 256];
        let answer =
            tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buffer)).await;
        assert!(answer.is_err());
    }
}
