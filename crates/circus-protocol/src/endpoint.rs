//! Endpoint URLs.
//!
//! Control endpoints are `tcp://host:port` or `ipc:///path/to/socket`.
//! Discovery endpoints are `udp://address:port`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Default control endpoint.
pub const DEFAULT_ENDPOINT: &str = "tcp://127.0.0.1:5555";

/// Default discovery endpoint (multicast group).
pub const DEFAULT_MULTICAST_ENDPOINT: &str = "udp://237.219.251.97:12027";

/// A control socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP, `host:port` (host may be a name)
    Tcp(String),
    /// Unix domain socket
    Ipc(PathBuf),
}

impl Endpoint {
    /// Returns the TCP address part, if this is a TCP endpoint.
    pub fn tcp_address(&self) -> Option<&str> {
        match self {
            Self::Tcp(addr) => Some(addr),
            Self::Ipc(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = split_scheme(s)?;
        match scheme {
            "tcp" => {
                let (host, port) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
                if host.is_empty() {
                    return Err(EndpointError::MissingHost(s.to_string()));
                }
                port.parse::<u16>()
                    .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;
                Ok(Self::Tcp(rest.to_string()))
            }
            "ipc" => {
                if rest.is_empty() {
                    return Err(EndpointError::MissingPath(s.to_string()));
                }
                Ok(Self::Ipc(PathBuf::from(rest)))
            }
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Tcp("127.0.0.1:5555".to_string())
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A UDP discovery endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastEndpoint {
    addr: SocketAddr,
}

impl MulticastEndpoint {
    /// Creates an endpoint from a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Group (or broadcast) address and port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns true if the address is a multicast group.
    pub fn is_multicast(&self) -> bool {
        self.addr.ip().is_multicast()
    }
}

impl FromStr for MulticastEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = split_scheme(s)?;
        if scheme != "udp" {
            return Err(EndpointError::UnsupportedScheme(scheme.to_string()));
        }
        let addr = rest
            .parse::<SocketAddr>()
            .map_err(|_| EndpointError::InvalidAddress(s.to_string()))?;
        Ok(Self { addr })
    }
}

impl fmt::Display for MulticastEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp://{}", self.addr)
    }
}

impl Serialize for MulticastEndpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MulticastEndpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn split_scheme(s: &str) -> Result<(&str, &str), EndpointError> {
    s.split_once("://")
        .ok_or_else(|| EndpointError::MissingScheme(s.to_string()))
}

/// Errors that can occur while parsing an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("missing scheme in endpoint {0:?} (expected tcp://, ipc:// or udp://)")]
    MissingScheme(String),

    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing port in endpoint {0:?}")]
    MissingPort(String),

    #[error("missing host in endpoint {0:?}")]
    MissingHost(String),

    #[error("invalid port in endpoint {0:?}")]
    InvalidPort(String),

    #[error("missing socket path in endpoint {0:?}")]
    MissingPath(String),

    #[error("invalid address in endpoint {0:?}")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let endpoint: Endpoint = "tcp://127.0.0.1:5555".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:5555".to_string()));
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:5555");
        assert_eq!(endpoint.tcp_address(), Some("127.0.0.1:5555"));
    }

    #[test]
    fn test_parse_ipc() {
        let endpoint: Endpoint = "ipc:///tmp/circus.sock".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Ipc(PathBuf::from("/tmp/circus.sock")));
        assert_eq!(endpoint.to_string(), "ipc:///tmp/circus.sock");
    }

    #[test]
    fn test_default_matches_constant() {
        assert_eq!(Endpoint::default().to_string(), DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "127.0.0.1:5555".parse::<Endpoint>(),
            Err(EndpointError::MissingScheme(_))
        ));
        assert!(matches!(
            "http://localhost:80".parse::<Endpoint>(),
            Err(EndpointError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "tcp://localhost".parse::<Endpoint>(),
            Err(EndpointError::MissingPort(_))
        ));
        assert!(matches!(
            "tcp://localhost:http".parse::<Endpoint>(),
            Err(EndpointError::InvalidPort(_))
        ));
        assert!(matches!(
            "ipc://".parse::<Endpoint>(),
            Err(EndpointError::MissingPath(_))
        ));
    }

    #[test]
    fn test_parse_multicast() {
        let endpoint: MulticastEndpoint = DEFAULT_MULTICAST_ENDPOINT.parse().unwrap();
        assert!(endpoint.is_multicast());
        assert_eq!(endpoint.addr().port(), 12027);
        assert_eq!(endpoint.to_string(), DEFAULT_MULTICAST_ENDPOINT);

        let broadcast: MulticastEndpoint = "udp://255.255.255.255:9999".parse().unwrap();
        assert!(!broadcast.is_multicast());

        assert!("tcp://1.2.3.4:5".parse::<MulticastEndpoint>().is_err());
        assert!("udp://nope".parse::<MulticastEndpoint>().is_err());
    }

    #[test]
    fn test_endpoint_serde() {
        let endpoint: Endpoint = serde_json::from_str("\"ipc:///run/c.sock\"").unwrap();
        assert_eq!(endpoint, Endpoint::Ipc(PathBuf::from("/run/c.sock")));
        assert!(serde_json::from_str::<Endpoint>("\"bogus\"").is_err());
    }
}
