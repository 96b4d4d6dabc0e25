//! circus protocol - wire types for the control socket
//!
//! This crate provides the message types exchanged between control clients
//! (`circusctl`, scripts) and the daemon, plus endpoint parsing shared by
//! both sides.
//!
//! Frames are newline-delimited UTF-8 JSON documents, at most
//! [`MAX_MESSAGE_SIZE`] bytes each.

pub mod endpoint;
pub mod message;
pub mod response;

pub use endpoint::{
    Endpoint, EndpointError, MulticastEndpoint, DEFAULT_ENDPOINT, DEFAULT_MULTICAST_ENDPOINT,
};
pub use message::{ControlMessage, DiscoveryReply, MsgType, ParseError, Properties};
pub use response::{ErrorCode, Response, Status};

/// Maximum size of a single control frame (1 MB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Maximum size of a discovery datagram.
pub const MAX_DISCOVERY_DATAGRAM: usize = 1024;
