//! Inbound control messages.
//!
//! Messages are parsed in two stages so that a request id can still be
//! echoed back when the rest of the document is malformed:
//! bytes -> `serde_json::Value` (failure = invalid JSON), then
//! `Value` -> [`ControlMessage`] (failure = malformed message).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Command properties: an arbitrary JSON object.
pub type Properties = Map<String, Value>;

/// Whether the sender expects a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    /// Request: exactly one response is sent back.
    #[default]
    Req,
    /// Fire-and-forget: no response is ever sent, even on error.
    Cast,
}

impl MsgType {
    /// Interprets a raw `msg_type` field. Only `"cast"` means cast.
    fn from_field(value: Option<&Value>) -> Self {
        match value.and_then(Value::as_str) {
            Some("cast") => Self::Cast,
            _ => Self::Req,
        }
    }
}

/// A command sent by a control client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Opaque correlation token, echoed verbatim in the response.
    #[serde(default)]
    pub id: Value,

    /// Command name (case-insensitive on the daemon side).
    pub command: String,

    /// Command arguments.
    #[serde(default)]
    pub properties: Properties,

    /// Request or cast.
    #[serde(default)]
    pub msg_type: MsgType,
}

impl ControlMessage {
    /// Creates a request with no properties.
    pub fn new(id: impl Into<Value>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            properties: Properties::new(),
            msg_type: MsgType::Req,
        }
    }

    /// Creates a cast (fire-and-forget) message.
    pub fn cast(command: impl Into<String>) -> Self {
        Self {
            id: Value::Null,
            command: command.into(),
            properties: Properties::new(),
            msg_type: MsgType::Cast,
        }
    }

    /// Adds a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns true if no response should be sent.
    pub fn is_cast(&self) -> bool {
        self.msg_type == MsgType::Cast
    }

    /// Parses a raw frame.
    ///
    /// Unlike the derived `Deserialize`, this is lenient about `msg_type`
    /// (anything other than `"cast"` is a request) and reports the id of
    /// malformed messages so the error can still be correlated.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Builds a message from an already-parsed JSON document.
    pub fn from_value(value: Value) -> Result<Self, ParseError> {
        let Value::Object(mut object) = value else {
            return Err(ParseError::Malformed {
                id: Value::Null,
                msg_type: MsgType::Req,
                reason: "message must be a JSON object".to_string(),
            });
        };

        let id = object.remove("id").unwrap_or(Value::Null);
        let msg_type = MsgType::from_field(object.get("msg_type"));

        let command = match object.remove("command") {
            Some(Value::String(command)) => command,
            Some(other) => {
                return Err(ParseError::Malformed {
                    id,
                    msg_type,
                    reason: format!("command must be a string, got {other}"),
                })
            }
            None => {
                return Err(ParseError::Malformed {
                    id,
                    msg_type,
                    reason: "missing command".to_string(),
                })
            }
        };

        let properties = match object.remove("properties") {
            None | Some(Value::Null) => Properties::new(),
            Some(Value::Object(properties)) => properties,
            Some(other) => {
                return Err(ParseError::Malformed {
                    id,
                    msg_type,
                    reason: format!("properties must be a mapping, got {other}"),
                })
            }
        };

        Ok(Self {
            id,
            command,
            properties,
            msg_type,
        })
    }

    /// Serializes the message as a single frame (without the trailing newline).
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Errors raised while parsing an inbound frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// The frame is not valid UTF-8 JSON.
    #[error("json invalid: {0}")]
    InvalidJson(String),

    /// Valid JSON, but not a valid control message.
    #[error("{reason}")]
    Malformed {
        /// The id found in the document, if any
        id: Value,
        /// The message type found in the document
        msg_type: MsgType,
        /// Human readable explanation
        reason: String,
    },
}

/// Reply to a discovery probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReply {
    /// Control endpoint of the answering daemon
    pub endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_message() {
        let raw = br#"{"id": "abc", "command": "list", "properties": {"name": "web"}, "msg_type": "req"}"#;
        let msg = ControlMessage::parse(raw).unwrap();
        assert_eq!(msg.id, json!("abc"));
        assert_eq!(msg.command, "list");
        assert_eq!(msg.properties.get("name"), Some(&json!("web")));
        assert!(!msg.is_cast());
    }

    #[test]
    fn test_parse_defaults() {
        let msg = ControlMessage::parse(br#"{"command": "quit"}"#).unwrap();
        assert_eq!(msg.id, Value::Null);
        assert!(msg.properties.is_empty());
        assert_eq!(msg.msg_type, MsgType::Req);
    }

    #[test]
    fn test_unknown_msg_type_is_request() {
        let msg = ControlMessage::parse(br#"{"command": "list", "msg_type": "whatever"}"#).unwrap();
        assert_eq!(msg.msg_type, MsgType::Req);

        let msg = ControlMessage::parse(br#"{"command": "list", "msg_type": "cast"}"#).unwrap();
        assert!(msg.is_cast());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            ControlMessage::parse(b"{not json"),
            Err(ParseError::InvalidJson(_))
        ));
        assert!(matches!(
            ControlMessage::parse(&[0xff, 0xfe, 0x00]),
            Err(ParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_missing_command_keeps_id() {
        match ControlMessage::parse(br#"{"id": 7, "msg_type": "cast"}"#) {
            Err(ParseError::Malformed { id, msg_type, reason }) => {
                assert_eq!(id, json!(7));
                assert_eq!(msg_type, MsgType::Cast);
                assert!(reason.contains("missing command"));
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_non_object_properties_rejected() {
        let result = ControlMessage::parse(br#"{"id": 1, "command": "list", "properties": [1]}"#);
        assert!(matches!(result, Err(ParseError::Malformed { .. })));
    }

    #[test]
    fn test_non_object_document_rejected() {
        let result = ControlMessage::parse(b"[1, 2, 3]");
        assert!(matches!(result, Err(ParseError::Malformed { id: Value::Null, .. })));
    }

    #[test]
    fn test_builder_serialization() {
        let msg = ControlMessage::new("req-1", "incr").with_property("name", "web");
        let frame = msg.to_frame().unwrap();
        assert!(frame.contains("\"command\":\"incr\""));
        assert!(frame.contains("\"msg_type\":\"req\""));

        let parsed = ControlMessage::parse(frame.as_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_cast_builder() {
        let msg = ControlMessage::cast("quit");
        assert!(msg.is_cast());
        assert!(msg.to_frame().unwrap().contains("\"msg_type\":\"cast\""));
    }
}
