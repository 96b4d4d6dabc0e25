//! Outbound responses and the stable error codes.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Error codes carried in the `errno` field of error responses.
///
/// The integer values are part of the wire contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No explicit code was given.
    NotSpecified,
    /// The payload is not valid JSON.
    InvalidJson,
    /// The command is not in the registry.
    UnknownCommand,
    /// Domain-level, user-facing failure (bad properties, illegal state).
    MessageError,
    /// An OS operation triggered by the command failed.
    OsError,
    /// Any other failure while validating or executing.
    CommandError,
    /// The command returned something other than a mapping, sequence or null.
    BadMsgDataError,
}

impl ErrorCode {
    /// All codes, in wire order.
    pub const ALL: [ErrorCode; 7] = [
        Self::NotSpecified,
        Self::InvalidJson,
        Self::UnknownCommand,
        Self::MessageError,
        Self::OsError,
        Self::CommandError,
        Self::BadMsgDataError,
    ];

    /// Integer value on the wire.
    pub const fn code(self) -> i64 {
        match self {
            Self::NotSpecified => 1,
            Self::InvalidJson => 2,
            Self::UnknownCommand => 3,
            Self::MessageError => 4,
            Self::OsError => 5,
            Self::CommandError => 6,
            Self::BadMsgDataError => 7,
        }
    }

    /// Looks up a code by its wire value.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Symbolic name, as used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotSpecified => "NOT_SPECIFIED",
            Self::InvalidJson => "INVALID_JSON",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::MessageError => "MESSAGE_ERROR",
            Self::OsError => "OS_ERROR",
            Self::CommandError => "COMMAND_ERROR",
            Self::BadMsgDataError => "BAD_MSG_DATA_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown errno {code}")))
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// A response document.
///
/// Success responses carry arbitrary command fields next to `status`;
/// error responses carry `reason`, `tb` and `errno`. Both carry `id` and
/// `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response {
    fields: Map<String, Value>,
}

impl Response {
    /// Creates a success response from command fields.
    ///
    /// `status` and `time` are always set by the daemon, overriding any
    /// field of the same name.
    pub fn ok(fields: Map<String, Value>) -> Self {
        let mut response = Self { fields };
        response.set_status(Status::Ok);
        response
    }

    /// Creates an error response.
    pub fn error(reason: impl Into<String>, tb: Option<String>, errno: ErrorCode) -> Self {
        let mut fields = Map::new();
        fields.insert("reason".to_string(), Value::String(reason.into()));
        fields.insert("tb".to_string(), tb.map(Value::String).unwrap_or(Value::Null));
        fields.insert("errno".to_string(), Value::from(errno.code()));
        let mut response = Self { fields };
        response.set_status(Status::Error);
        response
    }

    fn set_status(&mut self, status: Status) {
        let status = match status {
            Status::Ok => "ok",
            Status::Error => "error",
        };
        self.fields
            .insert("status".to_string(), Value::String(status.to_string()));
        let now = Utc::now();
        let time = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
        self.fields.insert("time".to_string(), Value::from(time));
    }

    /// Stamps the correlation id.
    pub fn with_id(mut self, id: Value) -> Self {
        self.fields.insert("id".to_string(), id);
        self
    }

    /// Parses a response frame.
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Serializes the response as a single frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Returns the status, if present and well-formed.
    pub fn status(&self) -> Option<Status> {
        match self.fields.get("status").and_then(Value::as_str) {
            Some("ok") => Some(Status::Ok),
            Some("error") => Some(Status::Error),
            _ => None,
        }
    }

    /// Returns true for success responses.
    pub fn is_ok(&self) -> bool {
        self.status() == Some(Status::Ok)
    }

    /// Echoed correlation id (`null` when unset).
    pub fn id(&self) -> &Value {
        self.fields.get("id").unwrap_or(&Value::Null)
    }

    /// Error reason.
    pub fn reason(&self) -> Option<&str> {
        self.fields.get("reason").and_then(Value::as_str)
    }

    /// Error traceback.
    pub fn tb(&self) -> Option<&str> {
        self.fields.get("tb").and_then(Value::as_str)
    }

    /// Error code.
    pub fn errno(&self) -> Option<ErrorCode> {
        self.fields
            .get("errno")
            .and_then(Value::as_i64)
            .and_then(ErrorCode::from_code)
    }

    /// Looks up any field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_code_values_are_stable() {
        assert_eq!(ErrorCode::NotSpecified.code(), 1);
        assert_eq!(ErrorCode::InvalidJson.code(), 2);
        assert_eq!(ErrorCode::UnknownCommand.code(), 3);
        assert_eq!(ErrorCode::MessageError.code(), 4);
        assert_eq!(ErrorCode::OsError.code(), 5);
        assert_eq!(ErrorCode::CommandError.code(), 6);
        assert_eq!(ErrorCode::BadMsgDataError.code(), 7);
    }

    #[test]
    fn test_error_code_lookup() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(42), None);
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::error("boom", None, ErrorCode::OsError).with_id(json!("x"));
        let value: Value = serde_json::from_slice(&response.to_bytes().unwrap()).unwrap();

        assert_eq!(value["id"], json!("x"));
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["reason"], json!("boom"));
        assert_eq!(value["tb"], Value::Null);
        assert_eq!(value["errno"], json!(5));
        assert!(value["time"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_ok_response_keeps_fields() {
        let mut fields = Map::new();
        fields.insert("numprocesses".to_string(), json!(3));
        fields.insert("status".to_string(), json!("bogus"));

        let response = Response::ok(fields).with_id(Value::Null);
        assert!(response.is_ok());
        assert_eq!(response.get("numprocesses"), Some(&json!(3)));
        assert_eq!(response.id(), &Value::Null);
    }

    #[test]
    fn test_parse_roundtrip_accessors() {
        let response = Response::error("nope", Some("trace".into()), ErrorCode::CommandError)
            .with_id(json!(12));
        let parsed = Response::parse(&response.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed.status(), Some(Status::Error));
        assert_eq!(parsed.reason(), Some("nope"));
        assert_eq!(parsed.tb(), Some("trace"));
        assert_eq!(parsed.errno(), Some(ErrorCode::CommandError));
        assert_eq!(parsed.id(), &json!(12));
    }

    #[test]
    fn test_error_code_serde() {
        let json = serde_json::to_string(&ErrorCode::UnknownCommand).unwrap();
        assert_eq!(json, "3");
        let code: ErrorCode = serde_json::from_str("7").unwrap();
        assert_eq!(code, ErrorCode::BadMsgDataError);
        assert!(serde_json::from_str::<ErrorCode>("99").is_err());
    }
}
