//! Wire format of requests and replies.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reply header carrying the handler's status code.
pub const STATUS_CODE_HEADER: &str = "StatusCode";

/// Reply header carrying the [`ErrorKind`] of an error reply.
pub const ERROR_KIND_HEADER: &str = "ErrorKind";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Status assumed when a reply carries no `StatusCode` header.
pub const DEFAULT_STATUS: u16 = 200;

/// Why a server answered with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HandlerNotFound,
    HandlerFailed,
    InvalidRequest,
}

impl ErrorKind {
    /// Default status code for this kind of failure.
    pub const fn status(self) -> u16 {
        match self {
            Self::HandlerNotFound => 404,
            Self::HandlerFailed => 500,
            Self::InvalidRequest => 400,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HandlerNotFound => "handler_not_found",
            Self::HandlerFailed => "handler_failed",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a reply.
///
/// Peers that predate the tagged form reply with the bare result; those
/// bodies decode as [`ReplyBody::Ok`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplyBody {
    Ok { result: Value },
    Error { kind: ErrorKind, message: String },
}

impl ReplyBody {
    pub fn ok(result: Value) -> Self {
        Self::Ok { result }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // A Value-only enum always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let tagged = value
            .get("outcome")
            .and_then(Value::as_str)
            .is_some_and(|outcome| outcome == "ok" || outcome == "error");
        if tagged {
            if let Ok(body) = serde_json::from_value::<Self>(value.clone()) {
                return Ok(body);
            }
        }
        Ok(Self::Ok { result: value })
    }
}

/// Request body for envelope dispatch: the code travels with the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub message_code: String,
    #[serde(default)]
    pub payload: Value,
}

/// Token pairing a reply with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// A fresh random (v4) identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns true if a received correlation-id property names this call.
    pub fn matches(&self, received: Option<&str>) -> bool {
        received
            .and_then(|s| Uuid::parse_str(s).ok())
            .is_some_and(|id| id == self.0)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
