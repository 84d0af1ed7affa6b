use serde_json::Value;
use thiserror::Error;
use tonic::{Code, Status};

use crate::packet::NO_MESSAGE_HANDLER;

/// Errors that can occur while dispatching or calling patterns.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The remote side has no handler registered for the pattern.
    #[error("{NO_MESSAGE_HANDLER} (pattern: {0})")]
    NoMatchingPattern(String),

    /// An inbound frame or envelope could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A handler failed. The value is the error payload sent over the wire.
    #[error("handler error: {0}")]
    Handler(Value),

    /// The transport failed. Every call pending on the connection receives this.
    #[error("connection error: {0}")]
    Connection(String),

    /// The call was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// The call was still in flight when the proxy was closed.
    #[error("connection closed")]
    Closed,

    /// The call completed without producing a value.
    #[error("call completed without a reply")]
    NoReply,

    /// A frame exceeded the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Failed to encode or decode a JSON payload.
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// An I/O error on a socket.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Failed to establish a gRPC channel.
    #[error("gRPC transport error")]
    GrpcTransport(#[from] tonic::transport::Error),

    /// An error from the NATS client.
    #[error("NATS error: {0}")]
    Nats(String),
}

impl RpcError {
    /// Build a handler error from any JSON-convertible value.
    pub fn handler(err: impl Into<Value>) -> Self {
        Self::Handler(err.into())
    }

    pub fn nats(err: impl std::fmt::Display) -> Self {
        Self::Nats(err.to_string())
    }

    /// Whether this error marks a deliberately cancelled call rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The `err` value placed in a reply packet.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Handler(value) => value.clone(),
            Self::NoMatchingPattern(_) => Value::String(NO_MESSAGE_HANDLER.to_string()),
            other => Value::String(other.to_string()),
        }
    }

    /// Rebuild an error from the `err` value of a reply packet.
    pub fn from_wire(err: Value) -> Self {
        match err {
            Value::String(message) if message == NO_MESSAGE_HANDLER => {
                Self::NoMatchingPattern(String::new())
            }
            other => Self::Handler(other),
        }
    }

    /// Classify a gRPC status by its code.
    ///
    /// Handler errors carry their JSON error value in the status details; when the
    /// details are absent the status message is used instead.
    pub fn from_status(status: &Status) -> Self {
        match status.code() {
            Code::Cancelled => Self::Cancelled,
            Code::Unimplemented => Self::NoMatchingPattern(status.message().to_string()),
            Code::Unavailable => Self::Connection(status.message().to_string()),
            Code::InvalidArgument => Self::MalformedFrame(status.message().to_string()),
            _ => match serde_json::from_slice::<Value>(status.details()) {
                Ok(value) => Self::from_wire(value),
                Err(_) => Self::Handler(Value::String(status.message().to_string())),
            },
        }
    }

    /// Convert a reply error value into the status returned by a gRPC method.
    pub fn wire_to_status(err: &Value) -> Status {
        match err {
            Value::String(message) if message == NO_MESSAGE_HANDLER => {
                Status::unimplemented(NO_MESSAGE_HANDLER)
            }
            other => {
                let message = match other {
                    Value::String(message) => message.clone(),
                    value => value.to_string(),
                };
                let details = serde_json::to_vec(other).unwrap_or_default();
                Status::with_details(Code::Unknown, message, details.into())
            }
        }
    }
}
