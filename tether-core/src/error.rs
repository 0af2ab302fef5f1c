//! Error taxonomy for the client pipeline.
//!
//! Everything delivered to a caller is a [`ClientError`] carrying the
//! original cause for diagnostics. [`ErrorShape`] is the structured error
//! envelope a server puts on the wire.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Structured error code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    Conflict,
    PreconditionFailed,
    PayloadTooLarge,
    MethodNotSupported,
    UnprocessableContent,
    TooManyRequests,
    ClientClosedRequest,
    InternalServerError,
    /// Catch-all for codes introduced after this client was built, so a
    /// newer server cannot make a response frame undecodable.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::MethodNotSupported => "METHOD_NOT_SUPPORTED",
            ErrorCode::UnprocessableContent => "UNPROCESSABLE_CONTENT",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::ClientClosedRequest => "CLIENT_CLOSED_REQUEST",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// The error envelope: `{ code, message, data? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorShape {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ErrorShape {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorShape {}

/// Original cause kept for diagnostics; `Arc` so errors stay cloneable
/// through observable fan-out.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure a caller can observe, in one shape.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Connection refused, timed out, or otherwise failed mid-flight.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        cause: Option<Cause>,
    },
    /// The connection went away while a query/mutation was in flight.
    #[error("connection closed prematurely")]
    ClosedPrematurely,
    /// Malformed envelope, parse failure, or unexpected stream shape.
    #[error("protocol error: {message}")]
    Protocol { message: String },
    /// Structured server error.
    #[error("rpc error: {0}")]
    Rpc(ErrorShape),
    /// User-initiated cancellation; never surfaced to its own initiator.
    #[error("operation cancelled")]
    Cancelled,
    /// Broken pipeline configuration, e.g. a chain without a terminal link.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl ClientError {
    pub fn transport(message: impl Into<String>) -> Self {
        ClientError::Transport {
            message: message.into(),
            cause: None,
        }
    }

    pub fn transport_with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ClientError::Transport {
            message: message.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ClientError::Config {
            message: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Transport { .. } | ClientError::ClosedPrematurely
        )
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, ClientError::Protocol { .. })
    }

    pub fn is_rpc(&self) -> bool {
        matches!(self, ClientError::Rpc(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }

    /// The wire error shape, when this came from the server.
    pub fn shape(&self) -> Option<&ErrorShape> {
        match self {
            ClientError::Rpc(shape) => Some(shape),
            _ => None,
        }
    }

    /// The original cause, when one was recorded.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            ClientError::Transport {
                cause: Some(cause), ..
            } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<ErrorShape> for ClientError {
    fn from(shape: ErrorShape) -> Self {
        ClientError::Rpc(shape)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::protocol(format!("JSON error: {}", err))
    }
}
