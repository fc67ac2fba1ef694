// ABOUTME: Transport error taxonomy and the recoverable/fatal classification used for retries.
// ABOUTME: Errors are cloneable so one failure can be reported for every record of a batch.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("refusing to call non-https url: {0}")]
    InsecureUrl(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    #[error("http status {status}: {payload}")]
    Http { status: u16, payload: String },

    #[error("failed to build request body: {0}")]
    Serialization(String),

    #[error("http client is closed")]
    Closed,

    #[error("too many concurrent calls, request rejected")]
    Rejected,

    #[error("failed to build http client: {0}")]
    Client(String),
}

impl TransportError {
    /// Whether the failed request may succeed later without any change on our side.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Connection(_)
            | TransportError::Timeout
            | TransportError::Closed
            | TransportError::Rejected => true,
            TransportError::Http { status, .. } => is_recoverable_status(*status),
            TransportError::InvalidUrl(_)
            | TransportError::InsecureUrl(_)
            | TransportError::Serialization(_)
            | TransportError::Client(_) => false,
        }
    }

    /// The HTTP status, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// 5xx (except 501 and 505), 408 and 429 are worth retrying.
pub fn is_recoverable_status(status: u16) -> bool {
    match status {
        501 | 505 => false,
        500..=599 => true,
        408 | 429 => true,
        _ => false,
    }
}
