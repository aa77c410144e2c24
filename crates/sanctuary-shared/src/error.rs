use thiserror::Error;

/// Failure to establish or keep a realtime subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Realtime transport unreachable: {0}")]
    Unreachable(String),

    #[error("Subscription rejected by backend: {0}")]
    Rejected(String),

    #[error("Timed out waiting for subscription reply")]
    Timeout,

    #[error("Realtime transport closed")]
    Closed,
}

/// Failure to fetch a room snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Malformed row: {0}")]
    Decode(#[from] DecodeError),
}

/// Failure to submit a message. One taxonomy for every write path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Sign in required")]
    Unauthenticated,

    #[error("Permission denied: {0}")]
    Forbidden(String),

    /// Retryable by the caller; never retried internally.
    #[error("Temporary failure: {0}")]
    Transient(String),

    #[error("Rejected by backend: {0}")]
    Rejected(String),

    #[error("Message body is empty")]
    EmptyBody,
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// A backend row could not be turned into a domain record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Invalid value for column {column}: {reason}")]
    InvalidColumn { column: String, reason: String },

    #[error("Expected a JSON object row")]
    NotAnObject,
}
