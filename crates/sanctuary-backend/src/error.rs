use serde::Deserialize;
use thiserror::Error;

use sanctuary_shared::constants::PERMISSION_DENIED_CODE;
use sanctuary_shared::{FetchError, SendError};

/// A structured failure from a backend data operation.
///
/// `status` is `None` when no HTTP response was received at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (status: {status:?}, code: {code:?})")]
pub struct BackendError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
}

/// PostgREST error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl BackendError {
    pub fn new(status: Option<u16>, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// The request never produced a response (connect failure, timeout).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, None, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Some(403), Some(PERMISSION_DENIED_CODE), message)
    }

    /// Build from an HTTP error status and its raw body.
    pub fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => {
                let mut message = parsed
                    .message
                    .unwrap_or_else(|| format!("HTTP {status}"));
                if let Some(details) = parsed.details.filter(|d| !d.is_empty()) {
                    message = format!("{message}: {details}");
                }
                if let Some(hint) = parsed.hint.filter(|h| !h.is_empty()) {
                    message = format!("{message} (hint: {hint})");
                }
                Self {
                    status: Some(status),
                    code: parsed.code,
                    message,
                }
            }
            Err(_) if body.trim().is_empty() => Self::new(Some(status), None, format!("HTTP {status}")),
            Err(_) => Self::new(Some(status), None, body.trim().to_string()),
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code.as_deref() == Some(PERMISSION_DENIED_CODE)
            || matches!(self.status, Some(401) | Some(403))
    }

    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status == 408 || status == 429 || status >= 500,
        }
    }
}

impl From<BackendError> for SendError {
    fn from(err: BackendError) -> Self {
        if err.is_permission_denied() {
            SendError::Forbidden(err.message)
        } else if err.is_transient() {
            SendError::Transient(err.message)
        } else {
            SendError::Rejected(err.message)
        }
    }
}

impl From<BackendError> for FetchError {
    fn from(err: BackendError) -> Self {
        FetchError::Backend(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BackendError>;
