use thiserror::Error;

use sanctuary_backend::BackendError;
use sanctuary_shared::{ConnectionError, FetchError, SendError};

/// Why a room session could not be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// The live connection could not be opened. Fatal to the session even
    /// when the snapshot succeeded.
    #[error("Realtime connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Snapshot failed ({fetch}) and realtime connection failed ({connection})")]
    Failed {
        fetch: FetchError,
        connection: ConnectionError,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Backend setup failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Not found: {0}")]
    NotFound(String),
}
