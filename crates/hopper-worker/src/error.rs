//! Worker errors.

use hopper_store::StoreError;
use hopper_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("broker closed the connection")]
    Disconnected,
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Why one artifact source could not deliver an artifact.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source does not have it. Try the next one.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bytes did not hash to the requested digest. The source is not
    /// trusted for this artifact again.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Worth retrying against the same source.
    #[error("transient: {0}")]
    Transient(String),
}

impl From<TransportError> for SourceError {
    fn from(err: TransportError) -> Self {
        SourceError::Transient(err.to_string())
    }
}

impl From<StoreError> for SourceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DigestMismatch { .. } => SourceError::Corrupt(err.to_string()),
            other => SourceError::Transient(other.to_string()),
        }
    }
}
