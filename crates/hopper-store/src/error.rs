//! Artifact store errors.

use hopper_core::Digest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(Digest),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for hopper_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(digest) => hopper_core::Error::NotFound(digest.to_string()),
            StoreError::DigestMismatch { expected, actual } => {
                hopper_core::Error::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                }
            }
            StoreError::InvalidLayer(msg) => hopper_core::Error::InvalidInput(msg),
            StoreError::Io(e) => hopper_core::Error::Io(e),
        }
    }
}
