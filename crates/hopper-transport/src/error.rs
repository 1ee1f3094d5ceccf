//! Transport errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("unsupported protocol version {theirs} (this side speaks {ours})")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
