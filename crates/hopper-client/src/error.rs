//! Client errors.

use hopper_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("job rejected: {0}")]
    Rejected(String),

    #[error("artifact rejected: {0}")]
    PushRejected(String),

    #[error("connection to the broker was lost")]
    Disconnected,
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
