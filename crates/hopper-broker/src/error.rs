//! Broker errors.

use hopper_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
