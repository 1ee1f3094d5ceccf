//! Executor setup errors.
//!
//! These never cross the [`hopper_core::executor::Executor`] boundary: the
//! sandbox turns them into [`FailureReason::SandboxSetup`].

use hopper_core::FailureReason;
use hopper_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("layer: {0}")]
    Layer(#[from] StoreError),

    #[error("assembly: {0}")]
    Assembly(String),

    #[error("cgroup: {0}")]
    Cgroup(String),

    #[error("spawn: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

impl From<ExecutorError> for FailureReason {
    fn from(err: ExecutorError) -> Self {
        FailureReason::SandboxSetup {
            message: err.to_string(),
        }
    }
}
