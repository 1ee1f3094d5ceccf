//! Hopper worker agent.
//!
//! Connects to the broker, keeps a local artifact cache and runs assigned
//! jobs through an [`Executor`](hopper_core::executor::Executor).

pub mod agent;
pub mod backoff;
pub mod error;
pub mod fetcher;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::Agent;
pub use error::{SourceError, WorkerError, WorkerResult};
pub use fetcher::{Fetcher, PinnedLayers};
pub use source::{ArtifactSource, RemoteSource};
