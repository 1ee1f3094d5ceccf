//! Executor trait.
//!
//! Executors run one job in an isolated environment on a worker. They never
//! return an error: every failure, including failures to set up isolation, is
//! encoded in the returned [`JobOutcome`].

use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::outcome::JobOutcome;
use crate::{Digest, JobId, JobSpec};

/// A layer that has been fetched, verified and pinned in the worker's cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayer {
    pub digest: Digest,
    /// Location of the layer archive on local disk.
    pub path: PathBuf,
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a job to completion, timeout or cancellation. `layers` are in the
    /// same order as `spec.layers`.
    async fn execute(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        layers: Vec<ResolvedLayer>,
        cancel: CancellationToken,
    ) -> JobOutcome;
}
