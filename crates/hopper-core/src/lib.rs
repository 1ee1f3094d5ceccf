//! Core domain types and traits for the Hopper job execution platform.
//!
//! This crate contains:
//! - Content digests and resource identifiers
//! - Job specifications, outcomes and the job state machine
//! - Executor trait used by the worker sandbox
//! - Artifact storage abstraction
//! - Clock abstraction, observability events and statistics

pub mod artifact;
pub mod clock;
pub mod digest;
pub mod error;
pub mod events;
pub mod executor;
pub mod id;
pub mod job;
pub mod outcome;
pub mod state;
pub mod stats;

pub use digest::Digest;
pub use error::{Error, Result};
pub use id::{ClientId, ClientJobId, ResourceId, WorkerId};
pub use job::{JobId, JobSpec, NetworkPolicy, ResourceLimits};
pub use outcome::{ExitStatus, FailureReason, JobOutcome, ResourceUsage};
pub use state::{JobEvent, JobState};
