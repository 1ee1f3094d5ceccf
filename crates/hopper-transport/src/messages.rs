//! Messages exchanged with the broker.
//!
//! All messages are JSON. Receivers ignore fields they do not know, so
//! fields can be added without bumping [`PROTOCOL_VERSION`].

use hopper_core::stats::BrokerStatistics;
use hopper_core::{ClientJobId, Digest, JobId, JobOutcome, JobSpec, ResourceId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bumped on incompatible changes to any message in this module.
pub const PROTOCOL_VERSION: u32 = 1;

/// First message on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub peer: Peer,
}

impl Hello {
    pub fn new(peer: Peer) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            peer,
        }
    }
}

/// What kind of peer opened the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Peer {
    Client,
    Worker {
        slots: u32,
        /// Artifacts already in the worker's cache.
        #[serde(default)]
        cached: Vec<Digest>,
    },
    ArtifactFetcher,
    ArtifactPusher,
}

impl Peer {
    pub fn name(&self) -> &'static str {
        match self {
            Peer::Client => "client",
            Peer::Worker { .. } => "worker",
            Peer::ArtifactFetcher => "artifact-fetcher",
            Peer::ArtifactPusher => "artifact-pusher",
        }
    }
}

/// The broker's answer to a [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelloReply {
    Welcome { id: ResourceId },
    HelloRejected { supported_version: u32, message: String },
}

/// Per-submission options that are not part of the job's identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Fail the job with `QueueTimeout` if it is still queued after this long.
    #[serde(default)]
    pub queue_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToBroker {
    JobRequest {
        client_job_id: ClientJobId,
        spec: JobSpec,
        #[serde(default)]
        options: SubmitOptions,
    },
    CancelJob {
        client_job_id: ClientJobId,
    },
    StatisticsRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToClient {
    /// The job was queued, or joined an identical job already in flight.
    JobAccepted {
        client_job_id: ClientJobId,
        job_id: JobId,
    },
    /// The submission failed validation and was not queued.
    JobRejected {
        client_job_id: ClientJobId,
        message: String,
    },
    /// The one terminal result for a submission.
    JobResponse {
        client_job_id: ClientJobId,
        job_id: JobId,
        outcome: JobOutcome,
    },
    StatisticsResponse {
        statistics: BrokerStatistics,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToWorker {
    EnqueueJob { job_id: JobId, spec: JobSpec },
    CancelJob { job_id: JobId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerToBroker {
    Heartbeat,
    /// Sent after the worker's free capacity or cache contents change.
    CapacityUpdate {
        free_slots: u32,
        #[serde(default)]
        cached: Vec<Digest>,
        #[serde(default)]
        evicted: Vec<Digest>,
    },
    JobStarted {
        job_id: JobId,
    },
    JobResult {
        job_id: JobId,
        outcome: JobOutcome,
    },
}

/// Sent by an artifact fetcher; answered with [`ArtifactFetchResponse`]
/// followed, on success, by exactly `size` bytes of body frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFetchRequest {
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactFetchResponse {
    Found { size: u64 },
    NotFound { message: String },
}

/// Sent by an artifact pusher, followed by exactly `size` bytes of body
/// frames. Answered with [`ArtifactPushResponse`] once the body has been
/// verified and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPushRequest {
    pub digest: Digest,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactPushResponse {
    Stored,
    Rejected { message: String },
}
