//! Observability events.
//!
//! The scheduler emits one [`SchedulerEvent`] per lifecycle change. They are
//! logged and broadcast to whoever is listening (the broker's `/events`
//! endpoint forwards them to external collectors).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outcome::FailureReason;
use crate::{JobId, WorkerId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobQueued {
        job_id: JobId,
        priority: i8,
    },
    JobAssigned {
        job_id: JobId,
        worker_id: WorkerId,
        /// Number of the job's layers the worker already had cached.
        affinity: usize,
    },
    JobStarted {
        job_id: JobId,
        worker_id: WorkerId,
    },
    JobRequeued {
        job_id: JobId,
        requeues: u32,
        reason: FailureReason,
    },
    JobCompleted {
        job_id: JobId,
        success: bool,
    },
    JobFailed {
        job_id: JobId,
        reason: FailureReason,
    },
    JobCancelled {
        job_id: JobId,
    },
    WorkerConnected {
        worker_id: WorkerId,
        slots: u32,
    },
    WorkerDisconnected {
        worker_id: WorkerId,
        /// True when the broker gave up on the worker because its heartbeats
        /// stopped, rather than the connection closing.
        timed_out: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SchedulerEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}
