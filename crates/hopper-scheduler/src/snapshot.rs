//! Read-only views of scheduler state for observers.

use hopper_core::stats::BrokerStatistics;
use hopper_core::{JobId, JobState};
use serde::{Deserialize, Serialize};

/// One in-flight job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub state: JobState,
    pub priority: i8,
    pub requeues: u32,
    pub subscribers: usize,
}

/// Published after every message the scheduler handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub statistics: BrokerStatistics,
    pub jobs: Vec<JobSummary>,
}
