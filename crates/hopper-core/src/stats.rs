//! Broker statistics.

use serde::{Deserialize, Serialize};

use crate::WorkerId;

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateCounts {
    pub queued: u64,
    pub assigned: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStateCounts {
    pub fn in_flight(&self) -> u64 {
        self.queued + self.assigned + self.running
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatistics {
    pub worker_id: WorkerId,
    pub slots: u32,
    pub free_slots: u32,
    pub cached_artifacts: usize,
}

/// Point-in-time view of the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatistics {
    pub workers: Vec<WorkerStatistics>,
    pub clients: usize,
    pub queue_depth: usize,
    /// Current counts for in-flight states, lifetime totals for terminal ones.
    pub job_states: JobStateCounts,
    pub requeues: u64,
    /// Bytes held by the broker's artifact store.
    pub store_bytes: u64,
}
