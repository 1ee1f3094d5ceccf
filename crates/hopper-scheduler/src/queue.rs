//! Pending job queue.
//!
//! Jobs are picked by priority first, then by how many of their layers the
//! requesting worker already caches, then by queue position. Requeued jobs go
//! to the front so a job that lost its worker does not wait behind newer
//! submissions of the same priority.

use hopper_core::{Digest, JobId};
use std::collections::{HashSet, VecDeque};

/// A job waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub priority: i8,
    pub layers: Vec<Digest>,
}

impl QueuedJob {
    fn overlap(&self, cached: &HashSet<Digest>) -> usize {
        self.layers.iter().filter(|d| cached.contains(d)).count()
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    entries: VecDeque<QueuedJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, job: QueuedJob) {
        self.entries.push_back(job);
    }

    pub fn push_front(&mut self, job: QueuedJob) {
        self.entries.push_front(job);
    }

    pub fn remove(&mut self, job_id: &JobId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|j| &j.job_id != job_id);
        self.entries.len() != before
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries.iter().any(|j| &j.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedJob> {
        self.entries.iter()
    }

    /// Remove and return the best job for a worker caching `cached`.
    pub fn pick(&mut self, cached: &HashSet<Digest>) -> Option<QueuedJob> {
        let mut best: Option<(usize, i8, usize)> = None;
        for (index, job) in self.entries.iter().enumerate() {
            let key = (job.priority, job.overlap(cached));
            match best {
                Some((_, priority, overlap)) if (priority, overlap) >= key => {}
                _ => best = Some((index, key.0, key.1)),
            }
        }
        best.and_then(|(index, _, _)| self.entries.remove(index))
    }
}
