//! Connected workers.

use hopper_core::stats::WorkerStatistics;
use hopper_core::{Digest, JobId, WorkerId};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

/// What the broker knows about one connected worker.
#[derive(Debug)]
pub struct WorkerDescriptor<S> {
    pub id: WorkerId,
    pub slots: u32,
    /// Free slots as last reported by the worker, minus assignments made
    /// since.
    pub advertised_free: u32,
    pub assigned: HashSet<JobId>,
    /// Artifacts the worker has, or will have once its current assignments
    /// are fetched.
    pub cached: HashSet<Digest>,
    pub last_heartbeat: Instant,
    pub sender: S,
}

impl<S> WorkerDescriptor<S> {
    pub fn new(id: WorkerId, slots: u32, cached: Vec<Digest>, now: Instant, sender: S) -> Self {
        Self {
            id,
            slots,
            advertised_free: slots,
            assigned: HashSet::new(),
            cached: cached.into_iter().collect(),
            last_heartbeat: now,
            sender,
        }
    }

    /// Slots the broker may still fill. Bounded by both the worker's own
    /// report and the broker's count of outstanding assignments, since
    /// either may be stale.
    pub fn free_slots(&self) -> u32 {
        let unassigned = self.slots.saturating_sub(self.assigned.len() as u32);
        self.advertised_free.min(unassigned)
    }

    pub fn overlap(&self, layers: &[Digest]) -> usize {
        layers.iter().filter(|d| self.cached.contains(d)).count()
    }

    pub fn statistics(&self) -> WorkerStatistics {
        WorkerStatistics {
            worker_id: self.id,
            slots: self.slots,
            free_slots: self.free_slots(),
            cached_artifacts: self.cached.len(),
        }
    }
}

#[derive(Debug)]
pub struct WorkerRegistry<S> {
    workers: BTreeMap<WorkerId, WorkerDescriptor<S>>,
}

impl<S> Default for WorkerRegistry<S> {
    fn default() -> Self {
        Self {
            workers: BTreeMap::new(),
        }
    }
}

impl<S> WorkerRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, worker: WorkerDescriptor<S>) {
        self.workers.insert(worker.id, worker);
    }

    pub fn remove(&mut self, id: &WorkerId) -> Option<WorkerDescriptor<S>> {
        self.workers.remove(id)
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerDescriptor<S>> {
        self.workers.get(id)
    }

    pub fn get_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerDescriptor<S>> {
        self.workers.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerDescriptor<S>> {
        self.workers.values()
    }

    /// Workers with at least one free slot, lowest id first.
    pub fn with_free_slots(&self) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.free_slots() > 0)
            .map(|w| w.id)
            .collect()
    }

    /// The free worker best suited to a job with `layers`: most cached
    /// layers, then most free slots, then lowest id.
    pub fn best_for(&self, layers: &[Digest]) -> Option<WorkerId> {
        let mut best: Option<(&WorkerDescriptor<S>, usize)> = None;
        for worker in self.workers.values().filter(|w| w.free_slots() > 0) {
            let overlap = worker.overlap(layers);
            let better = match best {
                None => true,
                Some((current, current_overlap)) => {
                    (overlap, worker.free_slots()) > (current_overlap, current.free_slots())
                }
            };
            if better {
                best = Some((worker, overlap));
            }
        }
        best.map(|(w, _)| w.id)
    }

    /// Workers whose last heartbeat is older than `timeout`.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| now.saturating_duration_since(w.last_heartbeat) > timeout)
            .map(|w| w.id)
            .collect()
    }
}
