//! The scheduler state machine.

use hopper_core::artifact::ArtifactStore;
use hopper_core::clock::Clock;
use hopper_core::events::{EventKind, SchedulerEvent};
use hopper_core::state::{JobEvent, JobProgress, RetryDecision};
use hopper_core::stats::{BrokerStatistics, JobStateCounts};
use hopper_core::{
    ClientId, ClientJobId, Digest, FailureReason, JobId, JobOutcome, JobSpec, JobState, WorkerId,
};
use hopper_transport::messages::{
    BrokerToClient, BrokerToWorker, ClientToBroker, SubmitOptions, WorkerToBroker,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::gateway::ClientGateway;
use crate::queue::{JobQueue, QueuedJob};
use crate::registry::{WorkerDescriptor, WorkerRegistry};
use crate::snapshot::{JobSummary, SchedulerSnapshot};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How the scheduler talks to the outside world. The broker's
/// implementation pushes onto per-connection channels; tests record.
pub trait SchedulerDeps {
    type ClientSender;
    type WorkerSender;

    fn send_to_client(&mut self, sender: &mut Self::ClientSender, msg: BrokerToClient);
    fn send_to_worker(&mut self, sender: &mut Self::WorkerSender, msg: BrokerToWorker);
}

/// Everything the scheduler reacts to.
pub enum Message<D: SchedulerDeps> {
    ClientConnected(ClientId, D::ClientSender),
    ClientDisconnected(ClientId),
    FromClient(ClientId, ClientToBroker),
    WorkerConnected {
        id: WorkerId,
        slots: u32,
        cached: Vec<Digest>,
        sender: D::WorkerSender,
    },
    WorkerDisconnected(WorkerId),
    FromWorker(WorkerId, WorkerToBroker),
    /// Periodic check of heartbeat and queue timeouts.
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Requeues allowed per job before it fails with `RetriesExhausted`.
    pub max_retries: u32,
    pub heartbeat_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

struct JobEntry {
    spec: JobSpec,
    progress: JobProgress,
    /// Cleared on first assignment.
    queue_deadline: Option<Instant>,
    /// Position among all assignments, for requeueing lost jobs in order.
    assigned_seq: u64,
}

impl JobEntry {
    fn queued(&self, job_id: JobId) -> QueuedJob {
        QueuedJob {
            job_id,
            priority: self.spec.priority,
            layers: self.spec.layers.clone(),
        }
    }
}

pub struct Scheduler<D: SchedulerDeps> {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn ArtifactStore>,
    gateway: ClientGateway<D::ClientSender>,
    workers: WorkerRegistry<D::WorkerSender>,
    jobs: HashMap<JobId, JobEntry>,
    queue: JobQueue,
    completed: u64,
    failed: u64,
    cancelled: u64,
    requeues: u64,
    assignments: u64,
    events: broadcast::Sender<SchedulerEvent>,
    snapshot: watch::Sender<SchedulerSnapshot>,
}

impl<D: SchedulerDeps> Scheduler<D> {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>, store: Arc<dyn ArtifactStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot, _) = watch::channel(SchedulerSnapshot::default());
        Self {
            config,
            clock,
            store,
            gateway: ClientGateway::new(),
            workers: WorkerRegistry::new(),
            jobs: HashMap::new(),
            queue: JobQueue::new(),
            completed: 0,
            failed: 0,
            cancelled: 0,
            requeues: 0,
            assignments: 0,
            events,
            snapshot,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Handle for subscribing after the scheduler has moved into its task.
    pub fn event_sender(&self) -> broadcast::Sender<SchedulerEvent> {
        self.events.clone()
    }

    pub fn snapshots(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn receive_message(&mut self, deps: &mut D, msg: Message<D>) {
        match msg {
            Message::ClientConnected(id, sender) => {
                debug!(client_id = %id, "Client connected");
                self.gateway.connect(id, sender);
            }
            Message::ClientDisconnected(id) => self.client_disconnected(deps, id),
            Message::FromClient(id, msg) => self.from_client(deps, id, msg),
            Message::WorkerConnected {
                id,
                slots,
                cached,
                sender,
            } => self.worker_connected(deps, id, slots, cached, sender),
            Message::WorkerDisconnected(id) => self.worker_lost(deps, id, false),
            Message::FromWorker(id, msg) => self.from_worker(deps, id, msg),
            Message::Tick => self.tick(deps),
        }
        self.publish_snapshot();
    }

    fn emit(&self, kind: EventKind) {
        match &kind {
            EventKind::JobRequeued { job_id, reason, .. } => {
                warn!(job_id = %job_id, reason = %reason, "Job requeued")
            }
            EventKind::JobFailed { job_id, reason } => {
                info!(job_id = %job_id, reason = %reason, "Job failed")
            }
            EventKind::WorkerDisconnected { worker_id, timed_out } => {
                info!(worker_id = %worker_id, timed_out, "Worker disconnected")
            }
            other => debug!(event = ?other, "Scheduler event"),
        }
        // No receivers is fine.
        let _ = self.events.send(SchedulerEvent::now(kind));
    }

    fn send_to_client(&mut self, deps: &mut D, client: ClientId, msg: BrokerToClient) {
        if let Some(sender) = self.gateway.sender_mut(&client) {
            deps.send_to_client(sender, msg);
        }
    }

    // Clients

    fn client_disconnected(&mut self, deps: &mut D, id: ClientId) {
        debug!(client_id = %id, "Client disconnected");
        for job_id in self.gateway.disconnect(&id) {
            self.abandon_job(deps, job_id);
        }
    }

    fn from_client(&mut self, deps: &mut D, client: ClientId, msg: ClientToBroker) {
        if !self.gateway.contains(&client) {
            warn!(client_id = %client, "Message from unknown client");
            return;
        }
        match msg {
            ClientToBroker::JobRequest {
                client_job_id,
                spec,
                options,
            } => self.submit(deps, client, client_job_id, spec, options),
            ClientToBroker::CancelJob { client_job_id } => self.cancel(deps, client, client_job_id),
            ClientToBroker::StatisticsRequest => {
                let statistics = self.statistics();
                self.send_to_client(deps, client, BrokerToClient::StatisticsResponse { statistics });
            }
        }
    }

    fn reject(&mut self, deps: &mut D, client: ClientId, client_job_id: ClientJobId, message: String) {
        info!(client_id = %client, %client_job_id, %message, "Rejected submission");
        self.send_to_client(
            deps,
            client,
            BrokerToClient::JobRejected {
                client_job_id,
                message,
            },
        );
    }

    fn submit(
        &mut self,
        deps: &mut D,
        client: ClientId,
        client_job_id: ClientJobId,
        spec: JobSpec,
        options: SubmitOptions,
    ) {
        if self.gateway.is_pending(&client, &client_job_id) {
            let message = format!("client job id {client_job_id} is already in use");
            return self.reject(deps, client, client_job_id, message);
        }
        if let Err(e) = spec.validate() {
            return self.reject(deps, client, client_job_id, e.to_string());
        }
        let missing: Vec<String> = spec
            .layers
            .iter()
            .filter(|d| !self.store.contains(d))
            .map(|d| d.short())
            .collect();
        if !missing.is_empty() {
            let message = format!("layers not in store: {}", missing.join(", "));
            return self.reject(deps, client, client_job_id, message);
        }

        let job_id = spec.id();
        if self.jobs.contains_key(&job_id) {
            debug!(job_id = %job_id, client_id = %client, "Joined in-flight job");
            self.gateway.subscribe(client, client_job_id, job_id);
            self.send_to_client(
                deps,
                client,
                BrokerToClient::JobAccepted {
                    client_job_id,
                    job_id,
                },
            );
            return;
        }

        let mut pinned = Vec::with_capacity(spec.layers.len());
        for digest in &spec.layers {
            match self.store.retain(digest) {
                Ok(()) => pinned.push(*digest),
                Err(e) => {
                    for digest in &pinned {
                        self.store.release(digest);
                    }
                    return self.reject(deps, client, client_job_id, e.to_string());
                }
            }
        }

        let now = self.clock.now();
        let priority = spec.priority;
        let entry = JobEntry {
            spec,
            progress: JobProgress::new(),
            queue_deadline: options.queue_timeout.map(|t| now + t),
            assigned_seq: 0,
        };
        let queued = entry.queued(job_id);
        self.jobs.insert(job_id, entry);
        self.gateway.subscribe(client, client_job_id, job_id);
        self.send_to_client(
            deps,
            client,
            BrokerToClient::JobAccepted {
                client_job_id,
                job_id,
            },
        );
        self.emit(EventKind::JobQueued { job_id, priority });

        let target = if self.queue.is_empty() {
            self.workers.best_for(&queued.layers)
        } else {
            None
        };
        match target {
            Some(worker_id) => self.assign(deps, job_id, worker_id),
            None => {
                self.queue.push_back(queued);
                self.dispatch(deps);
            }
        }
    }

    fn cancel(&mut self, deps: &mut D, client: ClientId, client_job_id: ClientJobId) {
        let Some((job_id, orphaned)) = self.gateway.unsubscribe(&client, &client_job_id) else {
            debug!(client_id = %client, %client_job_id, "Cancel for unknown submission");
            return;
        };
        self.send_to_client(
            deps,
            client,
            BrokerToClient::JobResponse {
                client_job_id,
                job_id,
                outcome: JobOutcome::Failed(FailureReason::Cancelled),
            },
        );
        if orphaned {
            self.abandon_job(deps, job_id);
        }
    }

    /// Drop a job nobody is waiting for. A worker holding it is told to stop
    /// and anything it reports about the job afterwards is ignored.
    fn abandon_job(&mut self, deps: &mut D, job_id: JobId) {
        let Some(mut entry) = self.jobs.remove(&job_id) else {
            return;
        };
        let holder = entry.progress.state.worker();
        if let Err(e) = entry.progress.apply(JobEvent::Cancel) {
            warn!(job_id = %job_id, error = %e, "Rejected job transition");
        }
        match holder {
            Some(worker_id) => {
                if let Some(worker) = self.workers.get_mut(&worker_id) {
                    worker.assigned.remove(&job_id);
                    deps.send_to_worker(&mut worker.sender, BrokerToWorker::CancelJob { job_id });
                }
            }
            None => {
                self.queue.remove(&job_id);
            }
        }
        self.release_layers(&entry.spec);
        self.cancelled += 1;
        self.emit(EventKind::JobCancelled { job_id });
    }

    // Workers

    fn worker_connected(
        &mut self,
        deps: &mut D,
        id: WorkerId,
        slots: u32,
        cached: Vec<Digest>,
        sender: D::WorkerSender,
    ) {
        let now = self.clock.now();
        self.workers
            .insert(WorkerDescriptor::new(id, slots, cached, now, sender));
        self.emit(EventKind::WorkerConnected {
            worker_id: id,
            slots,
        });
        self.fill_worker(deps, id);
    }

    /// Handle a worker that disconnected or stopped heartbeating. Its jobs go
    /// back to the front of the queue, retry budget permitting. Dropping the
    /// descriptor drops the connection's sender, which closes it.
    fn worker_lost(&mut self, deps: &mut D, id: WorkerId, timed_out: bool) {
        let Some(worker) = self.workers.remove(&id) else {
            return;
        };
        self.emit(EventKind::WorkerDisconnected {
            worker_id: id,
            timed_out,
        });

        let mut lost: Vec<(u64, JobId)> = worker
            .assigned
            .into_iter()
            .map(|job_id| (self.jobs.get(&job_id).map_or(0, |e| e.assigned_seq), job_id))
            .collect();
        // Latest assignment first, so after push_front the earliest leads.
        lost.sort_unstable_by(|a, b| b.cmp(a));
        for (_, job_id) in lost {
            self.infrastructure_failure(deps, job_id, FailureReason::WorkerLost);
        }
        self.dispatch(deps);
    }

    fn from_worker(&mut self, deps: &mut D, id: WorkerId, msg: WorkerToBroker) {
        let now = self.clock.now();
        match self.workers.get_mut(&id) {
            Some(worker) => worker.last_heartbeat = now,
            None => {
                debug!(worker_id = %id, "Message from unknown worker");
                return;
            }
        }

        match msg {
            WorkerToBroker::Heartbeat => {}
            WorkerToBroker::CapacityUpdate {
                free_slots,
                cached,
                evicted,
            } => {
                if let Some(worker) = self.workers.get_mut(&id) {
                    worker.advertised_free = free_slots.min(worker.slots);
                    worker.cached.extend(cached);
                    for digest in &evicted {
                        worker.cached.remove(digest);
                    }
                }
                self.fill_worker(deps, id);
            }
            WorkerToBroker::JobStarted { job_id } => self.job_started(id, job_id),
            WorkerToBroker::JobResult { job_id, outcome } => {
                self.job_result(deps, id, job_id, outcome)
            }
        }
    }

    fn job_started(&mut self, worker_id: WorkerId, job_id: JobId) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.progress.state != (JobState::Assigned { worker: worker_id }) {
            debug!(job_id = %job_id, worker_id = %worker_id, "Ignoring stale start report");
            return;
        }
        if let Err(e) = entry.progress.apply(JobEvent::Start) {
            warn!(job_id = %job_id, error = %e, "Rejected job transition");
            return;
        }
        self.emit(EventKind::JobStarted { job_id, worker_id });
    }

    fn job_result(&mut self, deps: &mut D, worker_id: WorkerId, job_id: JobId, outcome: JobOutcome) {
        let held = self
            .jobs
            .get(&job_id)
            .is_some_and(|e| e.progress.state.worker() == Some(worker_id));
        if !held {
            debug!(job_id = %job_id, worker_id = %worker_id, "Ignoring result for job not held by worker");
            return;
        }
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.assigned.remove(&job_id);
            worker.advertised_free = (worker.advertised_free + 1).min(worker.slots);
        }

        match outcome {
            JobOutcome::Failed(reason) if reason.is_infrastructure() => {
                self.infrastructure_failure(deps, job_id, reason)
            }
            outcome => {
                let event = match &outcome {
                    JobOutcome::Completed(_) => JobEvent::Finish,
                    JobOutcome::Failed(reason) => JobEvent::Fail(reason.clone()),
                };
                if let Some(entry) = self.jobs.get_mut(&job_id) {
                    if let Err(e) = entry.progress.apply(event) {
                        warn!(job_id = %job_id, error = %e, "Rejected job transition");
                    }
                }
                self.finish_job(deps, job_id, outcome);
            }
        }
        self.dispatch(deps);
    }

    fn infrastructure_failure(&mut self, deps: &mut D, job_id: JobId, reason: FailureReason) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        match entry
            .progress
            .infrastructure_failure(reason.clone(), self.config.max_retries)
        {
            Ok(RetryDecision::Requeue) => {
                let requeues = entry.progress.requeues;
                self.queue.push_front(entry.queued(job_id));
                self.requeues += 1;
                self.emit(EventKind::JobRequeued {
                    job_id,
                    requeues,
                    reason,
                });
            }
            Ok(RetryDecision::GiveUp(terminal)) => {
                self.finish_job(deps, job_id, JobOutcome::Failed(terminal))
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Rejected job transition"),
        }
    }

    // Placement

    fn assign(&mut self, deps: &mut D, job_id: JobId, worker_id: WorkerId) {
        let (Some(entry), Some(worker)) = (self.jobs.get_mut(&job_id), self.workers.get_mut(&worker_id))
        else {
            error!(job_id = %job_id, worker_id = %worker_id, "Assignment to unknown job or worker");
            return;
        };
        if let Err(e) = entry.progress.apply(JobEvent::Assign(worker_id)) {
            error!(job_id = %job_id, error = %e, "Rejected job transition");
            return;
        }
        entry.queue_deadline = None;
        self.assignments += 1;
        entry.assigned_seq = self.assignments;

        let affinity = worker.overlap(&entry.spec.layers);
        worker.assigned.insert(job_id);
        worker.advertised_free = worker.advertised_free.saturating_sub(1);
        // The worker will have these once it has fetched them.
        worker.cached.extend(entry.spec.layers.iter().copied());
        deps.send_to_worker(
            &mut worker.sender,
            BrokerToWorker::EnqueueJob {
                job_id,
                spec: entry.spec.clone(),
            },
        );
        self.emit(EventKind::JobAssigned {
            job_id,
            worker_id,
            affinity,
        });
    }

    /// Hand queued jobs to `worker_id` until it or the queue runs out.
    fn fill_worker(&mut self, deps: &mut D, worker_id: WorkerId) {
        loop {
            let Some(worker) = self.workers.get(&worker_id) else {
                return;
            };
            if worker.free_slots() == 0 {
                return;
            }
            let Some(job) = self.queue.pick(&worker.cached) else {
                return;
            };
            self.assign(deps, job.job_id, worker_id);
        }
    }

    fn dispatch(&mut self, deps: &mut D) {
        for worker_id in self.workers.with_free_slots() {
            if self.queue.is_empty() {
                break;
            }
            self.fill_worker(deps, worker_id);
        }
    }

    // Completion

    fn release_layers(&self, spec: &JobSpec) {
        for digest in &spec.layers {
            self.store.release(digest);
        }
    }

    /// Remove a terminated job and deliver its outcome to every subscriber.
    fn finish_job(&mut self, deps: &mut D, job_id: JobId, outcome: JobOutcome) {
        let Some(entry) = self.jobs.remove(&job_id) else {
            return;
        };
        self.release_layers(&entry.spec);

        for (client, client_job_id) in self.gateway.take_subscribers(&job_id) {
            self.send_to_client(
                deps,
                client,
                BrokerToClient::JobResponse {
                    client_job_id,
                    job_id,
                    outcome: outcome.clone(),
                },
            );
        }

        match outcome {
            JobOutcome::Completed(completed) => {
                self.completed += 1;
                self.emit(EventKind::JobCompleted {
                    job_id,
                    success: completed.exit_status.success(),
                });
            }
            JobOutcome::Failed(reason) => {
                self.failed += 1;
                self.emit(EventKind::JobFailed { job_id, reason });
            }
        }
    }

    fn tick(&mut self, deps: &mut D) {
        let now = self.clock.now();

        for worker_id in self.workers.timed_out(now, self.config.heartbeat_timeout) {
            warn!(worker_id = %worker_id, "Worker missed heartbeats");
            self.worker_lost(deps, worker_id, true);
        }

        let expired: Vec<JobId> = self
            .queue
            .iter()
            .filter(|q| {
                self.jobs
                    .get(&q.job_id)
                    .and_then(|e| e.queue_deadline)
                    .is_some_and(|deadline| now >= deadline)
            })
            .map(|q| q.job_id)
            .collect();
        for job_id in expired {
            self.queue.remove(&job_id);
            if let Some(entry) = self.jobs.get_mut(&job_id) {
                let _ = entry.progress.apply(JobEvent::Fail(FailureReason::QueueTimeout));
            }
            self.finish_job(deps, job_id, JobOutcome::Failed(FailureReason::QueueTimeout));
        }
    }

    // Observation

    pub fn statistics(&self) -> BrokerStatistics {
        let mut job_states = JobStateCounts {
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            ..Default::default()
        };
        for entry in self.jobs.values() {
            match entry.progress.state {
                JobState::Queued => job_states.queued += 1,
                JobState::Assigned { .. } => job_states.assigned += 1,
                JobState::Running { .. } => job_states.running += 1,
                JobState::Completed | JobState::Failed { .. } | JobState::Cancelled => {}
            }
        }
        BrokerStatistics {
            workers: self.workers.iter().map(|w| w.statistics()).collect(),
            clients: self.gateway.len(),
            queue_depth: self.queue.len(),
            job_states,
            requeues: self.requeues,
            store_bytes: self.store.total_bytes(),
        }
    }

    fn publish_snapshot(&self) {
        let mut jobs: Vec<JobSummary> = self
            .jobs
            .iter()
            .map(|(job_id, entry)| JobSummary {
                job_id: *job_id,
                state: entry.progress.state.clone(),
                priority: entry.spec.priority,
                requeues: entry.progress.requeues,
                subscribers: self.gateway.subscriber_count(job_id),
            })
            .collect();
        jobs.sort_by_key(|j| j.job_id);
        self.snapshot.send_replace(SchedulerSnapshot {
            statistics: self.statistics(),
            jobs,
        });
    }
}

/// Feed messages to the scheduler until every sender is gone.
pub async fn run_scheduler<D: SchedulerDeps>(
    mut scheduler: Scheduler<D>,
    mut deps: D,
    mut receiver: UnboundedReceiver<Message<D>>,
) {
    while let Some(msg) = receiver.recv().await {
        scheduler.receive_message(&mut deps, msg);
    }
    info!("Scheduler stopped");
}

/// Send [`Message::Tick`] every `interval` until the scheduler goes away.
pub async fn run_ticker<D: SchedulerDeps>(sender: UnboundedSender<Message<D>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if sender.send(Message::Tick).is_err() {
            break;
        }
    }
}
