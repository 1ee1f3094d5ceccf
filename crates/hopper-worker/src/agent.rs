//! Worker agent.
//!
//! Keeps one session with the broker at a time. Each session announces the
//! worker's slots and cached artifacts, then runs assigned jobs: resolve
//! layers, report `JobStarted`, execute, report the result and the new free
//! capacity. When the session is lost every running job is cancelled, and
//! once their sandboxes are torn down the agent reconnects with backoff.

use hopper_config::WorkerConfig;
use hopper_core::executor::Executor;
use hopper_core::{FailureReason, JobId, JobOutcome, JobSpec};
use hopper_transport::messages::{BrokerToWorker, Peer, WorkerToBroker};
use hopper_transport::{Connection, connect, reader_loop, writer_loop};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::{WorkerError, WorkerResult};
use crate::fetcher::Fetcher;

/// A job occupying a slot.
struct Slot {
    cancel: CancellationToken,
    /// Cancelled by the broker. Its result is not reported.
    cancelled: bool,
}

pub struct Agent {
    broker: String,
    slots: u32,
    heartbeat_interval: Duration,
    reconnect_min: Duration,
    reconnect_max: Duration,
    fetcher: Fetcher,
    executor: Arc<dyn Executor>,
}

impl Agent {
    pub fn new(config: &WorkerConfig, fetcher: Fetcher, executor: Arc<dyn Executor>) -> Self {
        Self {
            broker: config.broker.clone(),
            slots: config.slots,
            heartbeat_interval: config.heartbeat_interval,
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max,
            fetcher,
            executor,
        }
    }

    /// Serve the broker until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerResult<()> {
        let mut backoff = Backoff::new(self.reconnect_min, self.reconnect_max);
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let peer = Peer::Worker {
                slots: self.slots,
                cached: self.fetcher.store().digests(),
            };
            match connect(self.broker.as_str(), peer).await {
                Ok((conn, id)) => {
                    backoff.reset();
                    // Everything cached now was just announced.
                    self.fetcher.take_fetched();
                    info!(broker = %self.broker, worker_id = %id, slots = self.slots, "Connected to broker");
                    match self.session(conn, &shutdown).await {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!(error = %e, "Broker session ended"),
                    }
                }
                Err(e) => warn!(broker = %self.broker, error = %e, "Failed to connect to broker"),
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Returns `Ok` on shutdown and an error when the broker is lost.
    async fn session(
        &self,
        conn: Connection<TcpStream>,
        shutdown: &CancellationToken,
    ) -> WorkerResult<()> {
        let (reader, writer) = conn.into_split();
        let (to_broker, outbound) = mpsc::unbounded_channel::<WorkerToBroker>();
        let (inbound_tx, mut inbound) = mpsc::unbounded_channel::<BrokerToWorker>();
        let (done_tx, mut done) = mpsc::unbounded_channel::<(JobId, JobOutcome)>();

        let mut io = JoinSet::new();
        io.spawn(async move { reader_loop(reader, inbound_tx, |m: BrokerToWorker| m).await });
        io.spawn(async move { writer_loop(outbound, writer).await });

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut running: HashMap<JobId, Slot> = HashMap::new();
        let mut jobs = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = heartbeat.tick() => {
                    if to_broker.send(WorkerToBroker::Heartbeat).is_err() {
                        break Err(WorkerError::Disconnected);
                    }
                }
                msg = inbound.recv() => match msg {
                    Some(BrokerToWorker::EnqueueJob { job_id, spec }) => {
                        self.start(job_id, spec, &mut running, &mut jobs, &to_broker, &done_tx);
                    }
                    Some(BrokerToWorker::CancelJob { job_id }) => {
                        if let Some(slot) = running.get_mut(&job_id) {
                            info!(job_id = %job_id.short(), "Cancelling job");
                            slot.cancelled = true;
                            slot.cancel.cancel();
                        }
                    }
                    None => break Err(WorkerError::Disconnected),
                },
                Some((job_id, outcome)) = done.recv() => {
                    let Some(slot) = running.remove(&job_id) else {
                        continue;
                    };
                    if !slot.cancelled {
                        info!(job_id = %job_id.short(), outcome = %outcome, "Job finished");
                        let _ = to_broker.send(WorkerToBroker::JobResult { job_id, outcome });
                    }
                    let update = self.capacity_update(running.len()).await;
                    if to_broker.send(update).is_err() {
                        break Err(WorkerError::Disconnected);
                    }
                }
                Some(joined) = jobs.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Job task failed");
                    }
                }
            }
        };

        if !running.is_empty() {
            warn!(count = running.len(), "Cancelling running jobs");
        }
        for slot in running.values() {
            slot.cancel.cancel();
        }
        drop(to_broker);
        io.abort_all();
        drain(&mut jobs).await;
        result
    }

    fn start(
        &self,
        job_id: JobId,
        spec: JobSpec,
        running: &mut HashMap<JobId, Slot>,
        jobs: &mut JoinSet<()>,
        to_broker: &UnboundedSender<WorkerToBroker>,
        done: &UnboundedSender<(JobId, JobOutcome)>,
    ) {
        if running.contains_key(&job_id) {
            warn!(job_id = %job_id.short(), "Ignoring duplicate assignment");
            return;
        }
        if running.len() as u32 >= self.slots {
            error!(job_id = %job_id.short(), slots = self.slots, "Assignment with no free slot");
            let outcome = JobOutcome::Failed(FailureReason::SandboxSetup {
                message: "no free slot on worker".to_string(),
            });
            let _ = to_broker.send(WorkerToBroker::JobResult { job_id, outcome });
            return;
        }

        info!(job_id = %job_id.short(), program = %spec.program, "Job assigned");
        let cancel = CancellationToken::new();
        running.insert(
            job_id,
            Slot {
                cancel: cancel.clone(),
                cancelled: false,
            },
        );

        let fetcher = self.fetcher.clone();
        let executor = self.executor.clone();
        let to_broker = to_broker.clone();
        let done = done.clone();
        jobs.spawn(async move {
            let outcome = run_job(job_id, spec, fetcher, executor, to_broker, cancel).await;
            let _ = done.send((job_id, outcome));
        });
    }

    async fn capacity_update(&self, busy: usize) -> WorkerToBroker {
        let evicted = match self.fetcher.store().evict().await {
            Ok(evicted) => evicted.into_iter().map(|m| m.digest).collect(),
            Err(e) => {
                warn!(error = %e, "Cache eviction failed");
                Vec::new()
            }
        };
        WorkerToBroker::CapacityUpdate {
            free_slots: self.slots.saturating_sub(busy as u32),
            cached: self.fetcher.take_fetched(),
            evicted,
        }
    }
}

/// Wait for cancelled jobs to tear down their sandboxes. A new session
/// must not offer slots that are still occupied.
async fn drain(jobs: &mut JoinSet<()>) {
    let mut report = tokio::time::interval(Duration::from_secs(10));
    report.tick().await;
    while !jobs.is_empty() {
        tokio::select! {
            joined = jobs.join_next() => {
                if let Some(Err(e)) = joined {
                    error!(error = %e, "Job task failed");
                }
            }
            _ = report.tick() => warn!(count = jobs.len(), "Waiting for cancelled jobs to tear down"),
        }
    }
}

async fn run_job(
    job_id: JobId,
    spec: JobSpec,
    fetcher: Fetcher,
    executor: Arc<dyn Executor>,
    to_broker: UnboundedSender<WorkerToBroker>,
    cancel: CancellationToken,
) -> JobOutcome {
    let pinned = tokio::select! {
        result = fetcher.resolve(&spec.layers) => match result {
            Ok(pinned) => pinned,
            Err(reason) => return JobOutcome::Failed(reason),
        },
        _ = cancel.cancelled() => return JobOutcome::Failed(FailureReason::Cancelled),
    };

    let _ = to_broker.send(WorkerToBroker::JobStarted { job_id });
    let outcome = executor
        .execute(job_id, &spec, pinned.layers().to_vec(), cancel)
        .await;
    drop(pinned);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hopper_core::artifact::RetentionPolicy;
    use hopper_core::executor::ResolvedLayer;
    use hopper_core::outcome::{CapturedOutput, Completed, ExitStatus, ResourceUsage};
    use hopper_core::{Digest, ResourceId};
    use hopper_store::FsArtifactStore;
    use hopper_transport::accept_hello;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    use crate::testing::MemorySource;

    /// Echoes the program name, or waits for cancellation when `block` is
    /// set and then takes `teardown` to clean up.
    #[derive(Default)]
    struct FakeExecutor {
        block: bool,
        teardown: Duration,
        cancelled: AtomicU32,
    }

    impl FakeExecutor {
        fn blocking(teardown: Duration) -> Self {
            Self {
                block: true,
                teardown,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn execute(
            &self,
            _job_id: JobId,
            spec: &JobSpec,
            layers: Vec<ResolvedLayer>,
            cancel: CancellationToken,
        ) -> JobOutcome {
            assert_eq!(layers.len(), spec.layers.len());
            if self.block {
                cancel.cancelled().await;
                tokio::time::sleep(self.teardown).await;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                return JobOutcome::Failed(FailureReason::Cancelled);
            }
            JobOutcome::Completed(Completed {
                exit_status: ExitStatus::Exited(0),
                stdout: CapturedOutput::from_bytes(spec.program.as_bytes(), 0),
                stderr: CapturedOutput::default(),
                usage: ResourceUsage::default(),
            })
        }
    }

    struct Setup {
        listener: TcpListener,
        executor: Arc<FakeExecutor>,
        shutdown: CancellationToken,
        _dir: tempfile::TempDir,
    }

    async fn start_agent(slots: u32, executor: FakeExecutor) -> Setup {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FsArtifactStore::open(dir.path(), RetentionPolicy::default())
                .await
                .unwrap(),
        );
        let source = Arc::new(MemorySource::with(&[b"rootfs"]));
        let fetcher = Fetcher::new(store, vec![source], 0, Duration::from_millis(1));
        let executor = Arc::new(executor);
        let config = WorkerConfig {
            broker: listener.local_addr().unwrap().to_string(),
            slots,
            heartbeat_interval: Duration::from_secs(60),
            reconnect_min: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(20),
            ..Default::default()
        };
        let agent = Agent::new(&config, fetcher, executor.clone());
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move { agent.run(token).await });
        Setup {
            listener,
            executor,
            shutdown,
            _dir: dir,
        }
    }

    async fn accept(listener: &TcpListener) -> (Connection<TcpStream>, Peer) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream);
        let peer = accept_hello(&mut conn, ResourceId::new()).await.unwrap();
        (conn, peer)
    }

    /// Next message other than a heartbeat.
    async fn next(conn: &mut Connection<TcpStream>) -> WorkerToBroker {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), conn.expect::<WorkerToBroker>())
                .await
                .unwrap()
                .unwrap();
            if msg != WorkerToBroker::Heartbeat {
                return msg;
            }
        }
    }

    fn job(program: &str) -> (JobId, JobSpec) {
        let spec = JobSpec::new(program, vec![Digest::of(b"rootfs")]);
        (spec.id(), spec)
    }

    #[tokio::test]
    async fn test_runs_assigned_job() {
        let setup = start_agent(2, FakeExecutor::default()).await;
        let (mut conn, peer) = accept(&setup.listener).await;
        assert_eq!(
            peer,
            Peer::Worker {
                slots: 2,
                cached: vec![]
            }
        );

        let (job_id, spec) = job("/bin/echo");
        conn.send(&BrokerToWorker::EnqueueJob { job_id, spec })
            .await
            .unwrap();

        assert_eq!(next(&mut conn).await, WorkerToBroker::JobStarted { job_id });
        match next(&mut conn).await {
            WorkerToBroker::JobResult { job_id: id, outcome } => {
                assert_eq!(id, job_id);
                assert!(outcome.is_success());
            }
            other => panic!("expected a result, got {other:?}"),
        }
        assert_eq!(
            next(&mut conn).await,
            WorkerToBroker::CapacityUpdate {
                free_slots: 2,
                cached: vec![Digest::of(b"rootfs")],
                evicted: vec![],
            }
        );
        setup.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_job_reports_capacity_only() {
        let setup = start_agent(1, FakeExecutor::blocking(Duration::ZERO)).await;
        let (mut conn, _) = accept(&setup.listener).await;

        let (job_id, spec) = job("/bin/sleep");
        conn.send(&BrokerToWorker::EnqueueJob { job_id, spec })
            .await
            .unwrap();
        assert_eq!(next(&mut conn).await, WorkerToBroker::JobStarted { job_id });

        conn.send(&BrokerToWorker::CancelJob { job_id }).await.unwrap();
        assert!(matches!(
            next(&mut conn).await,
            WorkerToBroker::CapacityUpdate { free_slots: 1, .. }
        ));
        assert_eq!(setup.executor.cancelled.load(Ordering::SeqCst), 1);
        setup.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_assignment_beyond_slots_fails() {
        let setup = start_agent(1, FakeExecutor::blocking(Duration::ZERO)).await;
        let (mut conn, _) = accept(&setup.listener).await;

        let (first, spec) = job("/bin/a");
        conn.send(&BrokerToWorker::EnqueueJob { job_id: first, spec })
            .await
            .unwrap();
        assert_eq!(next(&mut conn).await, WorkerToBroker::JobStarted { job_id: first });

        let (second, spec) = job("/bin/b");
        conn.send(&BrokerToWorker::EnqueueJob { job_id: second, spec })
            .await
            .unwrap();
        match next(&mut conn).await {
            WorkerToBroker::JobResult { job_id, outcome } => {
                assert_eq!(job_id, second);
                assert!(matches!(
                    outcome,
                    JobOutcome::Failed(FailureReason::SandboxSetup { .. })
                ));
            }
            other => panic!("expected a result, got {other:?}"),
        }
        setup.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reconnects_and_cancels_on_disconnect() {
        let setup = start_agent(1, FakeExecutor::blocking(Duration::ZERO)).await;
        let (mut conn, _) = accept(&setup.listener).await;

        let (job_id, spec) = job("/bin/a");
        conn.send(&BrokerToWorker::EnqueueJob { job_id, spec })
            .await
            .unwrap();
        assert_eq!(next(&mut conn).await, WorkerToBroker::JobStarted { job_id });
        drop(conn);

        // The agent comes back and announces the layer it fetched.
        let (_conn, peer) = tokio::time::timeout(Duration::from_secs(5), accept(&setup.listener))
            .await
            .unwrap();
        assert_eq!(
            peer,
            Peer::Worker {
                slots: 1,
                cached: vec![Digest::of(b"rootfs")]
            }
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while setup.executor.cancelled.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        setup.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_reconnects_only_after_cancelled_jobs_tear_down() {
        let setup = start_agent(1, FakeExecutor::blocking(Duration::from_millis(300))).await;
        let (mut conn, _) = accept(&setup.listener).await;

        let (job_id, spec) = job("/bin/a");
        conn.send(&BrokerToWorker::EnqueueJob { job_id, spec })
            .await
            .unwrap();
        assert_eq!(next(&mut conn).await, WorkerToBroker::JobStarted { job_id });
        drop(conn);

        let (_conn, peer) = tokio::time::timeout(Duration::from_secs(5), accept(&setup.listener))
            .await
            .unwrap();
        // The slot it announces is really free again.
        assert_eq!(setup.executor.cancelled.load(Ordering::SeqCst), 1);
        assert!(matches!(peer, Peer::Worker { slots: 1, .. }));
        setup.shutdown.cancel();
    }
}
