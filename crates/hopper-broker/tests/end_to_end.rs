//! Broker, worker and client talking over loopback TCP.
//!
//! The worker runs jobs without namespaces so these tests need no
//! privileges.

use hopper_broker::Broker;
use hopper_client::{Client, ClientError};
use hopper_config::{BrokerConfig, StoreConfig, WorkerConfig};
use hopper_core::artifact::RetentionPolicy;
use hopper_core::{Digest, ExitStatus, FailureReason, JobOutcome, JobSpec};
use hopper_executor::{SandboxExecutor, SandboxOptions};
use hopper_scheduler::SchedulerSnapshot;
use hopper_store::{FsArtifactStore, LayerBuilder};
use hopper_worker::{Agent, Fetcher, RemoteSource};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RESULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Cluster {
    broker: Broker,
    fetcher: Fetcher,
    shutdown: CancellationToken,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_cluster(dir: &Path) -> Cluster {
    let config = BrokerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        http_listen: "127.0.0.1:0".parse().unwrap(),
        tick_interval: Duration::from_millis(100),
        store: StoreConfig::with_root(dir.join("broker")),
        ..Default::default()
    };
    let broker = Broker::start(&config).await.unwrap();
    let addr = broker.addr().to_string();

    let cache = FsArtifactStore::open(dir.join("cache"), RetentionPolicy::default())
        .await
        .unwrap();
    let fetcher = Fetcher::new(
        Arc::new(cache),
        vec![Arc::new(RemoteSource::new(addr.clone()))],
        1,
        Duration::from_millis(10),
    );
    let executor = SandboxExecutor::new(SandboxOptions {
        namespaces: false,
        scratch_root: dir.join("scratch"),
        kill_grace: Duration::from_millis(200),
        ..Default::default()
    });
    let worker_config = WorkerConfig {
        broker: addr,
        slots: 2,
        heartbeat_interval: Duration::from_millis(200),
        ..Default::default()
    };
    let agent = Agent::new(&worker_config, fetcher.clone(), Arc::new(executor));
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { agent.run(token).await });

    // Wait for the worker to register.
    let mut snapshots = broker.snapshots();
    tokio::time::timeout(
        Duration::from_secs(10),
        snapshots.wait_for(|s| s.statistics.workers.len() == 1),
    )
    .await
    .unwrap()
    .unwrap();

    Cluster {
        broker,
        fetcher,
        shutdown,
    }
}

fn text_layer(path: &str, text: &str) -> bytes::Bytes {
    let mut builder = LayerBuilder::new();
    builder.add_file(path, 0o644, text.as_bytes()).unwrap();
    builder.finish()
}

fn greeting_layer() -> bytes::Bytes {
    text_layer("data/greeting.txt", "hello from a layer\n")
}

#[tokio::test]
async fn test_job_runs_and_cached_layers_are_reused() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path()).await;
    let client = Client::connect(cluster.broker.addr().to_string())
        .await
        .unwrap();
    let mut layers = Vec::new();
    for layer in [
        greeting_layer(),
        text_layer("data/name.txt", "from hopper\n"),
        text_layer("data/end.txt", "bye\n"),
    ] {
        layers.push(client.push_layer(layer).await.unwrap());
    }

    let spec = JobSpec::new("/bin/cat", layers.clone())
        .with_args(["data/greeting.txt", "data/name.txt", "data/end.txt"])
        .with_timeout(Duration::from_secs(20));
    let handle = client.submit(spec).await.unwrap();
    let result = tokio::time::timeout(RESULT_TIMEOUT, client.result(handle))
        .await
        .unwrap()
        .unwrap();
    let JobOutcome::Completed(completed) = result.outcome else {
        panic!("expected the job to complete, got {:?}", result.outcome);
    };
    assert_eq!(completed.exit_status, ExitStatus::Exited(0));
    assert_eq!(completed.stdout.data, "hello from a layer\nfrom hopper\nbye\n");
    assert_eq!(cluster.fetcher.attempts(), 3);

    // A different job over the same layers fetches nothing.
    let spec = JobSpec::new("/bin/cat", layers)
        .with_args(["data/end.txt", "data/greeting.txt"])
        .with_timeout(Duration::from_secs(20));
    let handle = client.submit(spec).await.unwrap();
    let result = tokio::time::timeout(RESULT_TIMEOUT, client.result(handle))
        .await
        .unwrap()
        .unwrap();
    assert!(result.outcome.is_success());
    assert_eq!(cluster.fetcher.attempts(), 3);

    let url = format!("http://{}/stats", cluster.broker.http_addr());
    let snapshot: SchedulerSnapshot = reqwest::get(url).await.unwrap().json().await.unwrap();
    assert_eq!(snapshot.statistics.job_states.completed, 2);
    assert_eq!(snapshot.statistics.workers.len(), 1);
}

#[tokio::test]
async fn test_failing_program_is_reported_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path()).await;
    let client = Client::connect(cluster.broker.addr().to_string())
        .await
        .unwrap();
    let layer = client.push_layer(greeting_layer()).await.unwrap();

    let spec = JobSpec::new("/bin/sh", [layer]).with_args(["-c", "echo broken >&2; exit 3"]);
    let handle = client.submit(spec).await.unwrap();
    let result = tokio::time::timeout(RESULT_TIMEOUT, client.result(handle))
        .await
        .unwrap()
        .unwrap();
    let JobOutcome::Completed(completed) = result.outcome else {
        panic!("expected the job to complete, got {:?}", result.outcome);
    };
    assert_eq!(completed.exit_status, ExitStatus::Exited(3));
    assert_eq!(completed.stderr.data, "broken\n");

    let statistics = client.statistics().await.unwrap();
    assert_eq!(statistics.requeues, 0);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path()).await;
    let client = Client::connect(cluster.broker.addr().to_string())
        .await
        .unwrap();
    let layer = client.push_layer(greeting_layer()).await.unwrap();

    let mut snapshots = cluster.broker.snapshots();
    let handle = client
        .submit(JobSpec::new("/bin/sleep", [layer]).with_arg("30"))
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(10),
        snapshots.wait_for(|s| s.statistics.job_states.running == 1),
    )
    .await
    .unwrap()
    .unwrap();

    client.cancel(&handle).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), client.result(handle))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.outcome, JobOutcome::Failed(FailureReason::Cancelled));
    tokio::time::timeout(
        Duration::from_secs(5),
        snapshots.wait_for(|s| s.statistics.job_states.cancelled == 1),
    )
    .await
    .unwrap()
    .unwrap();

    // The worker frees the slot once the sandbox is torn down.
    tokio::time::timeout(
        Duration::from_secs(10),
        snapshots.wait_for(|s| s.statistics.workers.first().is_some_and(|w| w.free_slots == 2)),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_unknown_layer_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path()).await;
    let client = Client::connect(cluster.broker.addr().to_string())
        .await
        .unwrap();

    let spec = JobSpec::new("/bin/true", [Digest::of(b"never pushed")]);
    let err = client.submit(spec).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(_)));
}
