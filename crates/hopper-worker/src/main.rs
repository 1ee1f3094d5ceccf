//! Hopper worker.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use hopper_config::WorkerConfig;
use hopper_executor::{SandboxExecutor, SandboxOptions};
use hopper_store::FsArtifactStore;
use hopper_worker::{Agent, ArtifactSource, Fetcher, RemoteSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "hopper-worker")]
#[command(about = "Hopper worker agent", long_about = None)]
struct Args {
    /// Path to worker.kdl
    #[arg(long, env = "HOPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Broker address, host:port
    #[arg(long, env = "HOPPER_BROKER")]
    broker: Option<String>,

    /// Concurrent job slots
    #[arg(long, env = "HOPPER_SLOTS")]
    slots: Option<u32>,

    /// Artifact cache directory
    #[arg(long, env = "HOPPER_CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Run jobs in the host's namespaces
    #[arg(long, env = "HOPPER_NO_NAMESPACES")]
    no_namespaces: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "HOPPER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "HOPPER_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(args: &Args) -> anyhow::Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if let Some(broker) = &args.broker {
        config.broker = broker.clone();
    }
    if let Some(slots) = args.slots {
        config.slots = slots;
    }
    if let Some(root) = &args.cache_root {
        config.cache.root = root.clone();
    }
    if args.no_namespaces {
        config.sandbox.namespaces = false;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format);
    let config = load_config(&args)?;

    let store = FsArtifactStore::open(&config.cache.root, config.cache.retention_policy())
        .await
        .with_context(|| format!("Failed to open cache at {}", config.cache.root.display()))?;
    info!(
        root = %config.cache.root.display(),
        artifacts = store.digests().len(),
        "Artifact cache opened"
    );

    let mut sources: Vec<Arc<dyn ArtifactSource>> =
        vec![Arc::new(RemoteSource::new(config.broker.clone()))];
    for mirror in &config.mirrors {
        sources.push(Arc::new(RemoteSource::new(mirror.clone())));
    }
    let fetcher = Fetcher::new(
        Arc::new(store),
        sources,
        config.fetch_retries,
        Duration::from_millis(200),
    );

    let sandbox = &config.sandbox;
    let executor = SandboxExecutor::new(SandboxOptions {
        namespaces: sandbox.namespaces,
        cgroup_root: sandbox.cgroup_root.clone(),
        output_limit_bytes: sandbox.output_limit_bytes,
        scratch_root: sandbox.scratch_root.clone(),
        kill_grace: sandbox.kill_grace,
    });
    info!(
        namespaces = sandbox.namespaces,
        cgroups = sandbox.cgroup_root.is_some(),
        slots = config.slots,
        "Sandbox ready"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            signal.cancel();
        }
    });

    let agent = Agent::new(&config, fetcher, Arc::new(executor));
    agent.run(shutdown).await?;
    Ok(())
}
