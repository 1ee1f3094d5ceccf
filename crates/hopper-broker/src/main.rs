//! Hopper broker server.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use hopper_broker::Broker;
use hopper_config::BrokerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "hopper-broker")]
#[command(about = "Hopper job broker", long_about = None)]
struct Args {
    /// Path to broker.kdl
    #[arg(long, env = "HOPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Address for clients, workers and artifact transfers
    #[arg(long, env = "HOPPER_LISTEN")]
    listen: Option<SocketAddr>,

    /// Address for /health, /stats and /events
    #[arg(long, env = "HOPPER_HTTP_LISTEN")]
    http_listen: Option<SocketAddr>,

    /// Artifact store directory
    #[arg(long, env = "HOPPER_STORE_ROOT")]
    store_root: Option<PathBuf>,

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

fn load_config(args: &Args) -> anyhow::Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(http_listen) = args.http_listen {
        config.http_listen = http_listen;
    }
    if let Some(root) = &args.store_root {
        config.store.root = root.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format);
    let config = load_config(&args)?;

    let broker = Broker::start(&config)
        .await
        .context("Failed to start broker")?;
    broker
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    Ok(())
}
