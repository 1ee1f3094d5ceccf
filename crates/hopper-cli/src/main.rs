//! Hopper CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "hopper")]
#[command(about = "Hopper job execution CLI", long_about = None)]
struct Cli {
    /// Broker address for submissions and pushes
    #[arg(long, env = "HOPPER_BROKER", default_value = "127.0.0.1:7070")]
    broker: String,

    /// Broker HTTP address
    #[arg(long, env = "HOPPER_BROKER_HTTP", default_value = "http://127.0.0.1:7071")]
    http: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push the layers in a job file, run its jobs and report results
    Run {
        /// Path to the job file
        #[arg(default_value = "jobs.kdl")]
        path: PathBuf,
        /// Print captured output of passing jobs too
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show broker statistics
    Stats {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a job file without contacting the broker
    Validate {
        /// Path to the job file
        #[arg(default_value = "jobs.kdl")]
        path: PathBuf,
    },
    /// Pack a file or directory into a layer and push it
    Push {
        /// File or directory to pack
        path: PathBuf,
        /// Where the contents appear in the job's root filesystem
        #[arg(long, default_value = "/")]
        dest: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { path, verbose } => {
            if !commands::run::run(&cli.broker, &path, verbose).await? {
                std::process::exit(1);
            }
        }
        Commands::Stats { json } => {
            commands::stats::show(&cli.http, json).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Push { path, dest } => {
            commands::push(&cli.broker, &path, &dest).await?;
        }
    }

    Ok(())
}
