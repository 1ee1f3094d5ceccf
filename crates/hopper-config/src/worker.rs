//! Worker configuration.
//!
//! ```kdl
//! worker {
//!     broker "broker.internal:7070"
//!     slots 8
//!     heartbeat-interval-ms 5000
//!     reconnect-min-ms 100
//!     reconnect-max-ms 30000
//!     fetch-retries 3
//!     mirror "mirror-a.internal:7070"
//! }
//! cache {
//!     root "/var/cache/hopper"
//!     capacity-bytes 21474836480
//!     retention-secs 600
//! }
//! sandbox {
//!     namespaces #true
//!     cgroup-root "/sys/fs/cgroup/hopper"
//!     output-limit-bytes 1048576
//!     scratch-root "/var/tmp/hopper"
//!     kill-grace-ms 2000
//! }
//! ```

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::node;
use crate::store::StoreConfig;
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Broker address, `host:port`.
    pub broker: String,
    /// Number of jobs run concurrently.
    pub slots: u32,
    pub heartbeat_interval: Duration,
    /// Reconnect backoff starts here and doubles up to `reconnect_max`.
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Extra attempts against one artifact source after a transient error.
    pub fetch_retries: u32,
    /// Artifact sources tried after the broker, in order.
    pub mirrors: Vec<String>,
    pub cache: StoreConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Run jobs in fresh Linux namespaces. When off, jobs still get their own
    /// root directory, process group, rlimits and timeout, but share the
    /// host's namespaces.
    pub namespaces: bool,
    /// A delegated cgroup v2 directory. When set, limits are enforced through
    /// per-job child cgroups instead of rlimits.
    pub cgroup_root: Option<PathBuf>,
    /// Bytes of stdout and of stderr kept per job.
    pub output_limit_bytes: u64,
    /// Where per-job root filesystems are assembled.
    pub scratch_root: PathBuf,
    /// Time between SIGTERM and SIGKILL when a job is stopped.
    pub kill_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            namespaces: true,
            cgroup_root: None,
            output_limit_bytes: 1024 * 1024,
            scratch_root: std::env::temp_dir().join("hopper"),
            kill_grace: Duration::from_secs(2),
        }
    }
}

fn default_slots() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1:7070".to_string(),
            slots: default_slots(),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_min: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(30),
            fetch_retries: 3,
            mirrors: Vec::new(),
            cache: StoreConfig::with_root("/var/cache/hopper"),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Read and parse a worker.kdl file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        parse_worker_config(&text)
    }

    /// Check cross-field constraints. Called after all overrides are applied.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.slots == 0 {
            return Err(ConfigError::invalid("worker.slots", "must be at least 1"));
        }
        if self.reconnect_min > self.reconnect_max {
            return Err(ConfigError::invalid(
                "worker.reconnect-min-ms",
                "must not exceed reconnect-max-ms",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                "worker.heartbeat-interval-ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Parse worker configuration from KDL text. Unknown nodes are ignored.
pub fn parse_worker_config(kdl: &str) -> ConfigResult<WorkerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = WorkerConfig::default();

    for section in doc.nodes() {
        match node::name(section) {
            "worker" => {
                for child in node::children(section) {
                    let field = format!("worker.{}", node::name(child));
                    match node::name(child) {
                        "broker" => config.broker = node::string(child, &field)?,
                        "slots" => config.slots = node::u32_arg(child, &field)?,
                        "heartbeat-interval-ms" => {
                            config.heartbeat_interval =
                                Duration::from_millis(node::u64_arg(child, &field)?)
                        }
                        "reconnect-min-ms" => {
                            config.reconnect_min = Duration::from_millis(node::u64_arg(child, &field)?)
                        }
                        "reconnect-max-ms" => {
                            config.reconnect_max = Duration::from_millis(node::u64_arg(child, &field)?)
                        }
                        "fetch-retries" => config.fetch_retries = node::u32_arg(child, &field)?,
                        "mirror" => config.mirrors.extend(node::string_args(child)),
                        _ => {}
                    }
                }
            }
            "cache" => config.cache.apply(section)?,
            "sandbox" => {
                let sandbox = &mut config.sandbox;
                for child in node::children(section) {
                    let field = format!("sandbox.{}", node::name(child));
                    match node::name(child) {
                        "namespaces" => sandbox.namespaces = node::bool_arg(child, &field)?,
                        "cgroup-root" => {
                            sandbox.cgroup_root = Some(PathBuf::from(node::string(child, &field)?))
                        }
                        "output-limit-bytes" => {
                            sandbox.output_limit_bytes = node::u64_arg(child, &field)?
                        }
                        "scratch-root" => {
                            sandbox.scratch_root = PathBuf::from(node::string(child, &field)?)
                        }
                        "kill-grace-ms" => {
                            sandbox.kill_grace = Duration::from_millis(node::u64_arg(child, &field)?)
                        }
                        _ => {}
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    config.validate()?;
    Ok(config)
}
