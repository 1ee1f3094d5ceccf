//! Job specifications.
//!
//! A [`JobSpec`] is immutable once submitted. Its identity is the digest of
//! its canonical JSON serialization, so two byte-identical submissions are the
//! same job.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::{Digest, Error, Result};

/// Upper bound on the number of layers a job may declare.
pub const MAX_LAYERS: usize = 1024;

/// Identity of a job: the digest of its specification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(pub Digest);

impl JobId {
    pub fn short(&self) -> String {
        self.0.short()
    }
}

/// Specification for a job to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Program to run, resolved inside the job's root filesystem.
    pub program: String,
    /// Arguments passed to the program (not including argv[0]).
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Environment variables. Ordered so the serialization is canonical.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Layer artifacts composing the root filesystem, bottom first.
    pub layers: Vec<Digest>,
    /// Working directory inside the root filesystem.
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    /// Resource limits.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Network access inside the sandbox.
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Scheduling priority. Higher runs first.
    #[serde(default)]
    pub priority: i8,
}

fn default_working_directory() -> String {
    "/".to_string()
}

/// Resource limits for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit in thousandths of a CPU (1000 = one full CPU).
    pub cpu_millis: Option<u32>,
    /// Memory ceiling in bytes.
    pub memory_bytes: Option<u64>,
    /// Maximum number of processes/threads.
    pub max_processes: Option<u32>,
    /// Maximum wall-clock execution time.
    pub timeout: Option<Duration>,
}

/// What network the sandboxed job may see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// A fresh network namespace with no interfaces up.
    #[default]
    #[display("disabled")]
    Disabled,
    /// A fresh network namespace with only the loopback interface up.
    #[display("loopback")]
    Loopback,
    /// The host's network namespace.
    #[display("host")]
    Host,
}

impl std::str::FromStr for NetworkPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disabled" | "none" => Ok(Self::Disabled),
            "loopback" => Ok(Self::Loopback),
            "host" => Ok(Self::Host),
            other => Err(Error::InvalidInput(format!("unknown network policy: {other}"))),
        }
    }
}

impl JobSpec {
    /// Create a spec that runs `program` on top of `layers`.
    pub fn new(program: impl Into<String>, layers: impl IntoIterator<Item = Digest>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            layers: layers.into_iter().collect(),
            working_directory: default_working_directory(),
            limits: ResourceLimits::default(),
            network: NetworkPolicy::default(),
            priority: 0,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = Some(timeout);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_bytes = Some(bytes);
        self
    }

    pub fn with_cpu_millis(mut self, millis: u32) -> Self {
        self.limits.cpu_millis = Some(millis);
        self
    }

    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.limits.max_processes = Some(count);
        self
    }

    pub fn with_network(mut self, network: NetworkPolicy) -> Self {
        self.network = network;
        self
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    /// Canonical byte encoding used for identity.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Struct fields serialize in declaration order and the environment is
        // a BTreeMap, so the encoding is deterministic.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// The job's identity.
    pub fn id(&self) -> JobId {
        JobId(Digest::of(&self.canonical_bytes()))
    }

    /// The set of distinct layer digests, for affinity computations.
    pub fn layer_set(&self) -> HashSet<Digest> {
        self.layers.iter().copied().collect()
    }

    /// Validate the spec at a trust boundary. Malformed specs are rejected
    /// before they are ever queued.
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(Error::InvalidInput("program is empty".to_string()));
        }
        check_no_nul("program", &self.program)?;
        for arg in &self.arguments {
            check_no_nul("argument", arg)?;
        }
        for (key, value) in &self.environment {
            if key.is_empty() || key.contains('=') {
                return Err(Error::InvalidInput(format!(
                    "invalid environment variable name: {key:?}"
                )));
            }
            check_no_nul("environment variable", key)?;
            check_no_nul("environment variable", value)?;
        }
        if !self.working_directory.starts_with('/') {
            return Err(Error::InvalidInput(format!(
                "working directory must be absolute: {:?}",
                self.working_directory
            )));
        }
        check_no_nul("working directory", &self.working_directory)?;

        if self.layers.is_empty() {
            return Err(Error::InvalidInput(
                "job must declare at least one layer".to_string(),
            ));
        }
        if self.layers.len() > MAX_LAYERS {
            return Err(Error::InvalidInput(format!(
                "job declares {} layers, the maximum is {MAX_LAYERS}",
                self.layers.len()
            )));
        }
        if self.layer_set().len() != self.layers.len() {
            return Err(Error::InvalidInput(
                "job declares the same layer more than once".to_string(),
            ));
        }

        let limits = &self.limits;
        if limits.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidInput("timeout must be positive".to_string()));
        }
        if limits.memory_bytes == Some(0) {
            return Err(Error::InvalidInput("memory limit must be positive".to_string()));
        }
        if limits.cpu_millis == Some(0) {
            return Err(Error::InvalidInput("cpu limit must be positive".to_string()));
        }
        if limits.max_processes == Some(0) {
            return Err(Error::InvalidInput(
                "process limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_no_nul(what: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(Error::InvalidInput(format!("{what} contains a NUL byte")));
    }
    Ok(())
}
