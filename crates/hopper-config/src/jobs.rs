//! Job files.
//!
//! A job file lists jobs for the CLI to submit:
//!
//! ```kdl
//! job "unit-tests" {
//!     program "/app/bin/tests"
//!     args "--test-threads" "1"
//!     env {
//!         RUST_BACKTRACE "1"
//!     }
//!     layer "./rootfs"
//!     layer "./target/debug" dest="/app/bin"
//!     layer digest="9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//!     working-directory "/app"
//!     timeout-secs 60
//!     memory-mb 512
//!     cpus 1.5
//!     max-processes 128
//!     priority 10
//!     network "loopback"
//!     queue-timeout-secs 300
//! }
//! ```
//!
//! Layer paths are relative to the job file. A path layer is packed by the
//! CLI; a digest layer must already be in the broker's store.

use hopper_core::job::{JobSpec, NetworkPolicy, ResourceLimits};
use hopper_core::Digest;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::node;
use crate::{ConfigError, ConfigResult};

/// Where a job layer comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerSource {
    /// A host file or directory packed into a layer, placed at `dest`.
    Path { source: PathBuf, dest: String },
    /// A layer already in the broker's store.
    Digest(Digest),
}

/// One `job` node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub program: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub layers: Vec<LayerSource>,
    pub working_directory: String,
    pub limits: ResourceLimits,
    pub network: NetworkPolicy,
    pub priority: i8,
    pub queue_timeout: Option<Duration>,
}

impl JobDefinition {
    /// Build the job's spec once every layer has a digest. `resolved` must
    /// hold one digest per entry of `self.layers`, in order.
    pub fn to_spec(&self, resolved: Vec<Digest>) -> JobSpec {
        JobSpec {
            program: self.program.clone(),
            arguments: self.arguments.clone(),
            environment: self.environment.clone(),
            layers: resolved,
            working_directory: self.working_directory.clone(),
            limits: self.limits.clone(),
            network: self.network,
            priority: self.priority,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFile {
    pub jobs: Vec<JobDefinition>,
}

impl JobFile {
    /// Read a job file. Relative layer paths are resolved against the file's
    /// directory.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        parse_job_file(&text, base)
    }
}

/// Parse a job file from KDL text, resolving relative layer paths against
/// `base`.
pub fn parse_job_file(kdl: &str, base: &Path) -> ConfigResult<JobFile> {
    let doc: KdlDocument = kdl.parse()?;
    let mut jobs = Vec::new();
    let mut names = HashSet::new();

    for node in doc.nodes() {
        if node::name(node) != "job" {
            continue;
        }
        let job = parse_job(node, base)?;
        if !names.insert(job.name.clone()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
        jobs.push(job);
    }

    if jobs.is_empty() {
        return Err(ConfigError::MissingField("at least one job".to_string()));
    }
    Ok(JobFile { jobs })
}

fn parse_job(job: &KdlNode, base: &Path) -> ConfigResult<JobDefinition> {
    let name = node::first_string_arg(job)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let mut program = None;
    let mut arguments = Vec::new();
    let mut environment = BTreeMap::new();
    let mut layers = Vec::new();
    let mut working_directory = "/".to_string();
    let mut limits = ResourceLimits::default();
    let mut network = NetworkPolicy::default();
    let mut priority = 0;
    let mut queue_timeout = None;

    for child in node::children(job) {
        let field = format!("job '{name}' {}", node::name(child));
        match node::name(child) {
            "program" => program = Some(node::string(child, &field)?),
            "args" => arguments.extend(node::string_args(child)),
            "env" => environment.extend(node::string_map(child, &field)?),
            "layer" => layers.push(parse_layer(child, base, &field)?),
            "working-directory" => working_directory = node::string(child, &field)?,
            "timeout-secs" => {
                limits.timeout = Some(Duration::from_secs(node::u64_arg(child, &field)?))
            }
            "memory-mb" => {
                limits.memory_bytes = Some(node::u64_arg(child, &field)?.saturating_mul(1024 * 1024))
            }
            "cpus" => limits.cpu_millis = Some((node::f64_arg(child, &field)? * 1000.0).round() as u32),
            "max-processes" => limits.max_processes = Some(node::u32_arg(child, &field)?),
            "priority" => priority = node::i8_arg(child, &field)?,
            "network" => {
                let value = node::string(child, &field)?;
                network = value
                    .parse()
                    .map_err(|e: hopper_core::Error| ConfigError::invalid(&field, e.to_string()))?;
            }
            "queue-timeout-secs" => {
                queue_timeout = Some(Duration::from_secs(node::u64_arg(child, &field)?))
            }
            _ => {}
        }
    }

    let program = program.ok_or_else(|| ConfigError::MissingField(format!("program for job '{name}'")))?;
    if layers.is_empty() {
        return Err(ConfigError::MissingField(format!("layer for job '{name}'")));
    }

    Ok(JobDefinition {
        name,
        program,
        arguments,
        environment,
        layers,
        working_directory,
        limits,
        network,
        priority,
        queue_timeout,
    })
}

fn parse_layer(layer: &KdlNode, base: &Path, field: &str) -> ConfigResult<LayerSource> {
    if let Some(digest) = node::string_prop(layer, "digest") {
        let digest = digest
            .parse()
            .map_err(|e: hopper_core::Error| ConfigError::invalid(field, e.to_string()))?;
        return Ok(LayerSource::Digest(digest));
    }

    let source = node::first_string_arg(layer)
        .ok_or_else(|| ConfigError::MissingField(format!("{field} path or digest")))?;
    let source = PathBuf::from(source);
    let source = if source.is_absolute() {
        source
    } else {
        base.join(source)
    };
    let dest = node::string_prop(layer, "dest").unwrap_or_else(|| "/".to_string());
    Ok(LayerSource::Path { source, dest })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_file() {
        let digest = Digest::of(b"prebuilt");
        let kdl = format!(
            r#"
            job "unit" {{
                program "/app/tests"
                args "--quiet" "--jobs" "1"
                env {{
                    RUST_BACKTRACE "1"
                }}
                layer "rootfs"
                layer "/abs/bin" dest="/app"
                layer digest="{digest}"
                timeout-secs 30
                memory-mb 256
                cpus 1.5
                priority -2
                network "loopback"
                queue-timeout-secs 10
            }}
            "#
        );

        let file = parse_job_file(&kdl, Path::new("/work")).unwrap();
        assert_eq!(file.jobs.len(), 1);
        let job = &file.jobs[0];
        assert_eq!(job.name, "unit");
        assert_eq!(job.arguments, vec!["--quiet", "--jobs", "1"]);
        assert_eq!(job.environment["RUST_BACKTRACE"], "1");
        assert_eq!(
            job.layers,
            vec![
                LayerSource::Path {
                    source: PathBuf::from("/work/rootfs"),
                    dest: "/".to_string()
                },
                LayerSource::Path {
                    source: PathBuf::from("/abs/bin"),
                    dest: "/app".to_string()
                },
                LayerSource::Digest(digest),
            ]
        );
        assert_eq!(job.limits.timeout, Some(Duration::from_secs(30)));
        assert_eq!(job.limits.memory_bytes, Some(256 * 1024 * 1024));
        assert_eq!(job.limits.cpu_millis, Some(1500));
        assert_eq!(job.priority, -2);
        assert_eq!(job.network, NetworkPolicy::Loopback);
        assert_eq!(job.queue_timeout, Some(Duration::from_secs(10)));

        let spec = job.to_spec(vec![Digest::of(b"a"), Digest::of(b"b"), digest]);
        spec.validate().unwrap();
        assert_eq!(spec.layers.len(), 3);
    }

    #[test]
    fn test_missing_program() {
        let result = parse_job_file(r#"job "x" { layer "root" }"#, Path::new("."));
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_missing_layers() {
        let result = parse_job_file(r#"job "x" { program "/bin/true" }"#, Path::new("."));
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_duplicate_job_names() {
        let kdl = r#"
            job "x" { program "/a"; layer "r" }
            job "x" { program "/b"; layer "r" }
        "#;
        assert!(matches!(
            parse_job_file(kdl, Path::new(".")),
            Err(ConfigError::Duplicate(_))
        ));
    }

    #[test]
    fn test_bad_digest_and_network() {
        let kdl = r#"job "x" { program "/a"; layer digest="zz" }"#;
        assert!(matches!(
            parse_job_file(kdl, Path::new(".")),
            Err(ConfigError::InvalidValue { .. })
        ));

        let kdl = r#"job "x" { program "/a"; layer "r"; network "wifi" }"#;
        assert!(matches!(
            parse_job_file(kdl, Path::new(".")),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_priority_out_of_range() {
        let kdl = r#"job "x" { program "/a"; layer "r"; priority 300 }"#;
        assert!(matches!(
            parse_job_file(kdl, Path::new(".")),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_resolves_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.kdl");
        std::fs::write(&path, r#"job "x" { program "/a"; layer "root" }"#).unwrap();
        let file = JobFile::load(&path).unwrap();
        assert_eq!(
            file.jobs[0].layers[0],
            LayerSource::Path {
                source: dir.path().join("root"),
                dest: "/".to_string()
            }
        );
    }
}
