//! Job outcomes.
//!
//! An outcome is produced exactly once per terminal job transition. A job
//! that ran and exited non-zero is still [`JobOutcome::Completed`]: the
//! execution pipeline worked, the program reported failure. Everything under
//! [`JobOutcome::Failed`] is about the pipeline itself (or the client's
//! decision to stop it).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How the job's process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Output captured from one stream, bounded by the worker's output limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// The first bytes of the stream, decoded lossily as UTF-8.
    pub data: String,
    /// Number of bytes dropped after the limit was reached.
    #[serde(default)]
    pub truncated: u64,
}

impl CapturedOutput {
    pub fn from_bytes(bytes: &[u8], truncated: u64) -> Self {
        Self {
            data: String::from_utf8_lossy(bytes).into_owned(),
            truncated,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated > 0
    }

    /// The captured text followed by a truncation marker when bytes were
    /// dropped.
    pub fn render(&self) -> String {
        if self.is_truncated() {
            format!("{}\n[... {} bytes truncated]", self.data, self.truncated)
        } else {
            self.data.clone()
        }
    }
}

/// Resource usage of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_time: Duration,
    pub user_time: Duration,
    pub system_time: Duration,
    pub max_rss_bytes: u64,
}

/// Data reported for a job whose process ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completed {
    pub exit_status: ExitStatus,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub usage: ResourceUsage,
}

/// Why a job did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// An artifact could not be fetched or failed verification.
    ArtifactFetch { message: String },
    /// The isolation context or root filesystem could not be set up.
    SandboxSetup { message: String },
    /// The job exceeded its wall-clock timeout and was killed.
    Timeout {
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        usage: ResourceUsage,
    },
    /// The worker running the job disconnected or stopped heartbeating.
    WorkerLost,
    /// Infrastructure failures exhausted the retry budget.
    RetriesExhausted {
        attempts: u32,
        last: Box<FailureReason>,
    },
    /// The job waited in the queue longer than its submission allowed.
    QueueTimeout,
    /// The client cancelled the job.
    Cancelled,
    /// The broker refused the submission (invalid spec, missing layers).
    Rejected { message: String },
}

impl FailureReason {
    /// Infrastructure failures are retried by the broker; everything else is
    /// terminal.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FailureReason::ArtifactFetch { .. }
                | FailureReason::SandboxSetup { .. }
                | FailureReason::WorkerLost
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ArtifactFetch { message } => write!(f, "artifact fetch: {message}"),
            FailureReason::SandboxSetup { message } => write!(f, "sandbox setup: {message}"),
            FailureReason::Timeout { usage, .. } => {
                write!(f, "timed out after {:.1}s", usage.wall_time.as_secs_f64())
            }
            FailureReason::WorkerLost => f.write_str("worker lost"),
            FailureReason::RetriesExhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts (last: {last})")
            }
            FailureReason::QueueTimeout => f.write_str("timed out waiting in queue"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Rejected { message } => write!(f, "rejected: {message}"),
        }
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(Completed),
    Failed(FailureReason),
}

impl JobOutcome {
    /// True when the job ran and its program exited successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed(c) if c.exit_status.success())
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            JobOutcome::Failed(reason) => Some(reason),
            JobOutcome::Completed(_) => None,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed(c) => write!(f, "completed ({})", c.exit_status),
            JobOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(code: i32) -> JobOutcome {
        JobOutcome::Completed(Completed {
            exit_status: ExitStatus::Exited(code),
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            usage: ResourceUsage::default(),
        })
    }

    #[test]
    fn test_non_zero_exit_is_completed_not_failed() {
        let outcome = completed(3);
        assert!(!outcome.is_success());
        assert!(outcome.failure().is_none());
        assert!(completed(0).is_success());
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(FailureReason::WorkerLost.is_infrastructure());
        assert!(
            FailureReason::ArtifactFetch {
                message: "x".into()
            }
            .is_infrastructure()
        );
        assert!(!FailureReason::Cancelled.is_infrastructure());
        assert!(!FailureReason::QueueTimeout.is_infrastructure());
        let timeout = FailureReason::Timeout {
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            usage: ResourceUsage::default(),
        };
        assert!(!timeout.is_infrastructure());
    }

    #[test]
    fn test_truncation_marker() {
        let output = CapturedOutput::from_bytes(b"abc", 10);
        assert_eq!(output.render(), "abc\n[... 10 bytes truncated]");
        assert_eq!(CapturedOutput::from_bytes(b"abc", 0).render(), "abc");
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = JobOutcome::Failed(FailureReason::WorkerLost);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["reason"], "worker_lost");
    }
}
