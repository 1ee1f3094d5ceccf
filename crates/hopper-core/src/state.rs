//! Job state machine.
//!
//! ```text
//! Queued -> Assigned -> Running -> Completed | Failed
//!    ^          |          |
//!    +----------+----------+   (Requeue, on infrastructure failure)
//! ```
//!
//! Any non-terminal state can also move to `Cancelled` once no client is
//! waiting for the job.
//!
//! Every transition goes through [`JobState::apply`], so the retry and
//! requeue behaviour of the broker can be tested without any workers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::WorkerId;
use crate::outcome::FailureReason;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Assigned { worker: WorkerId },
    Running { worker: WorkerId },
    Completed,
    Failed { reason: FailureReason },
    Cancelled,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The scheduler placed the job on a worker.
    Assign(WorkerId),
    /// The worker reported that the job's process started.
    Start,
    /// The job ran to completion (whatever its exit status).
    Finish,
    /// The job ended without completing.
    Fail(FailureReason),
    /// The job goes back to the queue after an infrastructure failure.
    Requeue,
    /// Every client waiting for the job cancelled it.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job transition: {event} while {state}")]
pub struct InvalidTransition {
    pub state: &'static str,
    pub event: &'static str,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Assigned { .. } => "assigned",
            JobState::Running { .. } => "running",
            JobState::Completed => "completed",
            JobState::Failed { .. } => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed { .. } | JobState::Cancelled
        )
    }

    /// The worker currently holding the job, if any.
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            JobState::Assigned { worker } | JobState::Running { worker } => Some(*worker),
            _ => None,
        }
    }

    /// Compute the state after `event`.
    pub fn apply(&self, event: JobEvent) -> Result<JobState, InvalidTransition> {
        let next = match (self, &event) {
            (JobState::Queued, JobEvent::Assign(worker)) => JobState::Assigned { worker: *worker },
            (JobState::Assigned { worker }, JobEvent::Start) => {
                JobState::Running { worker: *worker }
            }
            (JobState::Assigned { .. } | JobState::Running { .. }, JobEvent::Finish) => {
                JobState::Completed
            }
            (JobState::Assigned { .. } | JobState::Running { .. }, JobEvent::Requeue) => {
                JobState::Queued
            }
            (
                JobState::Queued | JobState::Assigned { .. } | JobState::Running { .. },
                JobEvent::Fail(reason),
            ) => JobState::Failed {
                reason: reason.clone(),
            },
            (
                JobState::Queued | JobState::Assigned { .. } | JobState::Running { .. },
                JobEvent::Cancel,
            ) => JobState::Cancelled,
            _ => {
                return Err(InvalidTransition {
                    state: self.name(),
                    event: event_name(&event),
                });
            }
        };
        Ok(next)
    }
}

fn event_name(event: &JobEvent) -> &'static str {
    match event {
        JobEvent::Assign(_) => "assign",
        JobEvent::Start => "start",
        JobEvent::Finish => "finish",
        JobEvent::Fail(_) => "fail",
        JobEvent::Requeue => "requeue",
        JobEvent::Cancel => "cancel",
    }
}

/// What the broker does with a job after an infrastructure failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back at the front of the queue.
    Requeue,
    /// Give up; the job terminates with this reason.
    GiveUp(FailureReason),
}

/// A job's state plus the number of times it has been requeued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub state: JobState,
    pub requeues: u32,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl JobProgress {
    pub fn new() -> Self {
        Self {
            state: JobState::Queued,
            requeues: 0,
        }
    }

    /// Number of execution attempts started so far, counting the current one.
    pub fn attempts(&self) -> u32 {
        self.requeues + 1
    }

    pub fn apply(&mut self, event: JobEvent) -> Result<&JobState, InvalidTransition> {
        self.state = self.state.apply(event)?;
        Ok(&self.state)
    }

    /// Handle an infrastructure failure of the current attempt. A job that
    /// has already been requeued `max_retries` times fails with
    /// [`FailureReason::RetriesExhausted`]; otherwise it is requeued.
    pub fn infrastructure_failure(
        &mut self,
        reason: FailureReason,
        max_retries: u32,
    ) -> Result<RetryDecision, InvalidTransition> {
        if self.requeues >= max_retries {
            let terminal = FailureReason::RetriesExhausted {
                attempts: self.attempts(),
                last: Box::new(reason),
            };
            self.apply(JobEvent::Fail(terminal.clone()))?;
            Ok(RetryDecision::GiveUp(terminal))
        } else {
            self.apply(JobEvent::Requeue)?;
            self.requeues += 1;
            Ok(RetryDecision::Requeue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let worker = WorkerId::new();
        let mut progress = JobProgress::new();
        progress.apply(JobEvent::Assign(worker)).unwrap();
        assert_eq!(progress.state.worker(), Some(worker));
        progress.apply(JobEvent::Start).unwrap();
        assert!(matches!(progress.state, JobState::Running { .. }));
        progress.apply(JobEvent::Finish).unwrap();
        assert!(progress.state.is_terminal());
    }

    #[test]
    fn test_cannot_start_a_queued_job() {
        let err = JobState::Queued.apply(JobEvent::Start).unwrap_err();
        assert_eq!(err.state, "queued");
        assert_eq!(err.event, "start");
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let done = JobState::Completed;
        assert!(done.apply(JobEvent::Requeue).is_err());
        assert!(done.apply(JobEvent::Fail(FailureReason::Cancelled)).is_err());
        assert!(done.apply(JobEvent::Assign(WorkerId::new())).is_err());
    }

    #[test]
    fn test_queued_job_can_be_cancelled() {
        let next = JobState::Queued
            .apply(JobEvent::Fail(FailureReason::Cancelled))
            .unwrap();
        assert_eq!(
            next,
            JobState::Failed {
                reason: FailureReason::Cancelled
            }
        );
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        let worker = WorkerId::new();
        for state in [
            JobState::Queued,
            JobState::Assigned { worker },
            JobState::Running { worker },
        ] {
            let next = state.apply(JobEvent::Cancel).unwrap();
            assert_eq!(next, JobState::Cancelled);
            assert!(next.is_terminal());
            assert_eq!(next.worker(), None);
        }
        let err = JobState::Cancelled.apply(JobEvent::Cancel).unwrap_err();
        assert_eq!(err.state, "cancelled");
        assert!(JobState::Completed.apply(JobEvent::Cancel).is_err());
    }

    #[test]
    fn test_requeue_budget_is_bounded() {
        let max_retries = 2;
        let mut progress = JobProgress::new();
        let mut attempts = 0;
        loop {
            progress.apply(JobEvent::Assign(WorkerId::new())).unwrap();
            attempts += 1;
            match progress
                .infrastructure_failure(FailureReason::WorkerLost, max_retries)
                .unwrap()
            {
                RetryDecision::Requeue => assert_eq!(progress.state, JobState::Queued),
                RetryDecision::GiveUp(reason) => {
                    assert!(matches!(
                        reason,
                        FailureReason::RetriesExhausted { attempts: 3, .. }
                    ));
                    break;
                }
            }
        }
        assert_eq!(attempts, max_retries + 1);
        assert!(progress.state.is_terminal());
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let mut progress = JobProgress::new();
        progress.apply(JobEvent::Assign(WorkerId::new())).unwrap();
        let decision = progress
            .infrastructure_failure(
                FailureReason::SandboxSetup {
                    message: "no cgroup".into(),
                },
                0,
            )
            .unwrap();
        assert!(matches!(decision, RetryDecision::GiveUp(_)));
    }
}
