//! Isolation contexts.
//!
//! An [`IsolationContext`] owns everything one execution creates on the
//! host: its scratch directory and assembled root, its cgroup and its
//! process group. Dropping it tears all of that down, whichever way the
//! execution ended.
//!
//! The job's top process leads its process group and stays unreaped until
//! the context reaps it, so the group id cannot be recycled while the
//! context may still signal it.

use hopper_core::JobId;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ExecutorResult;
use crate::launch::{self, Reaped};
use crate::limits::Cgroup;

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Running,
    Teardown,
    Done,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Setup, Phase::Running)
                | (Phase::Setup, Phase::Done)
                | (Phase::Running, Phase::Teardown)
                | (Phase::Teardown, Phase::Done)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Setup => "setup",
            Phase::Running => "running",
            Phase::Teardown => "teardown",
            Phase::Done => "done",
        })
    }
}

/// Counts live isolation contexts.
#[derive(Debug, Clone, Default)]
pub struct ContextTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    live: AtomicUsize,
    created: AtomicU64,
}

impl ContextTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts created and not yet torn down.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> u64 {
        self.inner.created.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        self.inner.created.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct IsolationContext {
    job_id: JobId,
    scratch: PathBuf,
    root: PathBuf,
    cgroup: Option<Cgroup>,
    leader: Option<Pid>,
    phase: Phase,
    tracker: ContextTracker,
}

impl IsolationContext {
    /// Create an empty root under `scratch_root` for `job_id`.
    pub fn create(scratch_root: &Path, job_id: JobId, tracker: &ContextTracker) -> ExecutorResult<Self> {
        fs::create_dir_all(scratch_root)?;
        let scratch = scratch_root.join(format!("{}-{}", job_id.short(), Uuid::new_v4().simple()));
        let root = scratch.join("root");
        fs::create_dir(&scratch)?;
        let context = Self {
            job_id,
            scratch,
            root,
            cgroup: None,
            leader: None,
            phase: Phase::Setup,
            tracker: tracker.clone(),
        };
        tracker.enter();
        // From here on Drop cleans up the scratch directory.
        fs::create_dir(&context.root)?;
        debug!(job_id = %job_id, scratch = %context.scratch.display(), "Created isolation context");
        Ok(context)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A unique name for per-context host resources.
    pub fn name(&self) -> String {
        self.scratch
            .file_name()
            .map(|n| format!("hopper-{}", n.to_string_lossy()))
            .unwrap_or_else(|| format!("hopper-{}", self.job_id.short()))
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, next: Phase) {
        if !self.phase.can_advance_to(next) {
            warn!(job_id = %self.job_id, from = %self.phase, to = %next, "Unexpected phase change");
        }
        debug!(job_id = %self.job_id, from = %self.phase, to = %next, "Execution phase");
        self.phase = next;
    }

    pub fn attach_cgroup(&mut self, cgroup: Cgroup) {
        self.cgroup = Some(cgroup);
    }

    pub fn cgroup(&self) -> Option<&Cgroup> {
        self.cgroup.as_ref()
    }

    /// Record the job's top process, whose pid is also its process group id.
    pub fn set_leader(&mut self, pid: Pid) {
        self.leader = Some(pid);
    }

    /// The job's top process, until it is reaped.
    pub fn leader(&self) -> Option<Pid> {
        self.leader
    }

    /// Reap the top process once it has exited. The process group is not
    /// signalled after this.
    pub fn reap_leader(&mut self) -> io::Result<Reaped> {
        let Some(pid) = self.leader else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no process to reap"));
        };
        let reaped = launch::reap(pid)?;
        self.leader = None;
        Ok(reaped)
    }

    /// Signal the job's process group and cgroup.
    pub fn signal(&self, signal: Signal) {
        if let Some(pgid) = self.leader {
            // ESRCH just means everything already exited.
            let _ = killpg(pgid, signal);
        }
        if signal == Signal::SIGKILL {
            if let Some(cgroup) = &self.cgroup {
                cgroup.kill();
            }
        }
    }
}

impl Drop for IsolationContext {
    fn drop(&mut self) {
        match self.phase {
            Phase::Setup => {}
            Phase::Running => self.advance(Phase::Teardown),
            Phase::Teardown | Phase::Done => {}
        }

        self.signal(Signal::SIGKILL);
        if let Some(pid) = self.leader.take() {
            if let Err(e) = launch::reap(pid) {
                warn!(job_id = %self.job_id, pid = %pid, error = %e, "Failed to reap job process");
            }
        }
        drop(self.cgroup.take());
        if let Err(e) = crate::assembly::remove_tree(&self.scratch) {
            warn!(job_id = %self.job_id, error = %e, "Failed to remove scratch directory");
        }

        if self.phase != Phase::Done {
            self.advance(Phase::Done);
        }
        self.tracker.exit();
    }
}
