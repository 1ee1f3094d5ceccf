//! Resource limits.
//!
//! With a delegated cgroup v2 root, each job gets a child cgroup carrying
//! `cpu.max`, `memory.max` and `pids.max`, and the job joins it before it
//! execs. Without one, memory and process limits fall back to rlimits and
//! the CPU limit is not enforced.

use hopper_core::ResourceLimits;
use nix::sys::resource::{Resource, setrlimit};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ExecutorError, ExecutorResult};

/// Scheduler period `cpu.max` quotas are expressed against, in microseconds.
const CPU_PERIOD_MICROS: u64 = 100_000;

/// A per-job child cgroup, removed on drop.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create `parent/name` and write the job's limits into it.
    pub fn create(parent: &Path, name: &str, limits: &ResourceLimits) -> ExecutorResult<Self> {
        let cgroup = Self::make(parent.join(name))?;
        cgroup.set_limits(limits)?;
        Ok(cgroup)
    }

    fn make(path: PathBuf) -> ExecutorResult<Self> {
        fs::create_dir(&path)
            .map_err(|e| ExecutorError::Cgroup(format!("creating {}: {e}", path.display())))?;
        Ok(Self { path })
    }

    fn set_limits(&self, limits: &ResourceLimits) -> ExecutorResult<()> {
        if let Some(millis) = limits.cpu_millis {
            let quota = u64::from(millis) * CPU_PERIOD_MICROS / 1000;
            self.write("cpu.max", &format!("{quota} {CPU_PERIOD_MICROS}"))?;
        }
        if let Some(bytes) = limits.memory_bytes {
            self.write("memory.max", &bytes.to_string())?;
            // Without this the job would swap instead of hitting the limit.
            if let Err(e) = self.write("memory.swap.max", "0") {
                debug!(error = %e, "Could not disable swap for cgroup");
            }
        }
        if let Some(count) = limits.max_processes {
            self.write("pids.max", &count.to_string())?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &str, value: &str) -> ExecutorResult<()> {
        fs::write(self.path.join(file), value)
            .map_err(|e| ExecutorError::Cgroup(format!("writing {file}: {e}")))
    }

    /// `cgroup.procs`, opened for the child to write its own pid into.
    pub fn procs_file(&self) -> ExecutorResult<File> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
            .map_err(|e| ExecutorError::Cgroup(format!("opening cgroup.procs: {e}")))
    }

    /// Kill every process in the cgroup.
    pub fn kill(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        // Kernels before 5.14 have no cgroup.kill.
        let Ok(procs) = fs::read_to_string(self.path.join("cgroup.procs")) else {
            return;
        };
        for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    /// Peak memory use, on kernels that track it.
    pub fn memory_peak(&self) -> Option<u64> {
        fs::read_to_string(self.path.join("memory.peak"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the cgroup. Killed processes take a moment to leave it, so
    /// this retries briefly.
    fn remove(&self) -> io::Result<()> {
        let mut delay = Duration::from_millis(5);
        for _ in 0..8 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                // Outside cgroupfs the interface files are ordinary files.
                Err(e)
                    if e.kind() == io::ErrorKind::DirectoryNotEmpty
                        && !self.path.join("cgroup.controllers").exists() =>
                {
                    return fs::remove_dir_all(&self.path);
                }
                Err(_) => {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
        fs::remove_dir(&self.path)
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(path = %self.path.display(), error = %e, "Failed to remove cgroup");
        }
    }
}

/// rlimits applied in the child when there is no cgroup.
#[derive(Debug, Clone, Default)]
pub struct Rlimits {
    limits: Vec<(Resource, u64)>,
}

impl Rlimits {
    pub fn for_job(limits: &ResourceLimits) -> Self {
        let mut out = Vec::new();
        if let Some(bytes) = limits.memory_bytes {
            out.push((Resource::RLIMIT_AS, bytes));
        }
        if let Some(count) = limits.max_processes {
            out.push((Resource::RLIMIT_NPROC, u64::from(count)));
        }
        if limits.cpu_millis.is_some() {
            warn!("CPU limit needs a cgroup root and is not enforced");
        }
        Self { limits: out }
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Apply in the current process. Runs between fork and exec, so it must
    /// not allocate.
    pub fn apply(&self) -> io::Result<()> {
        for (resource, value) in &self.limits {
            setrlimit(*resource, *value, *value)?;
        }
        Ok(())
    }
}
