//! The sandbox executor.

use async_trait::async_trait;
use hopper_core::executor::{Executor, ResolvedLayer};
use hopper_core::outcome::{CapturedOutput, Completed};
use hopper_core::{ExitStatus, FailureReason, JobId, JobOutcome, JobSpec};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembly::assemble;
use crate::capture::capture;
use crate::context::{ContextTracker, IsolationContext, Phase};
use crate::error::{ExecutorError, ExecutorResult};
use crate::launch;
use crate::limits::{Cgroup, Rlimits};

/// Exit code reported when the program does not exist in the job's root.
const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when the program exists but cannot be executed.
const EXIT_NOT_EXECUTABLE: i32 = 126;

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Enter fresh namespaces. Off runs jobs on the host with only a
    /// private root directory, a process group and limits.
    pub namespaces: bool,
    pub cgroup_root: Option<PathBuf>,
    /// Bytes kept per output stream.
    pub output_limit_bytes: u64,
    pub scratch_root: PathBuf,
    /// Time between SIGTERM and SIGKILL when stopping a job.
    pub kill_grace: Duration,
}

impl Default for SandboxOptions {
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

/// Why a running job was stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Timeout,
    Cancelled,
}

/// Runs jobs in isolation contexts assembled from their layers.
pub struct SandboxExecutor {
    options: SandboxOptions,
    tracker: ContextTracker,
}

impl SandboxExecutor {
    pub fn new(options: SandboxOptions) -> Self {
        Self {
            options,
            tracker: ContextTracker::new(),
        }
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    pub fn tracker(&self) -> &ContextTracker {
        &self.tracker
    }

    async fn setup(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        layers: Vec<ResolvedLayer>,
    ) -> ExecutorResult<IsolationContext> {
        let mut context = IsolationContext::create(&self.options.scratch_root, job_id, &self.tracker)?;

        let root = context.root().to_path_buf();
        let stats = tokio::task::spawn_blocking(move || assemble(&root, &layers))
            .await
            .map_err(|e| ExecutorError::Assembly(format!("assembly task failed: {e}")))??;
        debug!(job_id = %job_id, entries = stats.entries, bytes = stats.bytes, "Assembled root");

        if let Some(parent) = &self.options.cgroup_root {
            let cgroup = Cgroup::create(parent, &context.name(), &spec.limits)?;
            context.attach_cgroup(cgroup);
        }
        Ok(context)
    }

    async fn run(&self, context: &mut IsolationContext, spec: &JobSpec, cancel: CancellationToken) -> JobOutcome {
        let job_id = context.job_id();
        let (rlimits, procs) = match context.cgroup() {
            Some(cgroup) => match cgroup.procs_file() {
                Ok(file) => (Rlimits::default(), Some(file)),
                Err(e) => return JobOutcome::Failed(e.into()),
            },
            None => (Rlimits::for_job(&spec.limits), None),
        };

        let mut command = match launch::command(spec, context.root(), self.options.namespaces, rlimits, procs) {
            Ok(command) => command,
            Err(e) => return JobOutcome::Failed(e.into()),
        };

        let started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return not_started(spec, e),
        };
        let pid = Pid::from_raw(child.id() as i32);
        context.set_leader(pid);
        context.advance(Phase::Running);
        info!(job_id = %job_id, pid = %pid, "Job started");

        let limit = self.options.output_limit_bytes;
        let stdout = child
            .stdout
            .take()
            .and_then(|s| ChildStdout::from_std(s).ok())
            .map(|s| tokio::spawn(capture(s, limit)));
        let stderr = child
            .stderr
            .take()
            .and_then(|s| ChildStderr::from_std(s).ok())
            .map(|s| tokio::spawn(capture(s, limit)));

        let mut waiter = tokio::task::spawn_blocking(move || launch::wait_exited(pid));
        let deadline = async {
            match spec.limits.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let finished = tokio::select! {
            result = &mut waiter => Ok(result),
            _ = deadline => Err(Stop::Timeout),
            _ = cancel.cancelled() => Err(Stop::Cancelled),
        };
        let (stop, exited) = match finished {
            Ok(result) => (None, result),
            Err(stop) => {
                info!(job_id = %job_id, reason = ?stop, "Stopping job");
                context.advance(Phase::Teardown);
                (Some(stop), self.stop(context, &mut waiter).await)
            }
        };
        let wall_time = started.elapsed();

        let stdout = self.collect(context, stdout).await;
        let stderr = self.collect(context, stderr).await;

        let exited = exited.unwrap_or_else(|e| Err(io::Error::other(e)));
        let reaped = match exited.and_then(|()| context.reap_leader()) {
            Ok(reaped) => reaped,
            Err(e) => return wait_failed(e.to_string()),
        };
        let mut usage = reaped.usage(wall_time);
        if let Some(peak) = context.cgroup().and_then(Cgroup::memory_peak) {
            usage.max_rss_bytes = usage.max_rss_bytes.max(peak);
        }

        match stop {
            Some(Stop::Timeout) => JobOutcome::Failed(FailureReason::Timeout { stdout, stderr, usage }),
            Some(Stop::Cancelled) => JobOutcome::Failed(FailureReason::Cancelled),
            None => {
                debug!(job_id = %job_id, status = %reaped.status, "Job exited");
                JobOutcome::Completed(Completed {
                    exit_status: reaped.status,
                    stdout,
                    stderr,
                    usage,
                })
            }
        }
    }

    /// SIGTERM, then SIGKILL once the grace period is over.
    async fn stop(
        &self,
        context: &IsolationContext,
        waiter: &mut JoinHandle<io::Result<()>>,
    ) -> Result<io::Result<()>, tokio::task::JoinError> {
        context.signal(Signal::SIGTERM);
        if let Ok(exited) = tokio::time::timeout(self.options.kill_grace, &mut *waiter).await {
            return exited;
        }
        warn!(job_id = %context.job_id(), "Job ignored SIGTERM, killing");
        context.signal(Signal::SIGKILL);
        waiter.await
    }

    /// Wait for an output stream to close. Stragglers still holding the
    /// pipe after the grace period are killed.
    async fn collect(
        &self,
        context: &IsolationContext,
        task: Option<JoinHandle<CapturedOutput>>,
    ) -> CapturedOutput {
        let Some(mut task) = task else {
            return CapturedOutput::default();
        };
        if let Ok(result) = tokio::time::timeout(self.options.kill_grace, &mut task).await {
            return result.unwrap_or_default();
        }
        context.signal(Signal::SIGKILL);
        match tokio::time::timeout(self.options.kill_grace, &mut task).await {
            Ok(result) => result.unwrap_or_default(),
            Err(_) => {
                task.abort();
                warn!(job_id = %context.job_id(), "Output pipe held open after job exit");
                CapturedOutput::default()
            }
        }
    }
}

/// A program that cannot be started is the job's own failure, reported the
/// way a shell would.
fn not_started(spec: &JobSpec, err: io::Error) -> JobOutcome {
    let code = match err.kind() {
        io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        io::ErrorKind::PermissionDenied => EXIT_NOT_EXECUTABLE,
        _ => {
            return JobOutcome::Failed(FailureReason::SandboxSetup {
                message: format!("spawning {}: {err}", spec.program),
            });
        }
    };
    let message = launch::spawn_failure_message(&spec.program, &err);
    JobOutcome::Completed(Completed {
        exit_status: ExitStatus::Exited(code),
        stdout: CapturedOutput::default(),
        stderr: CapturedOutput::from_bytes(&message, 0),
        usage: Default::default(),
    })
}

fn wait_failed(message: String) -> JobOutcome {
    JobOutcome::Failed(FailureReason::SandboxSetup {
        message: format!("waiting for job: {message}"),
    })
}

#[async_trait]
impl Executor for SandboxExecutor {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn execute(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        layers: Vec<ResolvedLayer>,
        cancel: CancellationToken,
    ) -> JobOutcome {
        let mut context = match self.setup(job_id, spec, layers).await {
            Ok(context) => context,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Sandbox setup failed");
                return JobOutcome::Failed(e.into());
            }
        };

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Failed(FailureReason::Cancelled)
        } else {
            self.run(&mut context, spec, cancel).await
        };

        // Removing a large root blocks, so tear down off the runtime.
        let teardown = tokio::task::spawn_blocking(move || {
            let mut context = context;
            if context.phase() == Phase::Running {
                context.advance(Phase::Teardown);
            }
            drop(context);
        });
        if let Err(e) = teardown.await {
            warn!(job_id = %job_id, error = %e, "Teardown task failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_layer;
    use hopper_store::LayerBuilder;
    use std::path::Path;

    fn executor(scratch: &Path, namespaces: bool) -> SandboxExecutor {
        SandboxExecutor::new(SandboxOptions {
            namespaces,
            cgroup_root: None,
            output_limit_bytes: 1024,
            scratch_root: scratch.join("scratch"),
            kill_grace: Duration::from_millis(500),
        })
    }

    fn shell(script: &str) -> JobSpec {
        JobSpec::new("/bin/sh", [hopper_core::Digest::of(b"unused")]).with_args(["-c", script])
    }

    fn base_layer(dir: &Path) -> ResolvedLayer {
        let mut builder = LayerBuilder::new();
        builder
            .add_file("etc/greeting", 0o644, b"from lower")
            .unwrap()
            .add_file("etc/only-lower", 0o644, b"lower")
            .unwrap();
        write_layer(dir, "base", builder)
    }

    fn completed(outcome: JobOutcome) -> Completed {
        match outcome {
            JobOutcome::Completed(c) => c,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runs_in_assembled_root() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let mut upper = LayerBuilder::new();
        upper.add_file("etc/greeting", 0o644, b"from upper").unwrap();
        let layers = vec![base_layer(dir.path()), write_layer(dir.path(), "upper", upper)];

        let spec = shell("cat etc/greeting; echo; cat etc/only-lower; echo oops >&2; exit 3");
        let outcome = exec
            .execute(spec.id(), &spec, layers, CancellationToken::new())
            .await;
        let done = completed(outcome);
        assert_eq!(done.exit_status, ExitStatus::Exited(3));
        assert_eq!(done.stdout.data, "from upper\nlower");
        assert_eq!(done.stderr.data, "oops\n");
        assert_eq!(exec.tracker().live(), 0);
    }

    #[tokio::test]
    async fn test_environment_is_exactly_the_spec() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let spec = shell("echo \"$GREETING:${HOME:-unset}\"").with_env("GREETING", "hi");
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], CancellationToken::new())
            .await;
        assert_eq!(completed(outcome).stdout.data, "hi:unset\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_sleeper() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let spec = JobSpec::new("/bin/sleep", [hopper_core::Digest::of(b"unused")])
            .with_arg("10")
            .with_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        match outcome {
            JobOutcome::Failed(FailureReason::Timeout { usage, .. }) => {
                assert!(usage.wall_time >= Duration::from_secs(1));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert_eq!(exec.tracker().live(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_then_killed() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let spec = shell("trap '' TERM; sleep 10").with_timeout(Duration::from_millis(200));
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], CancellationToken::new())
            .await;
        assert!(matches!(outcome, JobOutcome::Failed(FailureReason::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let spec = shell("sleep 10");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], cancel)
            .await;
        assert_eq!(outcome, JobOutcome::Failed(FailureReason::Cancelled));
        assert_eq!(exec.tracker().live(), 0);
    }

    #[tokio::test]
    async fn test_output_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let spec = shell("i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done");
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], CancellationToken::new())
            .await;
        let done = completed(outcome);
        assert_eq!(done.exit_status, ExitStatus::Exited(0));
        assert_eq!(done.stdout.data.len(), 1024);
        assert_eq!(done.stdout.truncated, 5500 - 1024);
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let spec = JobSpec::new("/no/such/program", [hopper_core::Digest::of(b"unused")]);
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], CancellationToken::new())
            .await;
        let done = completed(outcome);
        assert_eq!(done.exit_status, ExitStatus::Exited(EXIT_NOT_FOUND));
        assert!(done.stderr.data.contains("/no/such/program"));
    }

    #[tokio::test]
    async fn test_setup_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        let spec = shell("true");
        let missing = ResolvedLayer {
            digest: hopper_core::Digest::of(b"missing"),
            path: dir.path().join("missing"),
        };
        let outcome = exec
            .execute(spec.id(), &spec, vec![missing], CancellationToken::new())
            .await;
        assert!(matches!(outcome, JobOutcome::Failed(FailureReason::SandboxSetup { .. })));
        assert_eq!(exec.tracker().live(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_no_contexts_leak_across_executions() {
        let dir = tempfile::tempdir().unwrap();
        let exec = std::sync::Arc::new(executor(dir.path(), false));
        let layer = base_layer(dir.path());

        let mut tasks = Vec::new();
        for i in 0..6 {
            let exec = exec.clone();
            let layer = layer.clone();
            tasks.push(tokio::spawn(async move {
                let spec = if i % 2 == 0 {
                    shell(&format!("echo {i}"))
                } else {
                    shell("sleep 5").with_timeout(Duration::from_millis(100))
                };
                exec.execute(spec.id(), &spec, vec![layer], CancellationToken::new())
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(exec.tracker().live(), 0);
        assert_eq!(exec.tracker().created(), 6);
    }

    #[tokio::test]
    async fn test_stragglers_killed_after_leader_exits() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), false);
        // The shell exits at once; the backgrounded sleep keeps stdout open
        // until the group is killed.
        let spec = shell("sleep 30 & echo started");
        let started = Instant::now();
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], CancellationToken::new())
            .await;
        let done = completed(outcome);
        assert_eq!(done.exit_status, ExitStatus::Exited(0));
        assert_eq!(done.stdout.data, "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(exec.tracker().live(), 0);
    }

    #[tokio::test]
    async fn test_cgroup_removed_when_job_cannot_join() {
        let dir = tempfile::tempdir().unwrap();
        // A plain directory has no cgroup.procs, so the job fails to start
        // after its cgroup was created.
        let cgroups = dir.path().join("cgroups");
        std::fs::create_dir(&cgroups).unwrap();
        let exec = SandboxExecutor::new(SandboxOptions {
            cgroup_root: Some(cgroups.clone()),
            ..executor(dir.path(), false).options().clone()
        });
        let spec = shell("true").with_memory_limit(1 << 26).with_max_processes(16);
        let outcome = exec
            .execute(spec.id(), &spec, vec![base_layer(dir.path())], CancellationToken::new())
            .await;
        assert!(matches!(outcome, JobOutcome::Failed(FailureReason::SandboxSetup { .. })));
        assert_eq!(std::fs::read_dir(&cgroups).unwrap().count(), 0);
        assert_eq!(exec.tracker().live(), 0);
    }

    // Namespace tests need unprivileged user namespaces and a root
    // filesystem with a shell, so they run against the host's /bin and /lib.
    // Run with: cargo test -- --ignored

    fn host_layer(dir: &Path) -> ResolvedLayer {
        let mut builder = LayerBuilder::new();
        for path in ["bin", "lib", "lib64", "usr/bin", "usr/lib", "usr/lib64"] {
            let host = Path::new("/").join(path);
            if host.exists() {
                builder.add_path_recursive(&host, path).unwrap();
            }
        }
        builder.add_directory("proc", 0o555).unwrap();
        builder.add_directory("tmp", 0o1777).unwrap();
        write_layer(dir, "host", builder)
    }

    #[tokio::test]
    #[ignore]
    async fn test_namespaces_isolate_job() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), true);
        let spec = shell("echo $$; hostname; id -u; ls /");
        let outcome = exec
            .execute(spec.id(), &spec, vec![host_layer(dir.path())], CancellationToken::new())
            .await;
        let done = completed(outcome);
        let lines: Vec<&str> = done.stdout.data.lines().collect();
        assert_eq!(lines[0], "1");
        assert_eq!(lines[1], "hopper");
        assert_eq!(lines[2], "0");
        assert!(!lines.contains(&"home"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_namespace_timeout_kills_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path(), true);
        let spec = shell("sleep 10 & sleep 10").with_timeout(Duration::from_secs(1));
        let started = Instant::now();
        let outcome = exec
            .execute(spec.id(), &spec, vec![host_layer(dir.path())], CancellationToken::new())
            .await;
        assert!(matches!(outcome, JobOutcome::Failed(FailureReason::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(exec.tracker().live(), 0);
    }

    #[tokio::test]
    #[ignore]
    async fn test_nested_chroot_cannot_leave_root() {
        if !Path::new("/usr/bin/perl").exists() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::write(&outside, b"host").unwrap();

        // Root inside the user namespace may chroot; walking up from a nested
        // chroot must still end at the assembled root.
        let script = format!(
            "mkdir 'x'; chroot 'x' or die \"chroot: $!\"; chdir '..' for 1..64; \
             chroot '.' or die \"chroot: $!\"; print((-e '{}') ? 'escaped' : 'contained')",
            outside.display()
        );
        let spec = JobSpec::new("/usr/bin/perl", [hopper_core::Digest::of(b"unused")])
            .with_arg("-e")
            .with_arg(script)
            .with_working_directory("/tmp");
        let exec = executor(dir.path(), true);
        let outcome = exec
            .execute(spec.id(), &spec, vec![host_layer(dir.path())], CancellationToken::new())
            .await;
        let done = completed(outcome);
        assert_eq!(done.exit_status, ExitStatus::Exited(0), "stderr: {}", done.stderr.data);
        assert_eq!(done.stdout.data, "contained");
    }
}
