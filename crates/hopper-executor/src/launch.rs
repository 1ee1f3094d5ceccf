//! Process launch inside an isolation context.
//!
//! Everything the child needs is computed up front; the `pre_exec` hooks
//! only make system calls.
//!
//! In namespace mode the child unshares user, mount, pid, ipc, uts and
//! (unless the job has host networking) network namespaces, maps the
//! worker's uid and gid to root, then forks once more: the unsharing
//! process cannot itself enter the new pid namespace, so it stays behind
//! and relays the exit status of its child, which becomes pid 1, mounts
//! `/proc`, pivots into the assembled root, detaches the old root and execs
//! the job.

use hopper_core::{ExitStatus, JobSpec, NetworkPolicy, ResourceUsage};
use nix::libc;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::signal::{SigHandler, Signal, raise, signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, chdir, fork, getgid, getuid, pivot_root, sethostname};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{ExecutorError, ExecutorResult};
use crate::limits::Rlimits;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const HOSTNAME: &str = "hopper";

/// The path of `dir` (absolute inside the job root) relative to the root.
fn inside(dir: &str) -> &str {
    dir.trim_start_matches('/')
}

/// Build the command for `spec` running in `root`.
pub fn command(
    spec: &JobSpec,
    root: &Path,
    namespaces: bool,
    rlimits: Rlimits,
    cgroup_procs: Option<File>,
) -> ExecutorResult<Command> {
    let program = if namespaces {
        PathBuf::from(&spec.program)
    } else {
        host_program(root, &spec.program)
    };

    let mut command = Command::new(program);
    command
        .args(&spec.arguments)
        .env_clear()
        .envs(&spec.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    if !spec.environment.contains_key("PATH") {
        command.env("PATH", DEFAULT_PATH);
    }

    let entry = if namespaces {
        Some(NamespaceEntry::new(spec, root)?)
    } else {
        command.current_dir(root.join(inside(&spec.working_directory)));
        None
    };

    let hook = move || -> io::Result<()> {
        rlimits.apply()?;
        if let Some(procs) = &cgroup_procs {
            nix::unistd::write(procs, b"0")?;
        }
        if let Some(entry) = &entry {
            entry.enter()?;
        }
        Ok(())
    };
    // SAFETY: the hook only makes system calls on data prepared before the
    // fork and does not allocate.
    unsafe {
        command.pre_exec(hook);
    }
    Ok(command)
}

/// Without namespaces the job still sees host paths. Programs shipped in a
/// layer are run from the assembled root; anything else comes from the host.
fn host_program(root: &Path, program: &str) -> PathBuf {
    if program.starts_with('/') {
        let candidate = root.join(inside(program));
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from(program)
}

struct NamespaceEntry {
    flags: CloneFlags,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    root: CString,
    working_directory: CString,
    proc_dir: Option<CString>,
    loopback: bool,
}

impl NamespaceEntry {
    fn new(spec: &JobSpec, root: &Path) -> ExecutorResult<Self> {
        let mut flags = CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS;
        if spec.network != NetworkPolicy::Host {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let cstring = |path: &Path| {
            CString::new(path.as_os_str().as_bytes())
                .map_err(|_| ExecutorError::Spawn(format!("path contains NUL: {}", path.display())))
        };
        let proc_dir = root.join("proc");
        let working_directory = CString::new(spec.working_directory.as_bytes())
            .map_err(|_| ExecutorError::Spawn("working directory contains NUL".into()))?;

        Ok(Self {
            flags,
            uid_map: format!("0 {} 1\n", getuid()).into_bytes(),
            gid_map: format!("0 {} 1\n", getgid()).into_bytes(),
            root: cstring(root)?,
            working_directory,
            proc_dir: if proc_dir.is_dir() {
                Some(cstring(&proc_dir)?)
            } else {
                None
            },
            loopback: spec.network == NetworkPolicy::Loopback,
        })
    }

    /// Runs in the forked child before exec.
    fn enter(&self) -> io::Result<()> {
        unshare(self.flags)?;
        write_proc(c"/proc/self/setgroups", b"deny")?;
        write_proc(c"/proc/self/uid_map", &self.uid_map)?;
        write_proc(c"/proc/self/gid_map", &self.gid_map)?;

        // SAFETY: the process is single threaded between fork and exec.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => relay_exit(child),
            ForkResult::Child => {}
        }

        nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;
        mount(
            Some(self.root.as_c_str()),
            self.root.as_c_str(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;
        if let Some(proc_dir) = &self.proc_dir {
            mount(
                Some("proc"),
                proc_dir.as_c_str(),
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )?;
        }
        chdir(self.root.as_c_str())?;
        // The old root ends up stacked on top of the new one. Detaching it
        // leaves nothing outside the assembled root reachable, even by a
        // nested chroot.
        pivot_root(".", ".")?;
        umount2(".", MntFlags::MNT_DETACH)?;
        chdir("/")?;
        chdir(self.working_directory.as_c_str())?;
        sethostname(HOSTNAME)?;
        if self.loopback {
            loopback_up()?;
        }
        Ok(())
    }
}

fn write_proc(path: &CStr, contents: &[u8]) -> io::Result<()> {
    // SAFETY: plain system calls on a NUL-terminated path.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
        let err = io::Error::last_os_error();
        libc::close(fd);
        if written < 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// The intermediate process: wait for the job's pid 1 and exit the same
/// way it did. Never returns.
fn relay_exit(child: Pid) -> ! {
    close_inherited_descriptors();
    loop {
        match waitpid(child, None) {
            // SAFETY: _exit is always safe to call; nothing needs flushing.
            Ok(WaitStatus::Exited(_, code)) => unsafe { libc::_exit(code) },
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                // SAFETY: resetting to the default disposition.
                unsafe {
                    let _ = signal(sig, SigHandler::SigDfl);
                }
                let _ = raise(sig);
                unsafe { libc::_exit(128 + sig as i32) }
            }
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => unsafe { libc::_exit(127) },
        }
    }
}

/// Close everything but stdio so the parent sees exec succeed as soon as
/// the job's pid 1 execs, and not when this process exits.
fn close_inherited_descriptors() {
    let max = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft.min(65_536) as i32)
        .unwrap_or(1024);
    for fd in 3..max {
        // SAFETY: closing descriptors this process does not otherwise use.
        unsafe {
            libc::close(fd);
        }
    }
}

fn loopback_up() -> io::Result<()> {
    // SAFETY: ioctl on a socket we own with a zero-initialised ifreq.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut req: libc::ifreq = std::mem::zeroed();
        for (dst, src) in req.ifr_name.iter_mut().zip(b"lo\0") {
            *dst = *src as libc::c_char;
        }
        let mut result = libc::ioctl(fd, libc::SIOCGIFFLAGS as _, &mut req as *mut libc::ifreq);
        if result >= 0 {
            req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
            result = libc::ioctl(fd, libc::SIOCSIFFLAGS as _, &req as *const libc::ifreq);
        }
        let err = io::Error::last_os_error();
        libc::close(fd);
        if result < 0 {
            return Err(err);
        }
    }
    Ok(())
}

/// How the job's top process exited and what it used.
#[derive(Debug, Clone, Copy)]
pub struct Reaped {
    pub status: ExitStatus,
    pub user_time: Duration,
    pub system_time: Duration,
    pub max_rss_bytes: u64,
}

impl Reaped {
    pub fn usage(&self, wall_time: Duration) -> ResourceUsage {
        ResourceUsage {
            wall_time,
            user_time: self.user_time,
            system_time: self.system_time,
            max_rss_bytes: self.max_rss_bytes,
        }
    }
}

/// Block until `pid` exits without reaping it. The zombie keeps the pid, and
/// with it the process group id, reserved until [`reap`].
pub fn wait_exited(pid: Pid) -> io::Result<()> {
    loop {
        // SAFETY: siginfo is plain data and only written by waitid.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: the out-pointer is valid for the duration of the call.
        let result = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if result == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Block until `pid` exits, collecting its resource usage.
pub fn reap(pid: Pid) -> io::Result<Reaped> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain data and fully written by wait4 on success.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: both out-pointers are valid for the duration of the call.
        let result = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
        if result >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let status = if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status))
    } else {
        ExitStatus::Exited(-1)
    };
    let timeval = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    Ok(Reaped {
        status,
        user_time: timeval(usage.ru_utime),
        system_time: timeval(usage.ru_stime),
        // Linux reports kilobytes.
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
    })
}

/// What a job whose program cannot be started reports on stderr.
pub fn spawn_failure_message(program: &str, err: &io::Error) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = writeln!(out, "hopper: cannot execute {program}: {err}");
    out
}
