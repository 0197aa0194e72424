//! Resource limiter.
//!
//! Launches exactly one process tree per call and holds it to a
//! [`ResourceBudget`]:
//!
//! - **kernel limits** - `RLIMIT_AS`, `RLIMIT_CPU`, `RLIMIT_NOFILE`,
//!   `RLIMIT_FSIZE`, `RLIMIT_CORE` and optionally `RLIMIT_NPROC`, applied in
//!   the child between fork and exec
//! - **wall clock** - a deadline timer racing the child's exit
//! - **cancellation** - a token racing both of the above
//!
//! The child calls `setsid()` before exec so its pid is the process group id
//! of everything it spawns. The group is SIGKILLed on every way out of
//! [`Limiter::run`], including the future being dropped, so no process of a
//! call outlives the call.
//!
//! Output is drained continuously. Only the first `output_bytes` bytes of
//! each stream are retained; the rest is read and discarded so the child
//! never blocks on a full pipe.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setgid, setsid, setuid, Gid, Pid, Uid};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const NOBODY_UID: u32 = 65534;
const NOBODY_GID: u32 = 65534;

const READ_CHUNK: usize = 8192;

/// How long to wait for a SIGKILLed child to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// Bounds applied to one process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    /// Wall-clock time before the tree is killed.
    pub wall_time: Duration,
    /// CPU time per process (`RLIMIT_CPU`, rounded up to whole seconds).
    pub cpu_time: Duration,
    /// Address space per process (`RLIMIT_AS`).
    pub memory_bytes: u64,
    /// Bytes retained from each of stdout and stderr.
    pub output_bytes: usize,
    pub open_files: u64,
    /// Largest file the tree may write (`RLIMIT_FSIZE`).
    pub file_size_bytes: u64,
    /// `RLIMIT_NPROC`. Counted per real uid, so off by default.
    pub processes: Option<u64>,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            wall_time: Duration::from_secs(10),
            cpu_time: Duration::from_secs(10),
            memory_bytes: 2048 * 1024 * 1024,
            output_bytes: 128 * 1024,
            open_files: 256,
            file_size_bytes: 64 * 1024 * 1024,
            processes: None,
        }
    }
}

impl ResourceBudget {
    /// Every bound must be finite and positive.
    pub fn validate(&self) -> Result<()> {
        // RLIM_INFINITY is all ones; a bound that large lifts the limit.
        let unbounded = [
            ("memory", self.memory_bytes == u64::MAX),
            ("open files", self.open_files == u64::MAX),
            ("file size", self.file_size_bytes == u64::MAX),
            ("processes", self.processes == Some(u64::MAX)),
        ];
        if let Some((name, _)) = unbounded.iter().find(|(_, infinite)| *infinite) {
            return Err(Error::config(format!("{} limit must be finite", name)));
        }
        let zero = [
            ("wall time", self.wall_time.is_zero()),
            ("cpu time", self.cpu_time.is_zero()),
            ("memory", self.memory_bytes == 0),
            ("output size", self.output_bytes == 0),
            ("open files", self.open_files == 0),
            ("file size", self.file_size_bytes == 0),
            ("processes", self.processes == Some(0)),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(Error::config(format!("{} limit must be positive", name))),
            None => Ok(()),
        }
    }

    pub fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time = wall_time;
        self
    }

    fn cpu_seconds(&self) -> u64 {
        let secs = self.cpu_time.as_secs() + u64::from(self.cpu_time.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// A budget bound a process tree ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    CpuTime,
    Memory,
    FileSize,
    Processes,
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::CpuTime => f.write_str("CPU time"),
            Bound::Memory => f.write_str("memory"),
            Bound::FileSize => f.write_str("file size"),
            Bound::Processes => f.write_str("process count"),
        }
    }
}

/// Isolation applied on top of the rlimits. Both switches need root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Give each tree an empty network namespace.
    pub unshare_network: bool,
    /// Switch to nobody:nogroup before exec.
    pub run_as_nobody: bool,
}

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Invocation {
            program: program.into(),
            args: vec![],
            cwd: PathBuf::from("/"),
            env: vec![],
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, cwd: P) -> Self {
        self.cwd = cwd.as_ref().to_path_buf();
        self
    }

    pub fn env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments joined for logging.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Retained prefix of one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    bytes: Vec<u8>,
    total: u64,
    limit: usize,
}

impl Capture {
    pub fn new(limit: usize) -> Self {
        Capture {
            bytes: Vec::with_capacity(limit.min(READ_CHUNK)),
            total: 0,
            limit,
        }
    }

    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B, limit: usize) -> Self {
        let bytes: Vec<u8> = bytes.into();
        let mut capture = Capture::new(limit);
        capture.push(&bytes);
        capture
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Read until EOF, keeping at most `limit` bytes.
    pub async fn drain<R: AsyncRead + Unpin>(&mut self, reader: Option<R>) -> io::Result<()> {
        let Some(mut reader) = reader else {
            return Ok(());
        };
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.push(&buf[..n]);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Retained bytes as text, invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// How a limited process tree ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    Cancelled,
}

/// Everything observed about one limiter call.
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub pid: u32,
    pub termination: Termination,
    pub stdout: Capture,
    pub stderr: Capture,
    pub elapsed: Duration,
}

impl RawOutcome {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    /// The kernel limit behind a signal death, if any.
    pub fn violated_bound(&self) -> Option<Bound> {
        match self.termination {
            Termination::Signaled(sig) if sig == Signal::SIGXCPU as i32 => Some(Bound::CpuTime),
            Termination::Signaled(sig) if sig == Signal::SIGXFSZ as i32 => Some(Bound::FileSize),
            _ => None,
        }
    }
}

/// Kills the whole group when dropped, unless it was already killed.
struct ProcessGroup {
    pgid: Pid,
    armed: bool,
}

impl ProcessGroup {
    fn new(pid: u32) -> Self {
        ProcessGroup {
            pgid: Pid::from_raw(pid as i32),
            armed: true,
        }
    }

    /// SIGKILL the group once. The leader may be reaped right after, which
    /// frees its id for reuse, so the guard is disarmed here.
    fn kill(&mut self) {
        self.armed = false;
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) => debug!(pgid = %self.pgid, "Killed process group"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = %self.pgid, error = %e, "Unable to kill process group"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
        }
    }
}

/// Limits copied into the pre-exec hook. Plain data only: the hook runs
/// between fork and exec and must not allocate.
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    memory: u64,
    cpu_soft: u64,
    cpu_hard: u64,
    open_files: u64,
    file_size: u64,
    processes: Option<u64>,
    policy: SandboxPolicy,
}

impl ChildLimits {
    fn new(budget: &ResourceBudget, policy: SandboxPolicy) -> Self {
        let cpu = budget.cpu_seconds();
        ChildLimits {
            memory: budget.memory_bytes,
            cpu_soft: cpu,
            cpu_hard: cpu + 1,
            open_files: budget.open_files,
            file_size: budget.file_size_bytes,
            processes: budget.processes,
            policy,
        }
    }

    fn apply(&self) -> io::Result<()> {
        setsid()?;

        setrlimit(Resource::RLIMIT_AS, self.memory, self.memory)?;
        setrlimit(Resource::RLIMIT_CPU, self.cpu_soft, self.cpu_hard)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(processes) = self.processes {
            setrlimit(Resource::RLIMIT_NPROC, processes, processes)?;
        }

        if self.policy.unshare_network {
            unshare(CloneFlags::CLONE_NEWNET)?;
        }
        if self.policy.run_as_nobody {
            setgid(Gid::from_raw(NOBODY_GID))?;
            setuid(Uid::from_raw(NOBODY_UID))?;
        }

        // Credential changes clear the parent-death signal, so this goes last.
        // SAFETY: PR_SET_PDEATHSIG only reads the signal number argument.
        if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

enum Race {
    Completed(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawns process trees under a [`SandboxPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Limiter {
    policy: SandboxPolicy,
}

impl Limiter {
    pub fn new(policy: SandboxPolicy) -> Self {
        Limiter { policy }
    }

    pub fn policy(&self) -> SandboxPolicy {
        self.policy
    }

    /// Run `invocation` to completion, deadline or cancellation.
    ///
    /// Fails only if the process cannot be launched or its pipes break.
    pub async fn run(
        &self,
        invocation: &Invocation,
        budget: &ResourceBudget,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome> {
        debug!(command = %invocation.command_line(), cwd = ?invocation.cwd, "Spawning");
        debug!(
            wall_ms = budget.wall_time.as_millis() as u64,
            cpu_s = budget.cpu_seconds(),
            mem_bytes = budget.memory_bytes,
            output_bytes = budget.output_bytes,
            "Limits"
        );

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .env_clear()
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limits = ChildLimits::new(budget, self.policy);
        // SAFETY: the hook only issues syscalls on copied plain data.
        unsafe {
            command.pre_exec(move || limits.apply());
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: invocation.program.display().to_string(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "child was reaped before it could be tracked",
            ))
        })?;
        let mut group = ProcessGroup::new(pid);
        debug!(pid, "Child spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut out = Capture::new(budget.output_bytes);
        let mut err = Capture::new(budget.output_bytes);

        let race = {
            let completed = async {
                let (status, out_res, err_res) = tokio::join!(
                    async {
                        let status = child.wait().await;
                        // Stragglers would hold the pipes open.
                        group.kill();
                        status
                    },
                    out.drain(stdout),
                    err.drain(stderr),
                );
                out_res?;
                err_res?;
                status
            };

            tokio::select! {
                biased;
                result = completed => Race::Completed(result),
                _ = cancel.cancelled() => Race::Cancelled,
                _ = tokio::time::sleep(budget.wall_time) => Race::TimedOut,
            }
        };

        let termination = match race {
            Race::Completed(Ok(status)) => termination_of(status),
            Race::Completed(Err(e)) => {
                group.kill();
                reap(&mut child, pid).await;
                return Err(Error::Io(e));
            }
            Race::TimedOut => {
                group.kill();
                reap(&mut child, pid).await;
                Termination::TimedOut
            }
            Race::Cancelled => {
                group.kill();
                reap(&mut child, pid).await;
                Termination::Cancelled
            }
        };
        drop(group);

        let elapsed = start.elapsed();
        info!(
            pid,
            termination = ?termination,
            elapsed_ms = elapsed.as_millis() as u64,
            stdout_len = out.total_bytes(),
            stderr_len = err.total_bytes(),
            "Process tree finished"
        );

        Ok(RawOutcome {
            pid,
            termination,
            stdout: out,
            stderr: err,
            elapsed,
        })
    }
}

fn termination_of(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(signal)) => Termination::Signaled(signal),
        (None, None) => Termination::Exited(status.into_raw()),
    }
}

async fn reap(child: &mut Child, pid: u32) {
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(pid, error = %e, "Unable to reap killed child"),
        Err(_) => warn!(pid, "Killed child was not reaped in time"),
    }
}
