//! Command-line and environment configuration.
//!
//! Every flag has a `PLAYGROUND_*` environment fallback. The HTTP flags keep
//! the `PLAYGROUND_UI_*` names the service has always used.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::dispatcher::{DispatchPolicy, Dispatcher, QueuePolicy};
use crate::error::{Error, Result};
use crate::limits::{Limiter, ResourceBudget, SandboxPolicy};
use crate::sandbox::SandboxRunner;
use crate::toolchain::{
    split_flags, Toolchain, ToolchainConfig, DEFAULT_ASM_TEMPLATE, DEFAULT_BUILD_TEMPLATE,
    DEFAULT_CHANNEL_ENV, DEFAULT_CHECK_TEMPLATE, DEFAULT_ENV_PASSTHROUGH,
    DEFAULT_EXECUTE_TEMPLATE, DEFAULT_FORMAT_TEMPLATE, DEFAULT_INTERPRET_TEMPLATE,
    DEFAULT_LLVM_IR_TEMPLATE, DEFAULT_RELEASE_FLAGS, DEFAULT_TEST_FLAGS,
};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueMode {
    /// Fail immediately when every slot is taken
    Reject,
    /// Queue until a slot frees up or the queue timeout passes
    Wait,
}

/// Settings shared by `serve` and `run`.
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Directory for per-request working areas
    #[arg(long, env = "PLAYGROUND_WORK_ROOT", default_value = "/tmp/playground")]
    pub work_root: PathBuf,

    /// Default wall-clock limit per request in milliseconds
    #[arg(long, env = "PLAYGROUND_TIMEOUT_MS", default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Largest timeout a request may ask for
    #[arg(long, env = "PLAYGROUND_MAX_TIMEOUT_MS", default_value_t = 60_000)]
    pub max_timeout_ms: u64,

    /// Default address-space limit per process in MiB
    #[arg(long, env = "PLAYGROUND_MEMORY_MB", default_value_t = 2048)]
    pub memory_mb: u64,

    /// Largest memory limit a request may ask for
    #[arg(long, env = "PLAYGROUND_MAX_MEMORY_MB", default_value_t = 4096)]
    pub max_memory_mb: u64,

    /// CPU time limit per process in milliseconds [default: the timeout]
    #[arg(long, env = "PLAYGROUND_CPU_TIME_MS")]
    pub cpu_time_ms: Option<u64>,

    /// Bytes kept from each output stream, in KiB
    #[arg(long, env = "PLAYGROUND_MAX_OUTPUT_KB", default_value_t = 128)]
    pub max_output_kb: usize,

    /// Largest accepted source, in KiB
    #[arg(long, env = "PLAYGROUND_MAX_SOURCE_KB", default_value_t = 64)]
    pub max_source_kb: usize,

    /// Maximum number of open files per process
    #[arg(long, env = "PLAYGROUND_OPEN_FILES", default_value_t = 256)]
    pub open_files: u64,

    /// Largest file a process may write, in MiB
    #[arg(long, env = "PLAYGROUND_FILE_SIZE_MB", default_value_t = 64)]
    pub file_size_mb: u64,

    /// Process limit (RLIMIT_NPROC, counted per user)
    #[arg(long, env = "PLAYGROUND_PROCESSES")]
    pub processes: Option<u64>,

    /// Requests run at the same time
    #[arg(long, env = "PLAYGROUND_MAX_CONCURRENT", default_value_t = 10)]
    pub max_concurrent: usize,

    #[arg(long, env = "PLAYGROUND_QUEUE", value_enum, default_value_t = QueueMode::Wait)]
    pub queue: QueueMode,

    /// Requests allowed to wait for a slot
    #[arg(long, env = "PLAYGROUND_QUEUE_DEPTH", default_value_t = 100)]
    pub queue_depth: usize,

    /// How long a queued request waits, in milliseconds
    #[arg(long, env = "PLAYGROUND_QUEUE_TIMEOUT_MS", default_value_t = 30_000)]
    pub queue_timeout_ms: u64,

    /// Compile-check command
    #[arg(long, env = "PLAYGROUND_CHECK_COMMAND", default_value = DEFAULT_CHECK_TEMPLATE)]
    pub check_command: String,

    /// Native build command
    #[arg(long, env = "PLAYGROUND_BUILD_COMMAND", default_value = DEFAULT_BUILD_TEMPLATE)]
    pub build_command: String,

    /// Command emitting assembly to {artifact}
    #[arg(long, env = "PLAYGROUND_ASM_COMMAND", default_value = DEFAULT_ASM_TEMPLATE)]
    pub asm_command: String,

    /// Command emitting LLVM IR to {artifact}
    #[arg(long, env = "PLAYGROUND_LLVM_IR_COMMAND", default_value = DEFAULT_LLVM_IR_TEMPLATE)]
    pub llvm_ir_command: String,

    /// UB-checking interpreter command
    #[arg(long, env = "PLAYGROUND_INTERPRET_COMMAND", default_value = DEFAULT_INTERPRET_TEMPLATE)]
    pub interpret_command: String,

    /// Command that runs a built executable
    #[arg(long, env = "PLAYGROUND_EXECUTE_COMMAND", default_value = DEFAULT_EXECUTE_TEMPLATE)]
    pub execute_command: String,

    /// Formatter command, rewriting {source} in place
    #[arg(long, env = "PLAYGROUND_FORMAT_COMMAND", default_value = DEFAULT_FORMAT_TEMPLATE)]
    pub format_command: String,

    /// Disable format mode
    #[arg(long, env = "PLAYGROUND_NO_FORMAT")]
    pub no_format: bool,

    /// Flags added to check and build commands for release builds
    #[arg(long, env = "PLAYGROUND_RELEASE_FLAGS", default_value = DEFAULT_RELEASE_FLAGS, allow_hyphen_values = true)]
    pub release_flags: String,

    /// Flags added when a request asks for the test harness
    #[arg(long, env = "PLAYGROUND_TEST_FLAGS", default_value = DEFAULT_TEST_FLAGS, allow_hyphen_values = true)]
    pub test_flags: String,

    /// Environment variables passed through to toolchain processes
    #[arg(long, env = "PLAYGROUND_ENV_PASSTHROUGH", value_delimiter = ',', default_value = DEFAULT_ENV_PASSTHROUGH)]
    pub env_passthrough: Vec<String>,

    /// Variable that carries a request's release channel to the toolchain
    #[arg(long, env = "PLAYGROUND_CHANNEL_ENV", default_value = DEFAULT_CHANNEL_ENV)]
    pub channel_env: String,

    /// Run each process tree in an empty network namespace (needs root)
    #[arg(long, env = "PLAYGROUND_UNSHARE_NETWORK")]
    pub unshare_network: bool,

    /// Run toolchain processes as nobody (needs root)
    #[arg(long, env = "PLAYGROUND_RUN_AS_NOBODY")]
    pub run_as_nobody: bool,
}

/// Settings only `serve` needs.
#[derive(Args, Debug, Clone)]
pub struct HttpArgs {
    /// Address to listen on
    #[arg(long, env = "PLAYGROUND_UI_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub address: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PLAYGROUND_UI_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Static UI directory served for unknown paths
    #[arg(long, env = "PLAYGROUND_UI_ROOT")]
    pub root: Option<PathBuf>,
}

impl HttpArgs {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Validated service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub dispatch: DispatchPolicy,
    pub toolchain: ToolchainConfig,
    pub sandbox: SandboxPolicy,
}

impl ServiceConfig {
    /// Resolve the toolchain and build a ready dispatcher.
    pub fn into_dispatcher(self) -> Result<Dispatcher> {
        let toolchain = Arc::new(Toolchain::discover(self.toolchain)?);
        let runner = SandboxRunner::new(toolchain, Limiter::new(self.sandbox));
        Dispatcher::new(self.dispatch, runner)
    }
}

/// `value` MiB in bytes. Overflow is an error, never a saturated limit.
fn mib(flag: &str, value: u64) -> Result<u64> {
    value
        .checked_mul(MIB)
        .ok_or_else(|| Error::config(format!("--{} {} is out of range", flag, value)))
}

fn kib(flag: &str, value: usize) -> Result<usize> {
    value
        .checked_mul(1024)
        .ok_or_else(|| Error::config(format!("--{} {} is out of range", flag, value)))
}

impl TryFrom<ServiceArgs> for ServiceConfig {
    type Error = Error;

    fn try_from(args: ServiceArgs) -> Result<Self> {
        let wall_time = Duration::from_millis(args.timeout_ms);
        let budget = ResourceBudget {
            wall_time,
            cpu_time: args.cpu_time_ms.map_or(wall_time, Duration::from_millis),
            memory_bytes: mib("memory-mb", args.memory_mb)?,
            output_bytes: kib("max-output-kb", args.max_output_kb)?,
            open_files: args.open_files,
            file_size_bytes: mib("file-size-mb", args.file_size_mb)?,
            processes: args.processes,
        };
        let queue = match args.queue {
            QueueMode::Reject => QueuePolicy::Reject,
            QueueMode::Wait => QueuePolicy::Wait {
                depth: args.queue_depth,
                timeout: Duration::from_millis(args.queue_timeout_ms),
            },
        };
        let dispatch = DispatchPolicy {
            work_root: args.work_root,
            max_concurrent: args.max_concurrent,
            queue,
            budget,
            max_timeout: Duration::from_millis(args.max_timeout_ms),
            max_memory_bytes: mib("max-memory-mb", args.max_memory_mb)?,
            max_source_bytes: kib("max-source-kb", args.max_source_kb)?,
        };
        dispatch.validate()?;

        let toolchain = ToolchainConfig {
            check: args.check_command.parse()?,
            build: args.build_command.parse()?,
            asm: args.asm_command.parse()?,
            llvm_ir: args.llvm_ir_command.parse()?,
            interpret: args.interpret_command.parse()?,
            execute: args.execute_command.parse()?,
            format: if args.no_format {
                None
            } else {
                Some(args.format_command.parse()?)
            },
            release_flags: split_flags(&args.release_flags),
            test_flags: split_flags(&args.test_flags),
            env_passthrough: args
                .env_passthrough
                .into_iter()
                .map(|key| key.trim().to_owned())
                .filter(|key| !key.is_empty())
                .collect(),
            channel_env: args.channel_env.trim().to_owned(),
        };
        if toolchain.channel_env.is_empty() {
            return Err(Error::config("channel variable name is empty"));
        }

        if (args.unshare_network || args.run_as_nobody) && !nix::unistd::geteuid().is_root() {
            return Err(Error::config(
                "--unshare-network and --run-as-nobody need root privileges",
            ));
        }

        Ok(ServiceConfig {
            dispatch,
            toolchain,
            sandbox: SandboxPolicy {
                unshare_network: args.unshare_network,
                run_as_nobody: args.run_as_nobody,
            },
        })
    }
}
