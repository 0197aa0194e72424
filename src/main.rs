//! Playground - sandboxed Rust snippet execution with an HTTP API.
//!
//! Usage:
//!   playground serve [--port 5000]             # Start HTTP server
//!   playground run [FILE|-] [--mode miri]      # Run one snippet, print the report

use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use playground::config::{HttpArgs, ServiceArgs, ServiceConfig};
use playground::http_server;
use playground::state::AppState;
use playground::{report, BuildProfile, Channel, CompileTarget, Error, ExecutionMode, ExecutionRequest};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "playground=info,tower_http=info";

/// `run` exit code for requests the service refused.
const EXIT_REJECTED: u8 = 2;
/// Exit code for infrastructure failures.
const EXIT_FAILURE: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "playground")]
#[command(about = "Sandboxed Rust snippet execution with HTTP API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[command(flatten)]
        service: ServiceArgs,
        #[command(flatten)]
        http: HttpArgs,
    },
    /// Run one snippet and print its report
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Source file, or `-` for stdin
    #[arg(default_value = "-")]
    file: PathBuf,

    #[arg(long, value_enum, default_value_t = ExecutionMode::Miri)]
    mode: ExecutionMode,

    #[arg(long, value_enum, default_value_t = BuildProfile::Debug)]
    profile: BuildProfile,

    /// Build with the test harness
    #[arg(long)]
    tests: bool,

    /// Emit assembly or LLVM IR instead of an executable (build mode)
    #[arg(long, value_enum)]
    target: Option<CompileTarget>,

    /// Release channel selected through the toolchain variable
    #[arg(long, value_enum)]
    channel: Option<Channel>,

    /// Correlation id for logs and the report
    #[arg(long)]
    id: Option<String>,

    /// Wall-clock limit override in milliseconds
    #[arg(long = "request-timeout-ms")]
    request_timeout_ms: Option<u64>,

    /// Memory limit override in MiB
    #[arg(long = "request-memory-mb")]
    request_memory_mb: Option<u64>,

    /// Print JSON even on a terminal
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    service: ServiceArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { service, http } => match serve(service, http).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => fail(&e),
        },
        Commands::Run(args) => run(args).await,
    }
}

async fn serve(service: ServiceArgs, http: HttpArgs) -> Result<(), Error> {
    let dispatcher = ServiceConfig::try_from(service)?.into_dispatcher()?;
    dispatcher.runner().toolchain().probe().await;

    let state = AppState::new(dispatcher);
    let app = http_server::router(state.clone(), http.root.as_deref());
    let listener = TcpListener::bind(http.socket_addr()).await?;

    let dispatcher = state.dispatcher.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
        dispatcher.cancel_all().await;
    };
    http_server::run_server(listener, app, shutdown).await?;
    Ok(())
}

async fn run(args: RunArgs) -> ExitCode {
    let source = match read_source(&args.file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}: {}", args.file.display(), e);
            return ExitCode::from(EXIT_REJECTED);
        }
    };

    let dispatcher = match ServiceConfig::try_from(args.service).and_then(|c| c.into_dispatcher()) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => return fail(&e),
    };
    let on_interrupt = dispatcher.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel_all().await;
        }
    });

    let mut request = ExecutionRequest::new(source)
        .set_id(args.id)
        .mode(args.mode)
        .profile(args.profile)
        .tests(args.tests)
        .target(args.target)
        .channel(args.channel);
    if let Some(ms) = args.request_timeout_ms {
        request = request.timeout(Duration::from_millis(ms));
    }
    if let Some(mb) = args.request_memory_mb {
        match mb.checked_mul(1024 * 1024) {
            Some(bytes) => request = request.memory_limit(bytes),
            None => {
                return fail(&Error::invalid(format!(
                    "--request-memory-mb {} is out of range",
                    mb
                )))
            }
        }
    }

    let execution = match dispatcher.submit(request).await {
        Ok(execution) => execution,
        Err(e) => return fail(&e),
    };
    let report = report::render(&execution);

    if args.json || !io::stdout().is_terminal() {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    } else {
        print!("{}", report::render_human(&report));
    }
    ExitCode::SUCCESS
}

fn read_source(file: &Path) -> io::Result<String> {
    if file.as_os_str() == "-" {
        let mut source = String::new();
        io::stdin().read_to_string(&mut source)?;
        Ok(source)
    } else {
        fs::read_to_string(file)
    }
}

fn fail(e: &Error) -> ExitCode {
    eprintln!("Error: {}", e);
    if e.is_caller_error() {
        ExitCode::from(EXIT_REJECTED)
    } else {
        error!(error = %e, "Fatal");
        ExitCode::from(EXIT_FAILURE)
    }
}
