//! Playground - sandboxed execution of untrusted Rust snippets.
//!
//! A request flows through the [`Dispatcher`], which admits it and gives it
//! a [`WorkingArea`]; the [`SandboxRunner`] builds and interprets it through
//! the [`Limiter`]; the outcome is rendered into an [`ExecutionReport`].

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux.");

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http_server;
pub mod limits;
pub mod report;
pub mod request;
pub mod sandbox;
pub mod state;
pub mod toolchain;
pub mod workarea;

pub use dispatcher::{DispatchPolicy, Dispatcher, DispatcherStatus, QueuePolicy};
pub use error::{Error, Result};
pub use limits::{Bound, Limiter, ResourceBudget, SandboxPolicy};
pub use report::ExecutionReport;
pub use request::{
    BuildProfile, Channel, CompileTarget, ExecutionMode, ExecutionRequest, LimitOverrides,
};
pub use sandbox::{Execution, ExecutionOutcome, OutcomeTag, SandboxRunner, Stage};
pub use toolchain::{Toolchain, ToolchainConfig};
pub use workarea::WorkingArea;
