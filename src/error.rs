//! Error types for the playground service.
//!
//! Only caller errors and infrastructure failures are represented here.
//! Compile errors, panics, timeouts and limit violations of the submitted
//! program are ordinary [`ExecutionOutcome`](crate::sandbox::ExecutionOutcome)
//! values and never surface as `Error`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The request was malformed and rejected before any process was spawned.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("A request with id {0:?} is already in flight")]
    DuplicateRequest(String),

    /// Back-pressure: the dispatcher is at capacity.
    #[error("Service busy: {in_flight} requests in flight, {waiting} waiting (waited {} ms)", .waited.as_millis())]
    Busy {
        in_flight: usize,
        waiting: usize,
        waited: Duration,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Toolchain program {program:?} is not available: {source}")]
    ToolchainMissing {
        program: String,
        source: which::Error,
    },

    #[error("Unable to launch {program:?}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("Working area {}: {source}", .path.display())]
    WorkArea { path: PathBuf, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn invalid<MS: Into<String>>(msg: MS) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn config<MS: Into<String>>(msg: MS) -> Self {
        Error::Config(msg.into())
    }

    /// Whether the error was caused by the caller rather than the service.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_) | Error::DuplicateRequest(_) | Error::Busy { .. }
        )
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
