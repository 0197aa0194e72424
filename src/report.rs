//! Caller-facing rendering of finished executions.

use std::fmt::Write;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::limits::Bound;
use crate::request::ExecutionMode;
use crate::sandbox::{Execution, ExecutionOutcome, OutcomeTag, Stage};

/// Serialisable summary of one [`Execution`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: String,
    pub mode: ExecutionMode,
    pub status: OutcomeTag,
    pub stage: Option<Stage>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub bound: Option<Bound>,
    /// Assembly or LLVM IR from a build with a compile target.
    pub code: Option<String>,
    pub code_truncated: bool,
    pub elapsed_ms: u64,
    pub diagnostic: Option<String>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.status == OutcomeTag::Success
    }
}

pub fn render(execution: &Execution) -> ExecutionReport {
    let output = execution.outcome.output();
    let bound = match &execution.outcome {
        ExecutionOutcome::ResourceExceeded { bound, .. } => Some(*bound),
        _ => None,
    };

    ExecutionReport {
        id: execution.id.clone(),
        mode: execution.mode,
        status: execution.outcome.tag(),
        stage: execution.outcome.stage(),
        stdout: output.map(|o| o.stdout.text()).unwrap_or_default(),
        stdout_truncated: output.map_or(false, |o| o.stdout.is_truncated()),
        stderr: output.map(|o| o.stderr.text()).unwrap_or_default(),
        stderr_truncated: output.map_or(false, |o| o.stderr.is_truncated()),
        exit_code: output.and_then(|o| o.exit_code),
        signal: output.and_then(|o| o.signal),
        bound,
        code: output.and_then(|o| o.artifact.as_ref()).map(|a| a.text()),
        code_truncated: output
            .and_then(|o| o.artifact.as_ref())
            .map_or(false, |a| a.is_truncated()),
        elapsed_ms: execution.elapsed.as_millis() as u64,
        diagnostic: diagnostic(&execution.outcome),
    }
}

fn diagnostic(outcome: &ExecutionOutcome) -> Option<String> {
    let text = match outcome {
        ExecutionOutcome::Success(_) => return None,
        ExecutionOutcome::CompileError(o) if o.stage == Stage::Format => {
            "Formatting failed".to_string()
        }
        ExecutionOutcome::CompileError(_) => "Compilation failed".to_string(),
        ExecutionOutcome::RuntimeFailure(o) => match (o.exit_code, o.signal) {
            (_, Some(signal)) => format!("Process was killed by signal {}", signal_name(signal)),
            (Some(code), None) => format!("Process exited with status {}", code),
            (None, None) => "Process failed".to_string(),
        },
        ExecutionOutcome::TimedOut(o) => {
            format!("Execution exceeded its wall-clock limit during the {} stage", o.stage)
        }
        ExecutionOutcome::ResourceExceeded { bound, output } => {
            format!("Execution exceeded its {} limit during the {} stage", bound, output.stage)
        }
        ExecutionOutcome::Cancelled(_) => "Execution was cancelled".to_string(),
        ExecutionOutcome::InternalError { cause, .. } => format!("Internal error: {}", cause),
    };
    Some(text)
}

fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => format!("{} ({})", signal, sig.as_str()),
        Err(_) => signal.to_string(),
    }
}

/// Terminal rendering for interactive use.
pub fn render_human(report: &ExecutionReport) -> String {
    let mut out = String::new();
    let _ = write!(out, "{} [{}] {}", report.id, report.mode, report.status);
    if let Some(stage) = report.stage {
        let _ = write!(out, " in {} stage", stage);
    }
    let _ = writeln!(out, " ({} ms)", report.elapsed_ms);
    if let Some(diagnostic) = &report.diagnostic {
        let _ = writeln!(out, "{}", diagnostic);
    }

    for (name, text, truncated) in [
        ("code", report.code.as_deref().unwrap_or(""), report.code_truncated),
        ("stdout", report.stdout.as_str(), report.stdout_truncated),
        ("stderr", report.stderr.as_str(), report.stderr_truncated),
    ] {
        if text.is_empty() {
            continue;
        }
        let _ = writeln!(out, "--- {} ---", name);
        out.push_str(text);
        if !text.ends_with('\n') {
            out.push('\n');
        }
        if truncated {
            let _ = writeln!(out, "[{} truncated]", name);
        }
    }
    out
}
