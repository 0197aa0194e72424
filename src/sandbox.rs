//! Sandbox runner.
//!
//! Drives one request through its stages and classifies what happened into
//! exactly one [`ExecutionOutcome`]:
//!
//! ```text
//! Created -> Building -> Interpreting -> Done
//!                     -> CompileFailed -> Done
//!                     -> Done                      (build and format modes)
//! any non-terminal    -> TimedOut | ResourceExceeded | Cancelled -> Done
//! ```
//!
//! Each stage is one [`Limiter`] call. The interpreting stage only gets the
//! wall-clock budget the building stage left over. Nothing is retried.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::limits::{Bound, Capture, Limiter, RawOutcome, ResourceBudget, Termination};
use crate::request::{CompileTarget, ExecutionMode, ExecutionRequest};
use crate::toolchain::{Step, Toolchain};
use crate::workarea::WorkingArea;

/// Miri's report for an allocation beyond the address-space limit.
const MIRI_EXHAUSTION: &str = "error: resource exhaustion:";

/// Panic payload of `std::thread::spawn` failing with EAGAIN.
const SPAWN_FAILURE: &str = "failed to spawn thread";
const EAGAIN_CODE: &str = "code: 11";

/// Runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Building,
    CompileFailed,
    Interpreting,
    TimedOut,
    ResourceExceeded,
    Cancelled,
    Done,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self == Phase::Done
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Done, _) => false,
            (_, TimedOut | ResourceExceeded | Cancelled) => {
                !matches!(self, TimedOut | ResourceExceeded | Cancelled)
            }
            (Created, Building) => true,
            (Building, Interpreting | CompileFailed | Done) => true,
            (Interpreting | CompileFailed | TimedOut | ResourceExceeded | Cancelled, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Lifecycle<'a> {
    id: &'a str,
    phase: Phase,
}

impl<'a> Lifecycle<'a> {
    fn new(id: &'a str) -> Self {
        Lifecycle {
            id,
            phase: Phase::Created,
        }
    }

    fn advance(&mut self, next: Phase) -> Result<(), String> {
        if !self.phase.can_advance_to(next) {
            return Err(format!("illegal transition {:?} -> {:?}", self.phase, next));
        }
        debug!(id = %self.id, from = ?self.phase, to = ?next, "Phase");
        self.phase = next;
        Ok(())
    }
}

/// Which process an outcome's output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Interpret,
    Format,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Interpret => "interpret",
            Stage::Format => "format",
        };
        f.write_str(name)
    }
}

/// Captured output of the stage an outcome ended in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stage: Stage,
    pub stdout: Capture,
    pub stderr: Capture,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Code emitted for a compile target.
    pub artifact: Option<Capture>,
}

impl ProcessOutput {
    fn from_raw(stage: Stage, raw: RawOutcome) -> Self {
        let (exit_code, signal) = match raw.termination {
            Termination::Exited(code) => (Some(code), None),
            Termination::Signaled(signal) => (None, Some(signal)),
            Termination::TimedOut | Termination::Cancelled => (None, None),
        };
        ProcessOutput {
            stage,
            stdout: raw.stdout,
            stderr: raw.stderr,
            exit_code,
            signal,
            artifact: None,
        }
    }

    /// Output of a stage that never spawned a process.
    fn empty(stage: Stage, limit: usize) -> Self {
        ProcessOutput {
            stage,
            stdout: Capture::new(limit),
            stderr: Capture::new(limit),
            exit_code: None,
            signal: None,
            artifact: None,
        }
    }
}

/// The single result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success(ProcessOutput),
    CompileError(ProcessOutput),
    RuntimeFailure(ProcessOutput),
    TimedOut(ProcessOutput),
    ResourceExceeded { bound: Bound, output: ProcessOutput },
    Cancelled(ProcessOutput),
    /// The service failed, not the snippet.
    InternalError { stage: Option<Stage>, cause: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Success,
    CompileError,
    RuntimeFailure,
    TimedOut,
    ResourceExceeded,
    Cancelled,
    InternalError,
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeTag::Success => "success",
            OutcomeTag::CompileError => "compile_error",
            OutcomeTag::RuntimeFailure => "runtime_failure",
            OutcomeTag::TimedOut => "timed_out",
            OutcomeTag::ResourceExceeded => "resource_exceeded",
            OutcomeTag::Cancelled => "cancelled",
            OutcomeTag::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

impl ExecutionOutcome {
    pub fn tag(&self) -> OutcomeTag {
        match self {
            ExecutionOutcome::Success(_) => OutcomeTag::Success,
            ExecutionOutcome::CompileError(_) => OutcomeTag::CompileError,
            ExecutionOutcome::RuntimeFailure(_) => OutcomeTag::RuntimeFailure,
            ExecutionOutcome::TimedOut(_) => OutcomeTag::TimedOut,
            ExecutionOutcome::ResourceExceeded { .. } => OutcomeTag::ResourceExceeded,
            ExecutionOutcome::Cancelled(_) => OutcomeTag::Cancelled,
            ExecutionOutcome::InternalError { .. } => OutcomeTag::InternalError,
        }
    }

    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            ExecutionOutcome::Success(output)
            | ExecutionOutcome::CompileError(output)
            | ExecutionOutcome::RuntimeFailure(output)
            | ExecutionOutcome::TimedOut(output)
            | ExecutionOutcome::ResourceExceeded { output, .. }
            | ExecutionOutcome::Cancelled(output) => Some(output),
            ExecutionOutcome::InternalError { .. } => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            ExecutionOutcome::InternalError { stage, .. } => *stage,
            other => other.output().map(|output| output.stage),
        }
    }

    pub fn internal<S: Into<String>>(stage: Option<Stage>, cause: S) -> Self {
        ExecutionOutcome::InternalError {
            stage,
            cause: cause.into(),
        }
    }

    /// Intermediate phase this outcome passes through before `Done`.
    fn phase(&self) -> Option<Phase> {
        match self {
            ExecutionOutcome::CompileError(_) => Some(Phase::CompileFailed),
            ExecutionOutcome::TimedOut(_) => Some(Phase::TimedOut),
            ExecutionOutcome::ResourceExceeded { .. } => Some(Phase::ResourceExceeded),
            ExecutionOutcome::Cancelled(_) => Some(Phase::Cancelled),
            _ => None,
        }
    }
}

/// A finished request.
#[derive(Debug, Clone)]
pub struct Execution {
    pub id: String,
    pub mode: ExecutionMode,
    pub outcome: ExecutionOutcome,
    pub elapsed: Duration,
}

/// Turns a request into an outcome. Shared by every in-flight request.
#[derive(Debug)]
pub struct SandboxRunner {
    toolchain: Arc<Toolchain>,
    limiter: Limiter,
}

impl SandboxRunner {
    pub fn new(toolchain: Arc<Toolchain>, limiter: Limiter) -> Self {
        SandboxRunner { toolchain, limiter }
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Run every stage `request` needs inside `area`.
    ///
    /// Infallible: infrastructure failures come back as
    /// [`ExecutionOutcome::InternalError`].
    pub async fn run(
        &self,
        id: &str,
        request: &ExecutionRequest,
        area: &WorkingArea,
        budget: &ResourceBudget,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let mut lifecycle = Lifecycle::new(id);
        let outcome = self.drive(&mut lifecycle, request, area, budget, cancel).await;

        let outcome = match outcome.phase().map(|phase| lifecycle.advance(phase)) {
            Some(Err(cause)) => self.fail(id, outcome.stage(), cause),
            _ => outcome,
        };
        match lifecycle.advance(Phase::Done) {
            Ok(()) => outcome,
            Err(cause) => self.fail(id, outcome.stage(), cause),
        }
    }

    async fn drive(
        &self,
        lifecycle: &mut Lifecycle<'_>,
        request: &ExecutionRequest,
        area: &WorkingArea,
        budget: &ResourceBudget,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let id = lifecycle.id;
        let started = Instant::now();
        let mode = request.execution_mode();
        let (step, stage) = match mode {
            ExecutionMode::Miri => (Step::Check, Stage::Build),
            ExecutionMode::Run => (Step::Build, Stage::Build),
            ExecutionMode::Build => match request.compile_target() {
                Some(CompileTarget::Asm) => (Step::Asm, Stage::Build),
                Some(CompileTarget::LlvmIr) => (Step::LlvmIr, Stage::Build),
                None => (Step::Build, Stage::Build),
            },
            ExecutionMode::Format => (Step::Format, Stage::Format),
        };

        if let Err(cause) = lifecycle.advance(Phase::Building) {
            return self.fail(id, Some(stage), cause);
        }
        if cancel.is_cancelled() {
            return ExecutionOutcome::Cancelled(ProcessOutput::empty(stage, budget.output_bytes));
        }
        if let Err(e) = self.prepare(request, area) {
            return self.fail(id, Some(stage), e.to_string());
        }

        info!(id = %id, mode = %mode, step = %step, "Building");
        let raw = match self.stage(step, request, area, budget, cancel).await {
            Ok(raw) => raw,
            Err(e) => return self.fail(id, Some(stage), e.to_string()),
        };
        if let Some(outcome) = interrupted(step, stage, &raw, budget) {
            return outcome;
        }

        if step == Step::Format {
            return self.formatted(id, area, raw, budget);
        }

        let artifact = area.file(step.artifact_name());
        let produced = artifact.exists();
        match (raw.termination, produced) {
            (Termination::Exited(0), true) => {}
            (Termination::Exited(0), false) => {
                return self.fail(
                    id,
                    Some(stage),
                    format!("compiler exited successfully without writing {}", artifact.display()),
                );
            }
            (Termination::Exited(_), false) => {
                return ExecutionOutcome::CompileError(ProcessOutput::from_raw(stage, raw));
            }
            (Termination::Exited(code), true) => {
                return self.fail(
                    id,
                    Some(stage),
                    format!("compiler exited with status {} but wrote {}", code, artifact.display()),
                );
            }
            (termination, _) => {
                return self.fail(id, Some(stage), format!("compiler ended abnormally: {:?}", termination));
            }
        }

        if !mode.interprets() {
            let mut output = ProcessOutput::from_raw(stage, raw);
            if matches!(step, Step::Asm | Step::LlvmIr) {
                match area.read_file(step.artifact_name()) {
                    Ok(code) => output.artifact = Some(Capture::from_bytes(code, budget.output_bytes)),
                    Err(e) => return self.fail(id, Some(stage), e.to_string()),
                }
            }
            return ExecutionOutcome::Success(output);
        }

        if let Err(cause) = lifecycle.advance(Phase::Interpreting) {
            return self.fail(id, Some(Stage::Interpret), cause);
        }
        let remaining = budget.wall_time.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            info!(id = %id, "No wall-clock budget left to interpret");
            return ExecutionOutcome::TimedOut(ProcessOutput::empty(
                Stage::Interpret,
                budget.output_bytes,
            ));
        }
        let budget = budget.with_wall_time(remaining);

        let step = match mode {
            ExecutionMode::Miri => Step::Interpret,
            _ => Step::Execute,
        };
        info!(id = %id, step = %step, remaining_ms = remaining.as_millis() as u64, "Interpreting");
        let raw = match self.stage(step, request, area, &budget, cancel).await {
            Ok(raw) => raw,
            Err(e) => return self.fail(id, Some(Stage::Interpret), e.to_string()),
        };
        if let Some(outcome) = interrupted(step, Stage::Interpret, &raw, &budget) {
            return outcome;
        }
        if raw.success() {
            ExecutionOutcome::Success(ProcessOutput::from_raw(Stage::Interpret, raw))
        } else {
            ExecutionOutcome::RuntimeFailure(ProcessOutput::from_raw(Stage::Interpret, raw))
        }
    }

    fn prepare(&self, request: &ExecutionRequest, area: &WorkingArea) -> Result<()> {
        area.write_source(request.source())?;
        if self.limiter.policy().run_as_nobody {
            area.share_with_sandbox_user()?;
        }
        Ok(())
    }

    async fn stage(
        &self,
        step: Step,
        request: &ExecutionRequest,
        area: &WorkingArea,
        budget: &ResourceBudget,
        cancel: &CancellationToken,
    ) -> Result<RawOutcome> {
        let invocation = self.toolchain.invocation(step, area, request)?;
        self.limiter.run(&invocation, budget, cancel).await
    }

    /// The formatter rewrites the source in place; its result is the file.
    fn formatted(
        &self,
        id: &str,
        area: &WorkingArea,
        raw: RawOutcome,
        budget: &ResourceBudget,
    ) -> ExecutionOutcome {
        match raw.termination {
            Termination::Exited(0) => match area.read_source() {
                Ok(source) => {
                    let mut output = ProcessOutput::from_raw(Stage::Format, raw);
                    output.stdout = Capture::from_bytes(source, budget.output_bytes);
                    ExecutionOutcome::Success(output)
                }
                Err(e) => self.fail(id, Some(Stage::Format), e.to_string()),
            },
            Termination::Exited(_) => {
                ExecutionOutcome::CompileError(ProcessOutput::from_raw(Stage::Format, raw))
            }
            termination => self.fail(
                id,
                Some(Stage::Format),
                format!("formatter ended abnormally: {:?}", termination),
            ),
        }
    }

    fn fail(&self, id: &str, stage: Option<Stage>, cause: String) -> ExecutionOutcome {
        error!(id = %id, stage = ?stage, cause = %cause, "Internal error");
        ExecutionOutcome::internal(stage, cause)
    }
}

/// Outcomes that end a request regardless of the stage it was in.
fn interrupted(
    step: Step,
    stage: Stage,
    raw: &RawOutcome,
    budget: &ResourceBudget,
) -> Option<ExecutionOutcome> {
    match raw.termination {
        Termination::TimedOut => {
            return Some(ExecutionOutcome::TimedOut(ProcessOutput::from_raw(stage, raw.clone())))
        }
        Termination::Cancelled => {
            return Some(ExecutionOutcome::Cancelled(ProcessOutput::from_raw(stage, raw.clone())))
        }
        Termination::Exited(0) => return None,
        _ => {}
    }
    let bound = raw
        .violated_bound()
        .or_else(|| exhausted_bound(step, raw, budget.processes.is_some()))?;
    Some(ExecutionOutcome::ResourceExceeded {
        bound,
        output: ProcessOutput::from_raw(stage, raw.clone()),
    })
}

/// Bound a failing program ran into, judged from what the runtime itself
/// reports. Compilers and the formatter quote source lines in their
/// diagnostics, so their stderr is never consulted.
fn exhausted_bound(step: Step, raw: &RawOutcome, processes_limited: bool) -> Option<Bound> {
    if !matches!(step, Step::Interpret | Step::Execute) || raw.stderr.is_truncated() {
        return None;
    }
    let text = raw.stderr.text();

    let aborted = raw.termination == Termination::Signaled(libc::SIGABRT);
    let last_line = text.lines().rev().find(|line| !line.is_empty());
    if aborted && last_line.map_or(false, is_allocation_failure) {
        return Some(Bound::Memory);
    }
    if step == Step::Interpret && text.lines().any(|line| line.starts_with(MIRI_EXHAUSTION)) {
        return Some(Bound::Memory);
    }
    if processes_limited
        && text
            .lines()
            .any(|line| line.contains(SPAWN_FAILURE) && line.contains(EAGAIN_CODE))
    {
        return Some(Bound::Processes);
    }
    None
}

/// `memory allocation of <N> bytes failed`, as printed by the default
/// allocation error handler before it aborts.
fn is_allocation_failure(line: &str) -> bool {
    line.strip_prefix("memory allocation of ")
        .and_then(|rest| rest.strip_suffix(" bytes failed"))
        .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
