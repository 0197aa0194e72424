//! Request dispatcher.
//!
//! Validates requests, admits them under a concurrency cap, gives each one a
//! working area and a cancellation token, and runs it in its own task so a
//! panic or a dropped caller cannot affect any other request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::limits::ResourceBudget;
use crate::request::{Channel, ExecutionMode, ExecutionRequest};
use crate::sandbox::{Execution, ExecutionOutcome, SandboxRunner};
use crate::workarea::{self, WorkingArea};

const MAX_ID_LEN: usize = 128;

/// What happens to a request that arrives while every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Fail with [`Error::Busy`] immediately.
    Reject,
    /// Wait in a queue of at most `depth` requests, each for at most `timeout`.
    Wait { depth: usize, timeout: Duration },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy::Wait {
            depth: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Administrator settings for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub work_root: PathBuf,
    pub max_concurrent: usize,
    pub queue: QueuePolicy,
    /// Applied when a request has no overrides.
    pub budget: ResourceBudget,
    /// Ceiling for timeout overrides.
    pub max_timeout: Duration,
    /// Ceiling for memory overrides.
    pub max_memory_bytes: u64,
    pub max_source_bytes: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy {
            work_root: std::env::temp_dir().join("playground"),
            max_concurrent: 10,
            queue: QueuePolicy::default(),
            budget: ResourceBudget::default(),
            max_timeout: Duration::from_secs(60),
            max_memory_bytes: 4096 * 1024 * 1024,
            max_source_bytes: 64 * 1024,
        }
    }
}

impl DispatchPolicy {
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        if self.max_concurrent == 0 {
            return Err(Error::config("max concurrency must be positive"));
        }
        if self.max_source_bytes == 0 {
            return Err(Error::config("source size limit must be positive"));
        }
        if self.budget.wall_time > self.max_timeout {
            return Err(Error::config("default timeout is above the maximum timeout"));
        }
        if self.budget.memory_bytes > self.max_memory_bytes {
            return Err(Error::config("default memory limit is above the maximum memory limit"));
        }
        if let QueuePolicy::Wait { timeout, .. } = self.queue {
            if timeout.is_zero() {
                return Err(Error::config("queue timeout must be positive"));
            }
        }
        Ok(())
    }
}

/// Snapshot of the admission counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStatus {
    pub capacity: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub peak_in_flight: usize,
    pub completed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicU64,
    seq: AtomicU64,
}

/// Decrements `in_flight` when the run ends, however it ends.
struct InFlight {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl InFlight {
    fn enter(counters: Arc<Counters>, permit: OwnedSemaphorePermit) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight {
            counters,
            _permit: permit,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
    }
}

struct QueueSlot<'a>(&'a Counters);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

type Registry = Arc<RwLock<HashMap<String, CancellationToken>>>;

/// Admits and runs requests.
#[derive(Debug)]
pub struct Dispatcher {
    policy: DispatchPolicy,
    runner: Arc<SandboxRunner>,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    registry: Registry,
}

impl Dispatcher {
    /// Validate `policy`, prepare the work root and sweep stale areas.
    pub fn new(policy: DispatchPolicy, runner: SandboxRunner) -> Result<Self> {
        policy.validate()?;
        workarea::prepare_root(&policy.work_root)?;
        info!(
            work_root = ?policy.work_root,
            max_concurrent = policy.max_concurrent,
            queue = ?policy.queue,
            "Dispatcher ready"
        );
        Ok(Dispatcher {
            permits: Arc::new(Semaphore::new(policy.max_concurrent)),
            policy,
            runner: Arc::new(runner),
            counters: Arc::new(Counters::default()),
            registry: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn runner(&self) -> &SandboxRunner {
        &self.runner
    }

    /// Run `request` to a single outcome.
    ///
    /// Errors are reserved for requests that were never run: invalid input,
    /// a duplicate id, or back-pressure. Everything that happens once a
    /// request is admitted is reported through the returned outcome.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Execution> {
        let budget = self.validate(&request)?;
        let id = match request.correlation_id() {
            Some(id) => id.to_owned(),
            None => Uuid::new_v4().to_string(),
        };
        if self.registry.read().await.contains_key(&id) {
            return Err(Error::DuplicateRequest(id));
        }

        let permit = self.admit(&id).await?;
        let cancel = CancellationToken::new();
        {
            let mut registry = self.registry.write().await;
            if registry.contains_key(&id) {
                return Err(Error::DuplicateRequest(id));
            }
            registry.insert(id.clone(), cancel.clone());
        }
        let in_flight = InFlight::enter(self.counters.clone(), permit);

        let mode = request.execution_mode();
        info!(id = %id, mode = %mode, source_len = request.source().len(), "Request accepted");

        let seq = self.counters.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let task = tokio::spawn(run_isolated(
            self.runner.clone(),
            self.registry.clone(),
            self.policy.work_root.clone(),
            seq,
            id.clone(),
            request,
            budget,
            cancel.clone(),
            in_flight,
        ));

        // Dropping the caller's future cancels the run.
        let guard = cancel.drop_guard();
        let joined = task.await;
        guard.disarm();

        let (outcome, elapsed) = joined.unwrap_or_else(|e| {
            error!(id = %id, error = %e, "Request task failed");
            (
                ExecutionOutcome::internal(None, format!("request task failed: {}", e)),
                Duration::ZERO,
            )
        });
        info!(
            id = %id,
            outcome = %outcome.tag(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request finished"
        );
        Ok(Execution {
            id,
            mode,
            outcome,
            elapsed,
        })
    }

    /// Cancel one in-flight request. Returns false if `id` is unknown.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.registry.read().await.get(id) {
            Some(token) => {
                info!(id = %id, "Cancelling request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight request. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let registry = self.registry.read().await;
        for token in registry.values() {
            token.cancel();
        }
        if !registry.is_empty() {
            info!(count = registry.len(), "Cancelled all in-flight requests");
        }
        registry.len()
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            capacity: self.policy.max_concurrent,
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
        }
    }

    /// Reject malformed requests and compute the effective budget.
    fn validate(&self, request: &ExecutionRequest) -> Result<ResourceBudget> {
        let source = request.source();
        if source.trim().is_empty() {
            return Err(Error::invalid("source is empty"));
        }
        if source.len() > self.policy.max_source_bytes {
            return Err(Error::invalid(format!(
                "source is {} bytes, the limit is {}",
                source.len(),
                self.policy.max_source_bytes
            )));
        }
        if let Some(id) = request.correlation_id() {
            let well_formed = !id.is_empty()
                && id.len() <= MAX_ID_LEN
                && id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !well_formed {
                return Err(Error::invalid(
                    "id must be 1-128 characters of letters, digits, '-', '_' or '.'",
                ));
            }
        }
        if request.execution_mode() == ExecutionMode::Format
            && !self.runner.toolchain().has_formatter()
        {
            return Err(Error::invalid("format mode is unavailable: no formatter is configured"));
        }
        if let Some(target) = request.compile_target() {
            if request.execution_mode() != ExecutionMode::Build {
                return Err(Error::invalid(format!(
                    "target {} needs build mode, not {}",
                    target,
                    request.execution_mode()
                )));
            }
        }
        if request.execution_mode() == ExecutionMode::Miri
            && matches!(request.toolchain_channel(), Some(Channel::Stable | Channel::Beta))
        {
            return Err(Error::invalid("miri mode needs the nightly channel"));
        }

        let overrides = request.limit_overrides();
        let mut budget = self.policy.budget;
        if let Some(timeout) = overrides.timeout {
            if timeout.is_zero() {
                return Err(Error::invalid("timeout must be positive"));
            }
            budget.wall_time = timeout.min(self.policy.max_timeout);
        }
        if let Some(memory) = overrides.memory_bytes {
            if memory == 0 {
                return Err(Error::invalid("memory limit must be positive"));
            }
            budget.memory_bytes = memory.min(self.policy.max_memory_bytes);
        }
        budget.cpu_time = budget.cpu_time.min(budget.wall_time);
        Ok(budget)
    }

    async fn admit(&self, id: &str) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        let started = Instant::now();
        let (depth, timeout) = match self.policy.queue {
            QueuePolicy::Reject => return Err(self.busy(started)),
            QueuePolicy::Wait { depth, timeout } => (depth, timeout),
        };

        let queued = self.counters.waiting.fetch_add(1, Ordering::SeqCst);
        let slot = QueueSlot(&self.counters);
        if queued >= depth {
            drop(slot);
            debug!(id = %id, depth, "Queue full");
            return Err(self.busy(started));
        }

        debug!(id = %id, position = queued + 1, "Waiting for a slot");
        let acquired = tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await;
        drop(slot);
        match acquired {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(self.busy(started)),
            Err(_elapsed) => {
                warn!(id = %id, waited_ms = timeout.as_millis() as u64, "Gave up waiting for a slot");
                Err(self.busy(started))
            }
        }
    }

    fn busy(&self, started: Instant) -> Error {
        Error::Busy {
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            waited: started.elapsed(),
        }
    }
}

/// Body of a request's task. Owns the working area, so the area is removed
/// when this returns or unwinds.
#[allow(clippy::too_many_arguments)]
async fn run_isolated(
    runner: Arc<SandboxRunner>,
    registry: Registry,
    work_root: PathBuf,
    seq: u64,
    id: String,
    request: ExecutionRequest,
    budget: ResourceBudget,
    cancel: CancellationToken,
    in_flight: InFlight,
) -> (ExecutionOutcome, Duration) {
    let started = Instant::now();

    let run_id = id.clone();
    let run = tokio::spawn(async move {
        let area = match WorkingArea::create(&work_root, seq) {
            Ok(area) => area,
            Err(e) => {
                error!(id = %run_id, error = %e, "Unable to create working area");
                return ExecutionOutcome::internal(None, e.to_string());
            }
        };
        runner.run(&run_id, &request, &area, &budget, &cancel).await
    });

    let outcome = match run.await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(id = %id, error = %e, "Run panicked");
            ExecutionOutcome::internal(None, format!("run aborted: {}", e))
        }
    };

    registry.write().await.remove(&id);
    drop(in_flight);
    (outcome, started.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Limiter;
    use crate::request::CompileTarget;
    use crate::toolchain::{Toolchain, ToolchainConfig};

    fn dispatcher(root: &std::path::Path, queue: QueuePolicy) -> Dispatcher {
        let toolchain = ToolchainConfig {
            check: "sh -c true".parse().unwrap(),
            build: "sh -c true".parse().unwrap(),
            interpret: "sh -c true".parse().unwrap(),
            execute: "sh -c true".parse().unwrap(),
            asm: "sh -c true".parse().unwrap(),
            llvm_ir: "sh -c true".parse().unwrap(),
            format: None,
            ..ToolchainConfig::default()
        };
        let runner = SandboxRunner::new(
            Arc::new(Toolchain::discover(toolchain).unwrap()),
            Limiter::default(),
        );
        let policy = DispatchPolicy {
            work_root: root.to_path_buf(),
            max_concurrent: 2,
            queue,
            ..DispatchPolicy::default()
        };
        Dispatcher::new(policy, runner).unwrap()
    }

    #[test]
    fn policy_validation() {
        assert!(DispatchPolicy::default().validate().is_ok());
        let zero = DispatchPolicy {
            max_concurrent: 0,
            ..DispatchPolicy::default()
        };
        assert!(matches!(zero.validate(), Err(Error::Config(_))));
        let inverted = DispatchPolicy {
            max_timeout: Duration::from_secs(1),
            ..DispatchPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test]
    async fn caller_errors_are_rejected_before_running() {
        let root = tempfile::tempdir().unwrap();
        let d = dispatcher(root.path(), QueuePolicy::Reject);

        let empty = d.submit(ExecutionRequest::new("  \n\t")).await;
        assert!(matches!(empty, Err(Error::InvalidRequest(_))));

        let huge = d.submit(ExecutionRequest::new("x".repeat(64 * 1024 + 1))).await;
        assert!(matches!(huge, Err(Error::InvalidRequest(_))));

        let zero = d
            .submit(ExecutionRequest::new("fn main() {}").timeout(Duration::ZERO))
            .await;
        assert!(matches!(zero, Err(Error::InvalidRequest(_))));

        let bad_id = d.submit(ExecutionRequest::new("fn main() {}").id("../etc")).await;
        assert!(matches!(bad_id, Err(Error::InvalidRequest(_))));

        let no_formatter = d
            .submit(ExecutionRequest::new("fn main() {}").mode(ExecutionMode::Format))
            .await;
        assert!(matches!(no_formatter, Err(Error::InvalidRequest(_))));

        let asm_in_run_mode = d
            .submit(
                ExecutionRequest::new("fn main() {}")
                    .mode(ExecutionMode::Run)
                    .target(Some(CompileTarget::Asm)),
            )
            .await;
        assert!(matches!(asm_in_run_mode, Err(Error::InvalidRequest(_))));

        let stable_miri = d
            .submit(ExecutionRequest::new("fn main() {}").channel(Some(Channel::Stable)))
            .await;
        assert!(matches!(stable_miri, Err(Error::InvalidRequest(_))));

        assert_eq!(d.status().completed, 0);
    }

    #[test]
    fn overrides_are_clamped_to_ceilings() {
        let root = tempfile::tempdir().unwrap();
        let d = dispatcher(root.path(), QueuePolicy::Reject);
        let request = ExecutionRequest::new("fn main() {}")
            .timeout(Duration::from_secs(3600))
            .memory_limit(u64::MAX);
        let budget = d.validate(&request).unwrap();
        assert_eq!(budget.wall_time, Duration::from_secs(60));
        assert_eq!(budget.memory_bytes, 4096 * 1024 * 1024);

        let short = ExecutionRequest::new("fn main() {}").timeout(Duration::from_secs(2));
        let budget = d.validate(&short).unwrap();
        assert_eq!(budget.wall_time, Duration::from_secs(2));
        assert_eq!(budget.cpu_time, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn generated_ids_are_unique_and_registry_is_emptied() {
        let root = tempfile::tempdir().unwrap();
        let d = dispatcher(root.path(), QueuePolicy::Reject);
        let a = d.submit(ExecutionRequest::new("fn main() {}")).await.unwrap();
        let b = d.submit(ExecutionRequest::new("fn main() {}")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(d.registry.read().await.is_empty());
        assert!(!d.cancel(&a.id).await);
        let status = d.status();
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.completed, 2);
    }

    #[tokio::test]
    async fn stale_areas_are_swept_on_construction() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("req-00000001-deadbeef")).unwrap();
        let _d = dispatcher(root.path(), QueuePolicy::Reject);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
