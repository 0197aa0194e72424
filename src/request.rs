//! Execution requests as accepted by the dispatcher.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// What the toolchain does with a snippet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Compile-check, then run under the interpreter-based UB checker.
    #[default]
    Miri,
    /// Build a native executable, then run it.
    Run,
    /// Build only.
    Build,
    /// Run the formatter over the source and return the result.
    Format,
}

impl ExecutionMode {
    /// Whether the mode has an interpreting stage after building.
    pub fn interprets(self) -> bool {
        matches!(self, ExecutionMode::Miri | ExecutionMode::Run)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Miri => "miri",
            ExecutionMode::Run => "run",
            ExecutionMode::Build => "build",
            ExecutionMode::Format => "format",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BuildProfile {
    #[default]
    Debug,
    Release,
}

/// What `build` mode emits instead of an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum CompileTarget {
    #[serde(rename = "asm")]
    #[value(name = "asm")]
    Asm,
    #[serde(rename = "llvm-ir")]
    #[value(name = "llvm-ir")]
    LlvmIr,
}

impl CompileTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            CompileTarget::Asm => "asm",
            CompileTarget::LlvmIr => "llvm-ir",
        }
    }
}

impl fmt::Display for CompileTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release channel the toolchain is selected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stable,
    Beta,
    Nightly,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Stable => "stable",
            Channel::Beta => "beta",
            Channel::Nightly => "nightly",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request limit overrides. Clamped to the configured ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOverrides {
    pub timeout: Option<Duration>,
    pub memory_bytes: Option<u64>,
}

/// A snippet submitted for execution.
///
/// Built once with the setter chain and then handed to the dispatcher by
/// value; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: Option<String>,
    source: String,
    mode: ExecutionMode,
    profile: BuildProfile,
    tests: bool,
    target: Option<CompileTarget>,
    channel: Option<Channel>,
    overrides: LimitOverrides,
}

impl ExecutionRequest {
    pub fn new<S: Into<String>>(source: S) -> Self {
        ExecutionRequest {
            id: None,
            source: source.into(),
            mode: ExecutionMode::default(),
            profile: BuildProfile::default(),
            tests: false,
            target: None,
            channel: None,
            overrides: LimitOverrides::default(),
        }
    }

    /// Set the caller correlation id
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the caller correlation id or leave it to be generated
    pub fn set_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn profile(mut self, profile: BuildProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Build and interpret with the test harness
    pub fn tests(mut self, flag: bool) -> Self {
        self.tests = flag;
        self
    }

    /// Emit assembly or LLVM IR instead of an executable (build mode only)
    pub fn target(mut self, target: Option<CompileTarget>) -> Self {
        self.target = target;
        self
    }

    /// Select the toolchain channel; `None` keeps the service default
    pub fn channel(mut self, channel: Option<Channel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn timeout(mut self, value: Duration) -> Self {
        self.overrides.timeout = Some(value);
        self
    }

    /// Set memory limit (unit: bytes)
    pub fn memory_limit(mut self, value: u64) -> Self {
        self.overrides.memory_bytes = Some(value);
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn build_profile(&self) -> BuildProfile {
        self.profile
    }

    pub fn with_tests(&self) -> bool {
        self.tests
    }

    pub fn compile_target(&self) -> Option<CompileTarget> {
        self.target
    }

    pub fn toolchain_channel(&self) -> Option<Channel> {
        self.channel
    }

    pub fn limit_overrides(&self) -> LimitOverrides {
        self.overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_miri_debug_without_tests() {
        let req = ExecutionRequest::new("fn main() {}");
        assert_eq!(req.execution_mode(), ExecutionMode::Miri);
        assert_eq!(req.build_profile(), BuildProfile::Debug);
        assert!(!req.with_tests());
        assert_eq!(req.correlation_id(), None);
        assert_eq!(req.compile_target(), None);
        assert_eq!(req.toolchain_channel(), None);
        assert_eq!(req.limit_overrides(), LimitOverrides::default());
    }

    #[test]
    fn setters_chain() {
        let req = ExecutionRequest::new("fn main() {}")
            .id("abc")
            .mode(ExecutionMode::Run)
            .profile(BuildProfile::Release)
            .tests(true)
            .channel(Some(Channel::Beta))
            .timeout(Duration::from_secs(2))
            .memory_limit(1 << 20);
        assert_eq!(req.correlation_id(), Some("abc"));
        assert_eq!(req.execution_mode(), ExecutionMode::Run);
        assert_eq!(req.build_profile(), BuildProfile::Release);
        assert!(req.with_tests());
        assert_eq!(req.toolchain_channel(), Some(Channel::Beta));
        assert_eq!(req.limit_overrides().timeout, Some(Duration::from_secs(2)));
        assert_eq!(req.limit_overrides().memory_bytes, Some(1 << 20));
    }

    #[test]
    fn modes_deserialize_from_snake_case() {
        let mode: ExecutionMode = serde_json::from_str("\"format\"").unwrap();
        assert_eq!(mode, ExecutionMode::Format);
        assert!(serde_json::from_str::<ExecutionMode>("\"asm\"").is_err());
        assert!(ExecutionMode::Miri.interprets());
        assert!(ExecutionMode::Run.interprets());
        assert!(!ExecutionMode::Build.interprets());
        assert!(!ExecutionMode::Format.interprets());
    }

    #[test]
    fn targets_and_channels_use_the_wire_names() {
        let target: CompileTarget = serde_json::from_str("\"llvm-ir\"").unwrap();
        assert_eq!(target, CompileTarget::LlvmIr);
        assert_eq!(serde_json::to_string(&CompileTarget::Asm).unwrap(), "\"asm\"");
        assert!(serde_json::from_str::<CompileTarget>("\"wasm\"").is_err());

        let channel: Channel = serde_json::from_str("\"nightly\"").unwrap();
        assert_eq!(channel, Channel::Nightly);
        assert!(serde_json::from_str::<Channel>("\"dev\"").is_err());
    }
}
