//! Toolchain handle.
//!
//! Command templates are parsed and their programs resolved once at startup.
//! The resulting [`Toolchain`] is read-only and shared by every request.
//!
//! Templates are split on whitespace and may use three placeholders:
//! `{source}` (the snippet file), `{artifact}` (the step's output file) and
//! `{workdir}` (the request's working area).
//!
//! A request may name a release channel. It is passed to every step through
//! the configured selector variable (`RUSTUP_TOOLCHAIN` by default), which
//! the rustup proxies honour.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::limits::Invocation;
use crate::request::{BuildProfile, Channel, ExecutionRequest};
use crate::workarea::WorkingArea;

pub const DEFAULT_CHECK_TEMPLATE: &str =
    "rustc --edition 2021 --crate-name playground --color never --emit=metadata -o {artifact} {source}";
pub const DEFAULT_BUILD_TEMPLATE: &str =
    "rustc --edition 2021 --crate-name playground --color never -C debuginfo=0 -o {artifact} {source}";
pub const DEFAULT_ASM_TEMPLATE: &str =
    "rustc --edition 2021 --crate-name playground --color never --emit=asm -o {artifact} {source}";
pub const DEFAULT_LLVM_IR_TEMPLATE: &str =
    "rustc --edition 2021 --crate-name playground --color never --emit=llvm-ir -o {artifact} {source}";
pub const DEFAULT_INTERPRET_TEMPLATE: &str =
    "miri --edition 2021 --crate-name playground --color never {source}";
pub const DEFAULT_EXECUTE_TEMPLATE: &str = "{artifact}";
pub const DEFAULT_FORMAT_TEMPLATE: &str = "rustfmt --edition 2021 {source}";
pub const DEFAULT_RELEASE_FLAGS: &str = "-C opt-level=3";
pub const DEFAULT_TEST_FLAGS: &str = "--test";
pub const DEFAULT_ENV_PASSTHROUGH: &str = "PATH,HOME,MIRI_SYSROOT,RUSTUP_HOME,CARGO_HOME,RUSTUP_TOOLCHAIN";
pub const DEFAULT_CHANNEL_ENV: &str = "RUSTUP_TOOLCHAIN";

const SOURCE: &str = "{source}";
const ARTIFACT: &str = "{artifact}";
const WORKDIR: &str = "{workdir}";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One toolchain command line with placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Whether the program itself is produced by an earlier step.
    fn program_is_placeholder(&self) -> bool {
        self.program.starts_with('{')
    }
}

impl FromStr for CommandTemplate {
    type Err = Error;

    fn from_str(template: &str) -> Result<Self> {
        let mut words = template.split_whitespace().map(str::to_owned);
        let program = words
            .next()
            .ok_or_else(|| Error::config("command template is empty"))?;
        let args: Vec<String> = words.collect();
        for word in std::iter::once(&program).chain(args.iter()) {
            if let Some(open) = word.find('{') {
                let placeholder = &word[open..];
                if ![SOURCE, ARTIFACT, WORKDIR]
                    .iter()
                    .any(|known| placeholder.starts_with(known))
                {
                    return Err(Error::config(format!(
                        "unknown placeholder in {:?}",
                        template
                    )));
                }
            }
        }
        Ok(CommandTemplate { program, args })
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A toolchain step. Each stage of a request runs exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Compile-check without code generation.
    Check,
    Build,
    /// Emit assembly instead of an executable.
    Asm,
    /// Emit LLVM IR instead of an executable.
    LlvmIr,
    /// Run the source under the UB-checking interpreter.
    Interpret,
    /// Run the native executable produced by [`Step::Build`].
    Execute,
    Format,
}

impl Step {
    /// File the step writes, or reads when it consumes an earlier step's output.
    pub fn artifact_name(self) -> &'static str {
        match self {
            Step::Check | Step::Interpret => "main.rmeta",
            Step::Build | Step::Execute => "main",
            Step::Asm => "main.s",
            Step::LlvmIr => "main.ll",
            Step::Format => "main.rs",
        }
    }

    /// Whether the step compiles, as opposed to running or formatting.
    pub fn compiles(self) -> bool {
        matches!(self, Step::Check | Step::Build | Step::Asm | Step::LlvmIr)
    }

    fn takes_test_flags(self) -> bool {
        self.compiles() || self == Step::Interpret
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Check => "check",
            Step::Build => "build",
            Step::Asm => "asm",
            Step::LlvmIr => "llvm-ir",
            Step::Interpret => "interpret",
            Step::Execute => "execute",
            Step::Format => "format",
        };
        f.write_str(name)
    }
}

/// Unresolved toolchain settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainConfig {
    pub check: CommandTemplate,
    pub build: CommandTemplate,
    pub asm: CommandTemplate,
    pub llvm_ir: CommandTemplate,
    pub interpret: CommandTemplate,
    pub execute: CommandTemplate,
    /// The formatter is optional; requests in format mode fail without it.
    pub format: Option<CommandTemplate>,
    pub release_flags: Vec<String>,
    pub test_flags: Vec<String>,
    /// Variables copied from the service environment into every child.
    pub env_passthrough: Vec<String>,
    /// Variable set to the request's channel name.
    pub channel_env: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        let template = |s: &str| CommandTemplate {
            program: s.split_whitespace().next().unwrap_or_default().to_owned(),
            args: s.split_whitespace().skip(1).map(str::to_owned).collect(),
        };
        ToolchainConfig {
            check: template(DEFAULT_CHECK_TEMPLATE),
            build: template(DEFAULT_BUILD_TEMPLATE),
            asm: template(DEFAULT_ASM_TEMPLATE),
            llvm_ir: template(DEFAULT_LLVM_IR_TEMPLATE),
            interpret: template(DEFAULT_INTERPRET_TEMPLATE),
            execute: template(DEFAULT_EXECUTE_TEMPLATE),
            format: Some(template(DEFAULT_FORMAT_TEMPLATE)),
            release_flags: split_flags(DEFAULT_RELEASE_FLAGS),
            test_flags: split_flags(DEFAULT_TEST_FLAGS),
            env_passthrough: DEFAULT_ENV_PASSTHROUGH.split(',').map(str::to_owned).collect(),
            channel_env: DEFAULT_CHANNEL_ENV.to_owned(),
        }
    }
}

pub fn split_flags(flags: &str) -> Vec<String> {
    flags.split_whitespace().map(str::to_owned).collect()
}

#[derive(Debug, Clone)]
struct ResolvedStep {
    template: CommandTemplate,
    /// `None` when the program is a placeholder filled in per request.
    program: Option<PathBuf>,
}

/// Resolved, read-only toolchain.
#[derive(Debug, Clone)]
pub struct Toolchain {
    check: ResolvedStep,
    build: ResolvedStep,
    asm: ResolvedStep,
    llvm_ir: ResolvedStep,
    interpret: ResolvedStep,
    execute: ResolvedStep,
    format: Option<ResolvedStep>,
    release_flags: Vec<String>,
    test_flags: Vec<String>,
    env: Vec<(String, String)>,
    channel_env: String,
}

impl Toolchain {
    /// Resolve every template's program on `PATH`.
    ///
    /// A missing compiler or interpreter is fatal. A missing formatter only
    /// disables format mode.
    pub fn discover(config: ToolchainConfig) -> Result<Self> {
        let format = match config.format {
            Some(template) => match resolve(template.clone()) {
                Ok(step) => Some(step),
                Err(e) => {
                    warn!(template = %template, error = %e, "Formatter unavailable, format mode disabled");
                    None
                }
            },
            None => None,
        };
        let env = config
            .env_passthrough
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();

        let toolchain = Toolchain {
            check: resolve(config.check)?,
            build: resolve(config.build)?,
            asm: resolve(config.asm)?,
            llvm_ir: resolve(config.llvm_ir)?,
            interpret: resolve(config.interpret)?,
            execute: resolve(config.execute)?,
            format,
            release_flags: config.release_flags,
            test_flags: config.test_flags,
            env,
            channel_env: config.channel_env,
        };
        info!(
            check = %toolchain.check.template,
            build = %toolchain.build.template,
            asm = %toolchain.asm.template,
            llvm_ir = %toolchain.llvm_ir.template,
            interpret = %toolchain.interpret.template,
            execute = %toolchain.execute.template,
            formatter = toolchain.format.is_some(),
            "Toolchain resolved"
        );
        Ok(toolchain)
    }

    pub fn has_formatter(&self) -> bool {
        self.format.is_some()
    }

    fn step(&self, step: Step) -> Option<&ResolvedStep> {
        match step {
            Step::Check => Some(&self.check),
            Step::Build => Some(&self.build),
            Step::Asm => Some(&self.asm),
            Step::LlvmIr => Some(&self.llvm_ir),
            Step::Interpret => Some(&self.interpret),
            Step::Execute => Some(&self.execute),
            Step::Format => self.format.as_ref(),
        }
    }

    /// Render `step` of `request` for its working area.
    pub fn invocation(
        &self,
        step: Step,
        area: &WorkingArea,
        request: &ExecutionRequest,
    ) -> Result<Invocation> {
        let resolved = self
            .step(step)
            .ok_or_else(|| Error::config(format!("no {} command is configured", step)))?;

        let source = area.source_path();
        let artifact = area.file(step.artifact_name());
        let fill = |word: &str| substitute(word, &source, &artifact, area.path());

        let program = match &resolved.program {
            Some(path) => path.clone(),
            None => PathBuf::from(fill(resolved.template.program.as_str())),
        };
        let mut args: Vec<String> = resolved.template.args.iter().map(|a| fill(a.as_str())).collect();
        if request.build_profile() == BuildProfile::Release && step.compiles() {
            args.extend(self.release_flags.iter().cloned());
        }
        if request.with_tests() && step.takes_test_flags() {
            args.extend(self.test_flags.iter().cloned());
        }

        let mut invocation = Invocation::new(program).args(args).current_dir(area.path());
        invocation.env = self.child_env(request.toolchain_channel());
        Ok(invocation)
    }

    /// Pass-through variables, with the channel selector overridden when
    /// the request names a channel.
    fn child_env(&self, channel: Option<Channel>) -> Vec<(String, String)> {
        let Some(channel) = channel else {
            return self.env.clone();
        };
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .filter(|(key, _)| *key != self.channel_env)
            .cloned()
            .collect();
        env.push((self.channel_env.clone(), channel.to_string()));
        env
    }

    /// Log the version of every resolved program. Also warms the page cache
    /// before the first request.
    pub async fn probe(&self) {
        let programs: BTreeSet<&Path> = [
            &self.check,
            &self.build,
            &self.asm,
            &self.llvm_ir,
            &self.interpret,
            &self.execute,
        ]
        .into_iter()
        .chain(self.format.as_ref())
        .filter_map(|step| step.program.as_deref())
        .collect();

        for program in programs {
            let output = tokio::time::timeout(
                PROBE_TIMEOUT,
                tokio::process::Command::new(program)
                    .arg("--version")
                    .env_clear()
                    .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                    .kill_on_drop(true)
                    .output(),
            )
            .await;
            match output {
                Ok(Ok(output)) if output.status.success() => {
                    let version = String::from_utf8_lossy(&output.stdout);
                    info!(program = ?program, version = %version.trim(), "Toolchain program ready");
                }
                Ok(Ok(output)) => {
                    warn!(program = ?program, status = %output.status, "Version probe failed")
                }
                Ok(Err(e)) => warn!(program = ?program, error = %e, "Version probe failed"),
                Err(_) => warn!(program = ?program, "Version probe timed out"),
            }
        }
    }
}

fn resolve(template: CommandTemplate) -> Result<ResolvedStep> {
    if template.program_is_placeholder() {
        return Ok(ResolvedStep {
            template,
            program: None,
        });
    }
    let program = which::which(&template.program).map_err(|source| Error::ToolchainMissing {
        program: template.program.clone(),
        source,
    })?;
    Ok(ResolvedStep {
        template,
        program: Some(program),
    })
}

fn substitute(word: &str, source: &Path, artifact: &Path, workdir: &Path) -> String {
    word.replace(SOURCE, &source.to_string_lossy())
        .replace(ARTIFACT, &artifact.to_string_lossy())
        .replace(WORKDIR, &workdir.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_toolchain() -> ToolchainConfig {
        ToolchainConfig {
            check: "sh -c true {source} {artifact}".parse().unwrap(),
            build: "sh -c true {source} {artifact}".parse().unwrap(),
            asm: "sh -c true {source} {artifact}".parse().unwrap(),
            llvm_ir: "sh -c true {source} {artifact}".parse().unwrap(),
            interpret: "sh {artifact}".parse().unwrap(),
            execute: "{artifact}".parse().unwrap(),
            format: Some("sh -c true {source}".parse().unwrap()),
            release_flags: split_flags("-C opt-level=3"),
            test_flags: split_flags("--test"),
            env_passthrough: vec!["PATH".into()],
            channel_env: DEFAULT_CHANNEL_ENV.into(),
        }
    }

    #[test]
    fn templates_split_on_whitespace() {
        let t: CommandTemplate = "  rustc  --emit=metadata -o {artifact} {source} ".parse().unwrap();
        assert_eq!(t.program(), "rustc");
        assert_eq!(t.args(), ["--emit=metadata", "-o", "{artifact}", "{source}"]);
        assert_eq!(t.to_string(), "rustc --emit=metadata -o {artifact} {source}");
    }

    #[test]
    fn bad_templates_are_config_errors() {
        assert!(matches!("   ".parse::<CommandTemplate>(), Err(Error::Config(_))));
        assert!(matches!(
            "rustc {input}".parse::<CommandTemplate>(),
            Err(Error::Config(_))
        ));
        assert!("rustc --out-dir={workdir}".parse::<CommandTemplate>().is_ok());
    }

    #[test]
    fn missing_compiler_is_fatal() {
        let config = ToolchainConfig {
            check: "playground-no-such-compiler {source}".parse().unwrap(),
            ..shell_toolchain()
        };
        assert!(matches!(
            Toolchain::discover(config),
            Err(Error::ToolchainMissing { .. })
        ));
    }

    #[test]
    fn missing_formatter_only_disables_format_mode() {
        let config = ToolchainConfig {
            format: Some("playground-no-such-formatter {source}".parse().unwrap()),
            ..shell_toolchain()
        };
        let toolchain = Toolchain::discover(config).unwrap();
        assert!(!toolchain.has_formatter());
        let root = tempfile::tempdir().unwrap();
        let area = WorkingArea::create(root.path(), 1).unwrap();
        assert!(toolchain
            .invocation(Step::Format, &area, &ExecutionRequest::new("fn main() {}"))
            .is_err());
    }

    #[test]
    fn placeholders_and_flags_are_rendered() {
        let toolchain = Toolchain::discover(shell_toolchain()).unwrap();
        let root = tempfile::tempdir().unwrap();
        let area = WorkingArea::create(root.path(), 1).unwrap();
        let request = ExecutionRequest::new("fn main() {}")
            .profile(BuildProfile::Release)
            .tests(true);

        let build = toolchain.invocation(Step::Build, &area, &request).unwrap();
        assert!(build.program.is_absolute());
        assert_eq!(build.cwd, area.path());
        let source = area.source_path().display().to_string();
        let artifact = area.file("main").display().to_string();
        assert_eq!(
            build.args,
            ["-c", "true", source.as_str(), artifact.as_str(), "-C", "opt-level=3", "--test"]
        );
        assert_eq!(build.env.len(), 1);
        assert_eq!(build.env[0].0, "PATH");

        let execute = toolchain.invocation(Step::Execute, &area, &request).unwrap();
        assert_eq!(execute.program, area.file("main"));
        assert!(execute.args.is_empty());

        let interpret = toolchain.invocation(Step::Interpret, &area, &request).unwrap();
        assert_eq!(
            interpret.args,
            [area.file("main.rmeta").display().to_string(), "--test".to_string()]
        );

        let asm = toolchain.invocation(Step::Asm, &area, &request).unwrap();
        assert_eq!(asm.args[3], area.file("main.s").display().to_string());
        assert_eq!(&asm.args[4..], ["-C", "opt-level=3", "--test"]);
    }

    #[test]
    fn channel_overrides_the_selector_variable() {
        let config = ToolchainConfig {
            env_passthrough: vec!["PATH".into(), "PLAYGROUND_TOOLCHAIN_TEST_CHANNEL".into()],
            channel_env: "PLAYGROUND_TOOLCHAIN_TEST_CHANNEL".into(),
            ..shell_toolchain()
        };
        std::env::set_var("PLAYGROUND_TOOLCHAIN_TEST_CHANNEL", "1.70.0");
        let toolchain = Toolchain::discover(config).unwrap();
        let root = tempfile::tempdir().unwrap();
        let area = WorkingArea::create(root.path(), 1).unwrap();
        let selected = |request: &ExecutionRequest| {
            toolchain
                .invocation(Step::Build, &area, request)
                .unwrap()
                .env
                .into_iter()
                .filter(|(key, _)| key == "PLAYGROUND_TOOLCHAIN_TEST_CHANNEL")
                .map(|(_, value)| value)
                .collect::<Vec<_>>()
        };

        let default = ExecutionRequest::new("fn main() {}");
        assert_eq!(selected(&default), ["1.70.0"]);
        let nightly = ExecutionRequest::new("fn main() {}").channel(Some(Channel::Nightly));
        assert_eq!(selected(&nightly), ["nightly"]);
    }
}
