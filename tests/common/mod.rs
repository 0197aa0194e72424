//! Shared fixtures: a fake toolchain built from shell scripts.
//!
//! The fake compiler copies the "snippet" (a shell script) to the artifact
//! path, or fails with a rustc-style diagnostic when the source contains
//! `COMPILE_ERROR`, quoting the source the way rustc quotes offending lines.
//! The fake emitter writes the source behind a header naming the selected
//! channel. Interpreting and executing both run the artifact with `sh`, so
//! tests describe program behaviour in shell.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;

use playground::limits::{Limiter, ResourceBudget, SandboxPolicy};
use playground::toolchain::{Toolchain, ToolchainConfig};
use playground::{DispatchPolicy, Dispatcher, QueuePolicy, SandboxRunner};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("playground=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

const FAKE_RUSTC: &str = r#"
src="$1"
out="$2"
if grep -q COMPILE_ERROR "$src"; then
    echo "error[E0308]: mismatched types" >&2
    echo " --> src/main.rs:1:26" >&2
    sed 's/^/  | /' "$src" >&2
    exit 1
fi
if grep -q NO_ARTIFACT "$src"; then
    exit 0
fi
cp "$src" "$out"
"#;

const FAKE_EMIT: &str = r#"
printf '; channel=%s\n' "${RUSTUP_TOOLCHAIN:-default}" > "$2"
cat "$1" >> "$2"
"#;

const FAKE_FMT: &str = r#"
if grep -q COMPILE_ERROR "$1"; then
    echo "error: expected one of \`!\` or \`::\`" >&2
    exit 1
fi
printf '// formatted\n' >> "$1"
"#;

/// Scripts plus a work root, both removed on drop.
pub struct Harness {
    scripts: TempDir,
    pub work_root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        setup();
        let scripts = tempfile::tempdir().unwrap();
        fs::write(scripts.path().join("fake-rustc.sh"), FAKE_RUSTC).unwrap();
        fs::write(scripts.path().join("fake-emit.sh"), FAKE_EMIT).unwrap();
        fs::write(scripts.path().join("fake-fmt.sh"), FAKE_FMT).unwrap();
        Harness {
            scripts,
            work_root: tempfile::tempdir().unwrap(),
        }
    }

    fn script(&self, name: &str) -> PathBuf {
        self.scripts.path().join(name)
    }

    pub fn toolchain_config(&self) -> ToolchainConfig {
        let rustc = format!("sh {} {{source}} {{artifact}}", self.script("fake-rustc.sh").display());
        let emit = format!("sh {} {{source}} {{artifact}}", self.script("fake-emit.sh").display());
        let fmt = format!("sh {} {{source}}", self.script("fake-fmt.sh").display());
        ToolchainConfig {
            check: rustc.parse().unwrap(),
            build: rustc.parse().unwrap(),
            asm: emit.parse().unwrap(),
            llvm_ir: emit.parse().unwrap(),
            interpret: "sh {artifact}".parse().unwrap(),
            execute: "sh {artifact}".parse().unwrap(),
            format: Some(fmt.parse().unwrap()),
            env_passthrough: vec!["PATH".into()],
            ..ToolchainConfig::default()
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            work_root: self.work_root.path().to_path_buf(),
            budget: ResourceBudget {
                wall_time: Duration::from_secs(10),
                cpu_time: Duration::from_secs(10),
                memory_bytes: 512 * 1024 * 1024,
                output_bytes: 64 * 1024,
                ..ResourceBudget::default()
            },
            ..DispatchPolicy::default()
        }
    }

    pub fn dispatcher_with(&self, policy: DispatchPolicy) -> Dispatcher {
        let toolchain = Toolchain::discover(self.toolchain_config()).unwrap();
        let runner = SandboxRunner::new(Arc::new(toolchain), Limiter::new(SandboxPolicy::default()));
        Dispatcher::new(policy, runner).unwrap()
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher_with(self.policy())
    }

    /// Dispatcher that runs one request at a time.
    pub fn single_slot(&self, queue: QueuePolicy) -> Dispatcher {
        self.dispatcher_with(DispatchPolicy {
            max_concurrent: 1,
            queue,
            ..self.policy()
        })
    }

    pub fn work_root_is_empty(&self) -> bool {
        fs::read_dir(self.work_root.path()).unwrap().next().is_none()
    }
}

/// Poll `condition` every 20 ms for up to 5 s.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
