//! Sandboxed execution of untrusted programs.
//!
//! Children run inside isolate boxes with their own filesystem view and
//! enforced cpu/wall/memory/process/file-size caps. Box ids come from a
//! bounded free-list; the workspace is torn down on every exit path.

mod isolate_box;
pub mod meta;
mod pool;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::process::Command;

use isolate_box::IsolateBox;
pub use meta::KillReason;
use pool::BoxPool;

/// Resource limits for one sandboxed run.
#[derive(Debug, Clone)]
pub struct Limits {
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub memory_kib: u64,
    /// Captured stdout cap, bytes
    pub stdout_cap: usize,
    /// Captured stderr cap, bytes
    pub stderr_cap: usize,
    /// Largest file the child may create, KiB
    pub fsize_kib: u64,
    /// Max simultaneous processes in the child tree
    pub processes: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cpu_ms: 1000,
            wall_ms: 3000,
            memory_kib: 262_144,
            stdout_cap: 65_536,
            stderr_cap: 65_536,
            fsize_kib: 262_144,
            processes: 64,
        }
    }
}

/// Raw outcome of a sandboxed run.
#[derive(Debug)]
pub struct RunResult {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub peak_mem_kib: u64,
    pub stdout: String,
    pub stderr: String,
    pub kill_reason: KillReason,
}

impl RunResult {
    pub fn is_clean_exit(&self) -> bool {
        self.kill_reason == KillReason::None && self.exit_code == 0
    }
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Host directory whose files are copied into the box before the run
    pub workspace: PathBuf,
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub limits: Limits,
    /// Host directory to copy box files back into after the run
    pub copy_out: Option<PathBuf>,
}

impl ExecSpec {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            command: vec![],
            stdin: None,
            limits: Limits::default(),
            copy_out: None,
        }
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_copy_out(mut self, dir: impl Into<PathBuf>) -> Self {
        self.copy_out = Some(dir.into());
        self
    }
}

/// Sandbox facade over the box pool.
#[derive(Clone)]
pub struct Sandbox {
    pool: BoxPool,
}

impl Sandbox {
    pub fn new(boxes: u32) -> Self {
        Self {
            pool: BoxPool::new(boxes),
        }
    }

    /// Verify that isolate with cgroup support is usable on this host.
    pub async fn probe() -> Result<()> {
        let version = Command::new("isolate")
            .arg("--version")
            .output()
            .await
            .context("isolate binary not found")?;
        if !version.status.success() {
            anyhow::bail!("isolate --version failed");
        }

        // a full init/cleanup round-trip proves cgroup support
        let probe_box = IsolateBox::init(999)
            .await
            .context("isolate cgroup support unavailable")?;
        probe_box.cleanup().await?;
        Ok(())
    }

    /// Execute a command in a freshly initialized box.
    ///
    /// The box and its workspace are released on every path out of this
    /// function, including errors.
    pub async fn execute(&self, spec: &ExecSpec) -> Result<RunResult> {
        if spec.command.is_empty() {
            anyhow::bail!("no command specified for execution");
        }

        let lease = self.pool.acquire().await?;
        let sandbox_box = IsolateBox::init(lease.id()).await?;

        let result = self.execute_in_box(&sandbox_box, spec).await;

        // unconditional teardown; the lease drop returns the box id
        let _ = sandbox_box.cleanup().await;
        drop(lease);

        result
    }

    async fn execute_in_box(&self, sandbox_box: &IsolateBox, spec: &ExecSpec) -> Result<RunResult> {
        sandbox_box.copy_dir_in(&spec.workspace).await?;

        let result = sandbox_box
            .run(&spec.command, spec.stdin.as_deref(), &spec.limits)
            .await?;

        if let Some(copy_out) = &spec.copy_out {
            sandbox_box.copy_dir_out(copy_out).await?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_spec_builder() {
        let spec = ExecSpec::new("/tmp/work")
            .with_command(["./main"])
            .with_stdin("1 2\n")
            .with_limits(Limits {
                cpu_ms: 500,
                ..Limits::default()
            });

        assert_eq!(spec.command, vec!["./main".to_string()]);
        assert_eq!(spec.stdin.as_deref(), Some(b"1 2\n".as_slice()));
        assert_eq!(spec.limits.cpu_ms, 500);
        assert!(spec.copy_out.is_none());
    }

    #[test]
    fn test_clean_exit_requires_no_kill() {
        let ok = RunResult {
            exit_code: 0,
            signal: None,
            cpu_ms: 10,
            wall_ms: 12,
            peak_mem_kib: 100,
            stdout: String::new(),
            stderr: String::new(),
            kill_reason: KillReason::None,
        };
        assert!(ok.is_clean_exit());

        let killed = RunResult {
            kill_reason: KillReason::Cpu,
            ..ok
        };
        assert!(!killed.is_clean_exit());
    }
}
