//! Low-level wrapper around the isolate sandbox.
//!
//! Manages box initialization, command execution with resource limits,
//! output capture, and cleanup. See: https://github.com/ioi/isolate

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use super::meta::{classify, parse_meta};
use super::{Limits, RunResult};

/// One initialized isolate box.
pub struct IsolateBox {
    box_id: u32,
    box_path: String,
}

impl IsolateBox {
    /// Initialize a box, cleaning up any stale state under the same id.
    pub async fn init(box_id: u32) -> Result<Self> {
        let _ = Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--cleanup"])
            .output()
            .await;

        let output = Command::new("isolate")
            .args(["--box-id", &box_id.to_string(), "--cg", "--init"])
            .output()
            .await
            .context("failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("failed to initialize isolate box {}: {}", box_id, stderr);
        }

        let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("initialized isolate box {} at {}", box_id, box_path);

        Ok(Self { box_id, box_path })
    }

    /// Working directory for programs inside the box.
    pub fn work_dir(&self) -> String {
        format!("{}/box", self.box_path)
    }

    /// Copy a directory's files into the box's working directory.
    pub async fn copy_dir_in(&self, source_dir: &Path) -> Result<()> {
        let mut entries = fs::read_dir(source_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                continue;
            }
            let dest = format!("{}/{}", self.work_dir(), entry.file_name().to_string_lossy());
            fs::copy(entry.path(), &dest).await?;
        }
        Ok(())
    }

    /// Copy regular files out of the box's working directory.
    pub async fn copy_dir_out(&self, dest_dir: &Path) -> Result<()> {
        let mut entries = fs::read_dir(self.work_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                continue;
            }
            let dest = dest_dir.join(entry.file_name());
            fs::copy(entry.path(), &dest).await?;
        }
        Ok(())
    }

    /// Run a command in the box under the given limits.
    pub async fn run(
        &self,
        command: &[String],
        stdin: Option<&[u8]>,
        limits: &Limits,
    ) -> Result<RunResult> {
        let meta_file = format!("/tmp/isolate_meta_{}.txt", self.box_id);
        let work_dir = self.work_dir();

        let mut args = vec![
            "--box-id".to_string(),
            self.box_id.to_string(),
            "--cg".to_string(),
            format!("--cg-mem={}", limits.memory_kib),
            format!("--time={:.3}", limits.cpu_ms as f64 / 1000.0),
            format!("--wall-time={:.3}", limits.wall_ms as f64 / 1000.0),
            format!("--processes={}", limits.processes),
            format!("--fsize={}", limits.fsize_kib),
            format!("--meta={}", meta_file),
            "--stdout=stdout.txt".to_string(),
            "--stderr=stderr.txt".to_string(),
            "--open-files=256".to_string(),
            // runtimes and compilers live outside the box
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64".to_string(),
            "--dir=/etc:noexec".to_string(),
            "--dir=/tmp:tmp".to_string(),
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
        ];

        if let Some(data) = stdin {
            fs::write(format!("{}/stdin.txt", work_dir), data).await?;
            args.push("--stdin=stdin.txt".to_string());
        }

        args.push("--run".to_string());
        args.push("--".to_string());

        // bare command names resolve against /usr/bin inside the box
        let mut cmd_iter = command.iter();
        if let Some(cmd) = cmd_iter.next() {
            if cmd.starts_with('/') || cmd.starts_with("./") {
                args.push(cmd.clone());
            } else {
                args.push(format!("/usr/bin/{}", cmd));
            }
            args.extend(cmd_iter.cloned());
        }

        debug!("running isolate with args: {:?}", args);

        let _output = Command::new("isolate")
            .args(&args)
            .output()
            .await
            .context("failed to run isolate")?;

        let meta_content = fs::read_to_string(&meta_file).await.unwrap_or_default();
        let meta = parse_meta(&meta_content);
        let _ = fs::remove_file(&meta_file).await;

        let stdout = read_capped(&format!("{}/stdout.txt", work_dir), limits.stdout_cap).await;
        let stderr = read_capped(&format!("{}/stderr.txt", work_dir), limits.stderr_cap).await;

        let kill_reason = classify(&meta, limits);

        Ok(RunResult {
            exit_code: meta.exit_code,
            signal: meta.signal,
            cpu_ms: meta.cpu_ms,
            wall_ms: meta.wall_ms,
            peak_mem_kib: meta.peak_mem_kib,
            stdout,
            stderr,
            kill_reason,
        })
    }

    /// Tear the box down. Safe to call on every exit path.
    pub async fn cleanup(&self) -> Result<()> {
        Command::new("isolate")
            .args(["--box-id", &self.box_id.to_string(), "--cleanup"])
            .output()
            .await?;
        debug!("cleaned up isolate box {}", self.box_id);
        Ok(())
    }
}

/// Read a captured stream, truncating at `cap` bytes with a tail marker.
async fn read_capped(path: &str, cap: usize) -> String {
    let bytes = fs::read(path).await.unwrap_or_default();
    truncate_tail(bytes, cap)
}

pub(crate) fn truncate_tail(mut bytes: Vec<u8>, cap: usize) -> String {
    if bytes.len() > cap {
        bytes.truncate(cap);
        let mut s = String::from_utf8_lossy(&bytes).into_owned();
        s.push_str("\n... [truncated]");
        s
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
