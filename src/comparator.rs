//! Output comparison.
//!
//! Default policy: lossy UTF-8 decode, trim trailing whitespace on each
//! line, drop trailing blank lines, then compare. A problem may replace
//! this with a custom checker program, which itself runs under a sandbox
//! invocation.

use std::path::Path;

use anyhow::{Context, Result};

use crate::sandbox::{ExecSpec, KillReason, Limits, Sandbox};

/// Trailing-whitespace-tolerant equality of expected vs. actual output.
pub fn outputs_match(actual: &[u8], expected: &[u8]) -> bool {
    normalize(actual) == normalize(expected)
}

fn normalize(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<String> = text.lines().map(|l| l.trim_end().to_string()).collect();
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines
}

/// Checker resource caps; generous relative to problem caps.
fn checker_limits() -> Limits {
    Limits {
        cpu_ms: 10_000,
        wall_ms: 21_000,
        memory_kib: 524_288,
        ..Limits::default()
    }
}

/// Run a custom checker against one test.
///
/// The checker receives `input.txt expected.txt actual.txt` inside its
/// workspace; exit 0 accepts, exit 1 rejects, anything else is a checker
/// failure.
pub async fn run_checker(
    sandbox: &Sandbox,
    checker_path: &Path,
    input: &[u8],
    expected: &[u8],
    actual: &[u8],
) -> Result<bool> {
    let workspace = tempfile::tempdir().context("failed to create checker workspace")?;

    let checker_name = checker_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("checker path has no file name")?;

    std::fs::copy(checker_path, workspace.path().join(checker_name))
        .with_context(|| format!("missing checker {:?}", checker_path))?;
    std::fs::write(workspace.path().join("input.txt"), input)?;
    std::fs::write(workspace.path().join("expected.txt"), expected)?;
    std::fs::write(workspace.path().join("actual.txt"), actual)?;

    let spec = ExecSpec::new(workspace.path())
        .with_command([
            format!("./{}", checker_name),
            "input.txt".to_string(),
            "expected.txt".to_string(),
            "actual.txt".to_string(),
        ])
        .with_limits(checker_limits());

    let result = sandbox.execute(&spec).await.context("checker run failed")?;

    if result.kill_reason != KillReason::None {
        anyhow::bail!(
            "checker killed: {}",
            result.kill_reason.code().unwrap_or("unknown")
        );
    }

    match result.exit_code {
        0 => Ok(true),
        1 => Ok(false),
        code => anyhow::bail!("checker exited with unexpected code {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(outputs_match(b"hello\nworld\n", b"hello\nworld\n"));
    }

    #[test]
    fn test_trailing_whitespace_tolerated() {
        assert!(outputs_match(b"hello  \nworld\t\n", b"hello\nworld\n"));
    }

    #[test]
    fn test_trailing_blank_lines_tolerated() {
        assert!(outputs_match(b"hello\nworld\n\n\n", b"hello\nworld"));
    }

    #[test]
    fn test_interior_whitespace_matters() {
        assert!(!outputs_match(b"hello world\n", b"hello  world\n"));
    }

    #[test]
    fn test_different_output_rejected() {
        assert!(!outputs_match(b"8\n", b"7\n"));
    }

    #[test]
    fn test_empty_against_blank_lines() {
        assert!(outputs_match(b"", b"\n\n"));
    }

    #[test]
    fn test_invalid_utf8_compares_bytewise_after_decode() {
        assert!(outputs_match(&[0xff, b'\n'], &[0xff, b'\n']));
        assert!(!outputs_match(&[0xff], b"x"));
    }
}
