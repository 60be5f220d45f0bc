//! Judge engine: drives a single submission through compile, per-test
//! execution, and output comparison.
//!
//! The engine maps sandbox outcomes into verdicts; its own failures are
//! classified so the dispatcher can tell unretryable content problems
//! from transient infrastructure trouble. It never touches scores.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::comparator;
use crate::languages::{LanguageSpec, LanguageTable};
use crate::problems::ProblemPackage;
use crate::sandbox::{ExecSpec, KillReason, Limits, Sandbox};
use crate::store::{ProblemRow, Submission};
use crate::verdict::Verdict;

/// Size of the stdout/stderr tails persisted with each test result.
const STORED_TAIL_CHARS: usize = 4096;

/// Judge-engine failure, classified for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum JudgeFault {
    /// Broken problem content (missing files, malformed manifest,
    /// unsupported language). Not retried.
    #[error("problem content: {0}")]
    Content(String),
    /// Transient infrastructure failure; eligible for retry.
    #[error("transient: {0}")]
    Transient(String),
    /// Internal error with no retry value (watchdog, invariant breach).
    #[error("internal: {0}")]
    Internal(String),
}

/// Bounded per-test result, persisted as part of the submission row.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub index: usize,
    pub verdict: Verdict,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub memory_kib: u64,
    pub stdout: String,
    pub stderr: String,
    pub kill_reason: Option<&'static str>,
}

/// Aggregated result of judging one submission.
#[derive(Debug)]
pub struct JudgeOutcome {
    pub verdict: Verdict,
    pub tests: Vec<TestRecord>,
    /// Max cpu over executed tests, ms
    pub execution_time_ms: i64,
    /// Max peak memory over executed tests, KiB
    pub memory_kib: i64,
    pub compile_output: Option<String>,
    /// Base point value from the manifest, for the acceptance snapshot
    pub base_points: f64,
}

pub struct JudgeEngine {
    sandbox: Sandbox,
    languages: Arc<LanguageTable>,
    problem_root: PathBuf,
    compile_cpu_ms: u64,
    compile_mem_kib: u64,
}

impl JudgeEngine {
    pub fn new(
        sandbox: Sandbox,
        languages: Arc<LanguageTable>,
        problem_root: PathBuf,
        compile_cpu_ms: u64,
        compile_mem_kib: u64,
    ) -> Self {
        Self {
            sandbox,
            languages,
            problem_root,
            compile_cpu_ms,
            compile_mem_kib,
        }
    }

    /// Judge one leased submission.
    pub async fn judge(
        &self,
        submission: &Submission,
        problem: &ProblemRow,
    ) -> Result<JudgeOutcome, JudgeFault> {
        if !problem.is_approved() {
            return Err(JudgeFault::Content(format!(
                "problem {} is not approved",
                problem.id
            )));
        }

        let package = ProblemPackage::load(&self.problem_root, &problem.data_path)
            .map_err(|e| JudgeFault::Content(format!("{:#}", e)))?;

        let lang = self
            .languages
            .resolve(&submission.language)
            .ok_or_else(|| {
                JudgeFault::Content(format!("unsupported language: {}", submission.language))
            })?;

        if !package.manifest.allows_language(lang.tag()) {
            return Err(JudgeFault::Content(format!(
                "language {} not allowed for problem {}",
                lang, package.manifest.id
            )));
        }

        let spec = self.languages.spec(lang).clone();

        let workspace = tempfile::tempdir()
            .map_err(|e| JudgeFault::Transient(format!("workspace setup failed: {}", e)))?;
        std::fs::write(workspace.path().join(&spec.source_file), &submission.source_code)
            .map_err(|e| JudgeFault::Transient(format!("source write failed: {}", e)))?;

        // outer bound on total judging time, over and above the per-test caps
        let budget_ms = 3 * package.manifest.wall_cap_ms() * package.manifest.tests.len() as u64
            + self.compile_cpu_ms;

        let outcome = timeout(
            Duration::from_millis(budget_ms),
            self.compile_and_run(workspace.path(), &package, &spec),
        )
        .await
        .map_err(|_| JudgeFault::Internal("judging watchdog expired".to_string()))??;

        info!(
            submission_id = submission.id,
            verdict = %outcome.verdict,
            cpu_ms = outcome.execution_time_ms,
            mem_kib = outcome.memory_kib,
            "judged"
        );

        Ok(outcome)
    }

    async fn compile_and_run(
        &self,
        workspace: &std::path::Path,
        package: &ProblemPackage,
        lang: &LanguageSpec,
    ) -> Result<JudgeOutcome, JudgeFault> {
        let base_points = package.manifest.base_points;

        if let Some(compile_cmd) = &lang.compile_command {
            if let Some(output) = self.compile(workspace, compile_cmd).await? {
                // compile error short-circuits the whole pipeline
                return Ok(JudgeOutcome {
                    verdict: Verdict::Ce,
                    tests: vec![],
                    execution_time_ms: 0,
                    memory_kib: 0,
                    compile_output: Some(output),
                    base_points,
                });
            }
        }

        let run_limits = Limits {
            cpu_ms: lang.run_cpu_ms(package.manifest.time_limit_ms),
            wall_ms: package.manifest.wall_cap_ms(),
            memory_kib: lang.run_mem_kib(package.manifest.memory_limit_kib),
            stdout_cap: package.manifest.stdout_cap_bytes,
            stderr_cap: STORED_TAIL_CHARS,
            ..Limits::default()
        };

        let mut tests = Vec::with_capacity(package.manifest.tests.len());
        let mut overall = Verdict::Ac;
        let mut max_cpu: u64 = 0;
        let mut max_mem: u64 = 0;

        for (index, test) in package.manifest.tests.iter().enumerate() {
            let (input, expected) = package
                .read_test(test)
                .map_err(|e| JudgeFault::Content(format!("{:#}", e)))?;

            let spec = ExecSpec::new(workspace)
                .with_command(lang.run_command.clone())
                .with_stdin(input.clone())
                .with_limits(run_limits.clone());

            let result = self
                .sandbox
                .execute(&spec)
                .await
                .map_err(|e| JudgeFault::Transient(format!("sandbox run failed: {:#}", e)))?;

            if result.kill_reason == KillReason::Internal {
                return Err(JudgeFault::Transient("sandbox internal error".to_string()));
            }

            max_cpu = max_cpu.max(result.cpu_ms);
            max_mem = max_mem.max(result.peak_mem_kib);

            let verdict = match result.kill_reason {
                KillReason::Cpu | KillReason::Wall => Verdict::Tle,
                KillReason::Memory => Verdict::Mle,
                KillReason::Signal => Verdict::Re,
                KillReason::Internal => unreachable!("handled above"),
                KillReason::None if result.exit_code != 0 => Verdict::Re,
                KillReason::None => {
                    self.check_output(package, &input, &expected, &result.stdout)
                        .await?
                }
            };

            debug!(index, verdict = %verdict, cpu_ms = result.cpu_ms, "test finished");

            tests.push(TestRecord {
                index,
                verdict,
                cpu_ms: result.cpu_ms,
                wall_ms: result.wall_ms,
                memory_kib: result.peak_mem_kib,
                stdout: clip(&result.stdout),
                stderr: clip(&result.stderr),
                kill_reason: result.kill_reason.code(),
            });

            if verdict != Verdict::Ac {
                // first failure decides; remaining tests are not executed
                overall = verdict;
                break;
            }
        }

        Ok(JudgeOutcome {
            verdict: overall,
            tests,
            execution_time_ms: max_cpu as i64,
            memory_kib: max_mem as i64,
            compile_output: None,
            base_points,
        })
    }

    /// Compile once; `Some(diagnostics)` means compilation failed.
    async fn compile(
        &self,
        workspace: &std::path::Path,
        compile_cmd: &[String],
    ) -> Result<Option<String>, JudgeFault> {
        let limits = Limits {
            cpu_ms: self.compile_cpu_ms,
            wall_ms: self.compile_cpu_ms * 2 + 5000,
            memory_kib: self.compile_mem_kib,
            processes: 128,
            ..Limits::default()
        };

        let spec = ExecSpec::new(workspace)
            .with_command(compile_cmd.to_vec())
            .with_limits(limits)
            .with_copy_out(workspace);

        let result = self
            .sandbox
            .execute(&spec)
            .await
            .map_err(|e| JudgeFault::Transient(format!("sandbox compile failed: {:#}", e)))?;

        if result.kill_reason == KillReason::Internal {
            return Err(JudgeFault::Transient(
                "sandbox internal error during compile".to_string(),
            ));
        }

        if result.is_clean_exit() {
            return Ok(None);
        }

        let diagnostics = if !result.stderr.is_empty() {
            result.stderr
        } else if !result.stdout.is_empty() {
            result.stdout
        } else {
            match result.kill_reason {
                KillReason::Cpu | KillReason::Wall => "compilation timed out".to_string(),
                KillReason::Memory => "compiler exceeded its memory cap".to_string(),
                KillReason::Signal => "compiler crashed".to_string(),
                _ => format!("compilation failed with exit code {}", result.exit_code),
            }
        };

        Ok(Some(clip(&diagnostics)))
    }

    async fn check_output(
        &self,
        package: &ProblemPackage,
        input: &[u8],
        expected: &[u8],
        actual: &str,
    ) -> Result<Verdict, JudgeFault> {
        if let Some(checker) = package.checker_path() {
            let accepted = comparator::run_checker(
                &self.sandbox,
                &checker,
                input,
                expected,
                actual.as_bytes(),
            )
            .await
            .map_err(|e| JudgeFault::Content(format!("checker failed: {:#}", e)))?;

            Ok(if accepted { Verdict::Ac } else { Verdict::Wa })
        } else if comparator::outputs_match(actual.as_bytes(), expected) {
            Ok(Verdict::Ac)
        } else {
            Ok(Verdict::Wa)
        }
    }
}

fn clip(s: &str) -> String {
    if s.chars().count() > STORED_TAIL_CHARS {
        let mut clipped: String = s.chars().take(STORED_TAIL_CHARS).collect();
        clipped.push_str("\n... [truncated]");
        clipped
    } else {
        s.to_string()
    }
}
