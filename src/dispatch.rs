//! Job dispatcher: a bounded pool of workers draining the submission
//! queue, plus a reaper that recovers abandoned leases.
//!
//! Workers lease one pending submission at a time, judge it, and commit
//! the verdict transactionally. Judging failures are classified: content
//! and internal errors finalize as IE, transient errors hand the lease
//! back for another attempt until the ceiling is reached.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::judge::{JudgeEngine, JudgeFault};
use crate::store::{now_ms, CommitOutcome, ScoringParams, Store, Submission, VerdictRecord};
use crate::verdict::Verdict;

pub struct Dispatcher {
    store: Store,
    engine: Arc<JudgeEngine>,
    workers: u32,
    poll_ms: u64,
    lease_ms: i64,
    max_attempts: i64,
    points_alpha: f64,
    points_min: f64,
}

impl Dispatcher {
    pub fn new(store: Store, engine: Arc<JudgeEngine>, config: &Config) -> Self {
        Self {
            store,
            engine,
            workers: config.workers,
            poll_ms: config.poll_ms,
            lease_ms: config.max_lease_ms as i64,
            max_attempts: config.max_attempts,
            points_alpha: config.points_alpha,
            points_min: config.points_min,
        }
    }

    /// Run the worker pool and the reaper until shutdown is signalled.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut handles = Vec::with_capacity(self.workers as usize + 1);

        for idx in 0..self.workers {
            let dispatcher = Arc::clone(&self);
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(idx, rx).await;
            }));
        }

        {
            let dispatcher = Arc::clone(&self);
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.reaper_loop(rx).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn worker_loop(&self, idx: u32, mut shutdown: watch::Receiver<bool>) {
        let worker = format!("worker-{}", idx);
        info!(worker, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.store.lease_next(&worker, now_ms(), self.lease_ms).await {
                Ok(Some(submission)) => {
                    self.process(&worker, submission).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = sleep(Duration::from_millis(self.poll_ms)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!(worker, "lease failed: {:#}", e);
                    tokio::select! {
                        _ = sleep(Duration::from_millis(self.poll_ms)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(worker, "worker stopped");
    }

    async fn process(&self, worker: &str, submission: Submission) {
        info!(
            worker,
            submission_id = submission.id,
            problem_id = submission.problem_id,
            language = %submission.language,
            attempt = submission.attempts,
            "judging"
        );

        let problem = match self.store.get_problem(submission.problem_id).await {
            Ok(Some(problem)) => problem,
            Ok(None) => {
                self.finalize_internal_error(
                    submission.id,
                    format!("unknown problem {}", submission.problem_id),
                )
                .await;
                return;
            }
            Err(e) => {
                warn!(worker, submission_id = submission.id, "problem load failed: {:#}", e);
                let _ = self.store.release_lease(submission.id).await;
                return;
            }
        };

        match self.engine.judge(&submission, &problem).await {
            Ok(outcome) => {
                let record = VerdictRecord {
                    verdict: outcome.verdict,
                    judged_at: now_ms(),
                    execution_time_ms: Some(outcome.execution_time_ms),
                    memory_kib: Some(outcome.memory_kib),
                    test_results: serde_json::to_string(&outcome.tests).ok(),
                    compile_output: outcome.compile_output,
                    error_message: None,
                };
                let scoring = ScoringParams {
                    base_points: outcome.base_points,
                    alpha: self.points_alpha,
                    floor: self.points_min,
                };

                match self
                    .store
                    .commit_verdict(submission.id, &record, Some(&scoring))
                    .await
                {
                    Ok(CommitOutcome::Committed { verdict, points }) => {
                        info!(
                            worker,
                            submission_id = submission.id,
                            verdict = %verdict,
                            points = points.unwrap_or(0.0),
                            "verdict committed"
                        );
                    }
                    Ok(CommitOutcome::Skipped) => {
                        warn!(
                            worker,
                            submission_id = submission.id,
                            "verdict already terminal, commit skipped"
                        );
                    }
                    Err(e) => {
                        error!(
                            worker,
                            submission_id = submission.id,
                            "verdict commit failed: {:#}",
                            e
                        );
                    }
                }
            }
            Err(JudgeFault::Transient(message)) => {
                if submission.attempts >= self.max_attempts {
                    self.finalize_internal_error(
                        submission.id,
                        format!("attempts exhausted: {}", message),
                    )
                    .await;
                } else {
                    warn!(
                        worker,
                        submission_id = submission.id,
                        attempt = submission.attempts,
                        "transient judge failure, requeueing: {}",
                        message
                    );
                    let _ = self.store.release_lease(submission.id).await;
                }
            }
            Err(fault @ (JudgeFault::Content(_) | JudgeFault::Internal(_))) => {
                self.finalize_internal_error(submission.id, fault.to_string())
                    .await;
            }
        }
    }

    async fn finalize_internal_error(&self, submission_id: i64, message: String) {
        warn!(submission_id, "finalizing as internal error: {}", message);

        let mut record = VerdictRecord::new(Verdict::Ie, now_ms());
        record.error_message = Some(message);

        if let Err(e) = self.store.commit_verdict(submission_id, &record, None).await {
            error!(submission_id, "failed to record internal error: {:#}", e);
        }
    }

    async fn reaper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis((self.lease_ms as u64 / 2).max(1000));

        loop {
            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self
                .store
                .reap_expired(now_ms(), self.lease_ms, self.max_attempts)
                .await
            {
                Ok(summary) if summary.rewound > 0 || summary.poisoned > 0 => {
                    warn!(
                        rewound = summary.rewound,
                        poisoned = summary.poisoned,
                        "recovered expired leases"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("lease reap failed: {:#}", e),
            }
        }
    }
}
