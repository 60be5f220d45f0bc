//! Durable store: submission queue, verdicts, scores, and the block ledger.
//!
//! SQLite is the single source of truth. Workers claim pending submissions
//! with a compare-and-swap lease; verdict finalization, score crediting,
//! and block commits each happen in one transaction. All timestamps are
//! unix milliseconds.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::scoring;
use crate::verdict::Verdict;

const SCHEMA: &str = include_str!("schema.sql");

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A submission row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Submission {
    pub id: i64,
    pub user_id: i64,
    pub problem_id: i64,
    pub source_code: String,
    pub language: String,
    pub verdict: Verdict,
    pub submitted_at: i64,
    pub judged_at: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub memory_kib: Option<i64>,
    pub points_earned: Option<f64>,
    pub test_results: Option<String>,
    pub compile_output: Option<String>,
    pub error_message: Option<String>,
    pub block_id: Option<i64>,
    pub tx_hash: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub attempts: i64,
    pub cancelled: i64,
}

/// Problem registry row; limits and tests live in the on-disk package.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProblemRow {
    pub id: i64,
    pub title_en: String,
    pub title_es: String,
    pub difficulty: String,
    pub base_points: f64,
    pub status: String,
    pub data_path: String,
    pub created_at: i64,
}

impl ProblemRow {
    pub fn is_approved(&self) -> bool {
        self.status == "approved"
    }
}

/// A committed block.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BlockRow {
    pub id: i64,
    pub height: i64,
    pub block_hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub tx_count: i64,
    pub total_points: f64,
    pub miner_user_id: Option<i64>,
    pub btc_anchor: Option<String>,
}

/// Materialized per-user aggregate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserScore {
    pub user_id: i64,
    pub total_points: f64,
    pub blocks_mined: i64,
}

/// Everything the judge produced for one submission.
#[derive(Debug, Clone)]
pub struct VerdictRecord {
    pub verdict: Verdict,
    pub judged_at: i64,
    pub execution_time_ms: Option<i64>,
    pub memory_kib: Option<i64>,
    pub test_results: Option<String>,
    pub compile_output: Option<String>,
    pub error_message: Option<String>,
}

impl VerdictRecord {
    pub fn new(verdict: Verdict, judged_at: i64) -> Self {
        Self {
            verdict,
            judged_at,
            execution_time_ms: None,
            memory_kib: None,
            test_results: None,
            compile_output: None,
            error_message: None,
        }
    }
}

/// Inputs for the accepted-points snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ScoringParams {
    pub base_points: f64,
    pub alpha: f64,
    pub floor: f64,
}

/// Result of a verdict commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        verdict: Verdict,
        points: Option<f64>,
    },
    /// The row was already terminal (or gone); nothing changed.
    Skipped,
}

/// New block fields prior to insertion.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub height: i64,
    pub block_hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub tx_count: i64,
    pub total_points: f64,
    pub miner_user_id: Option<i64>,
    pub btc_anchor: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReapSummary {
    pub rewound: u64,
    pub poisoned: u64,
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect to the store and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("failed to connect to store")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests; a single connection keeps it coherent.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory store")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    // ---- submission intake & readback (external contract) ----

    pub async fn insert_submission(
        &self,
        user_id: i64,
        problem_id: i64,
        source_code: &str,
        language: &str,
        submitted_at: i64,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO submissions (user_id, problem_id, source_code, language, submitted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
        )
        .bind(user_id)
        .bind(problem_id)
        .bind(source_code)
        .bind(language)
        .bind(submitted_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn get_submission(&self, id: i64) -> Result<Option<Submission>> {
        let row = sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Flag a submission as cancelled. Rows not yet leased are skipped by
    /// the dispatcher; rows already being judged finalize as IE.
    pub async fn cancel_submission(&self, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE submissions SET cancelled = 1 WHERE id = ?1 AND verdict = 'PENDING'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    // ---- problem registry ----

    pub async fn get_problem(&self, id: i64) -> Result<Option<ProblemRow>> {
        let row = sqlx::query_as::<_, ProblemRow>("SELECT * FROM problems WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Upsert a problem registry row (normally done by the review layer).
    pub async fn register_problem(
        &self,
        id: i64,
        title_en: &str,
        difficulty: &str,
        base_points: f64,
        status: &str,
        data_path: &str,
        created_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO problems (id, title_en, difficulty, base_points, status, data_path, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (id) DO UPDATE SET \
               title_en = excluded.title_en, difficulty = excluded.difficulty, \
               base_points = excluded.base_points, status = excluded.status, \
               data_path = excluded.data_path",
        )
        .bind(id)
        .bind(title_en)
        .bind(difficulty)
        .bind(base_points)
        .bind(status)
        .bind(data_path)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- dispatcher queue ----

    /// Claim the next eligible pending submission.
    ///
    /// Within one `(user, problem)` pair only the oldest pending row is
    /// eligible, and never while another row of the same pair holds an
    /// active lease; this yields per-pair FIFO judging.
    pub async fn lease_next(
        &self,
        worker: &str,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<Submission>> {
        let cutoff = now_ms - lease_ms;

        let row = sqlx::query_as::<_, Submission>(
            "UPDATE submissions SET claimed_by = ?1, claimed_at = ?2, attempts = attempts + 1 \
             WHERE id = ( \
               SELECT s.id FROM submissions s \
               WHERE s.verdict = 'PENDING' \
                 AND s.cancelled = 0 \
                 AND (s.claimed_by IS NULL OR s.claimed_at <= ?3) \
                 AND NOT EXISTS ( \
                   SELECT 1 FROM submissions p \
                   WHERE p.user_id = s.user_id \
                     AND p.problem_id = s.problem_id \
                     AND p.id <> s.id \
                     AND p.verdict = 'PENDING' \
                     AND ( \
                       (p.claimed_by IS NOT NULL AND p.claimed_at > ?3) \
                       OR p.submitted_at < s.submitted_at \
                       OR (p.submitted_at = s.submitted_at AND p.id < s.id) \
                     ) \
                 ) \
               ORDER BY s.submitted_at, s.id \
               LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(worker)
        .bind(now_ms)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Hand a leased row back to the queue (transient failure path).
    pub async fn release_lease(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE submissions SET claimed_by = NULL, claimed_at = NULL \
             WHERE id = ?1 AND verdict = 'PENDING'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Finalize a submission's verdict; at-most-once by construction.
    ///
    /// For an accepted submission the current problem point value is
    /// snapshotted and the owner's score incremented in the same
    /// transaction. A row cancelled mid-judging finalizes as IE and never
    /// touches scores.
    pub async fn commit_verdict(
        &self,
        id: i64,
        record: &VerdictRecord,
        scoring: Option<&ScoringParams>,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT verdict, cancelled, user_id, problem_id FROM submissions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((current, cancelled, user_id, problem_id)) = row else {
            return Ok(CommitOutcome::Skipped);
        };
        let current: Verdict = current.parse()?;
        if current.is_terminal() {
            return Ok(CommitOutcome::Skipped);
        }

        let was_cancelled = cancelled != 0;
        let effective = if was_cancelled {
            Verdict::Ie
        } else {
            record.verdict
        };
        let error_message = if was_cancelled {
            Some("cancelled during judging".to_string())
        } else {
            record.error_message.clone()
        };

        let mut points: Option<f64> = None;
        if effective == Verdict::Ac {
            if let Some(params) = scoring {
                let solvers: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM problem_solves WHERE problem_id = ?1")
                        .bind(problem_id)
                        .fetch_one(&mut *tx)
                        .await?;

                let earned = scoring::problem_points(
                    params.base_points,
                    solvers as u64,
                    params.alpha,
                    params.floor,
                );
                points = Some(earned);

                sqlx::query(
                    "INSERT INTO problem_solves (problem_id, user_id, first_ac_at) \
                     VALUES (?1, ?2, ?3) ON CONFLICT (problem_id, user_id) DO NOTHING",
                )
                .bind(problem_id)
                .bind(user_id)
                .bind(record.judged_at)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO user_scores (user_id, total_points, blocks_mined) \
                     VALUES (?1, ?2, 0) \
                     ON CONFLICT (user_id) DO UPDATE SET \
                       total_points = user_scores.total_points + excluded.total_points",
                )
                .bind(user_id)
                .bind(earned)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            "UPDATE submissions SET \
               verdict = ?2, judged_at = ?3, execution_time_ms = ?4, memory_kib = ?5, \
               points_earned = ?6, test_results = ?7, compile_output = ?8, \
               error_message = ?9, claimed_by = NULL, claimed_at = NULL \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(effective)
        .bind(record.judged_at)
        .bind(record.execution_time_ms)
        .bind(record.memory_kib)
        .bind(points)
        .bind(record.test_results.as_deref())
        .bind(record.compile_output.as_deref())
        .bind(error_message.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CommitOutcome::Committed {
            verdict: effective,
            points,
        })
    }

    /// Rewind expired leases; poison rows that have exhausted their
    /// attempts.
    pub async fn reap_expired(
        &self,
        now_ms: i64,
        lease_ms: i64,
        max_attempts: i64,
    ) -> Result<ReapSummary> {
        let cutoff = now_ms - lease_ms;
        let mut tx = self.pool.begin().await?;

        let poisoned = sqlx::query(
            "UPDATE submissions SET \
               verdict = 'IE', judged_at = ?1, \
               error_message = 'judging attempts exhausted', \
               claimed_by = NULL, claimed_at = NULL \
             WHERE verdict = 'PENDING' AND claimed_by IS NOT NULL \
               AND claimed_at <= ?2 AND attempts >= ?3",
        )
        .bind(now_ms)
        .bind(cutoff)
        .bind(max_attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let rewound = sqlx::query(
            "UPDATE submissions SET claimed_by = NULL, claimed_at = NULL \
             WHERE verdict = 'PENDING' AND claimed_by IS NOT NULL AND claimed_at <= ?1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(ReapSummary { rewound, poisoned })
    }

    // ---- mempool & ledger ----

    /// Accepted submissions not yet folded into a block, oldest first.
    pub async fn mempool(&self) -> Result<Vec<Submission>> {
        let rows = sqlx::query_as::<_, Submission>(
            "SELECT * FROM submissions WHERE verdict = 'AC' AND block_id IS NULL \
             ORDER BY submitted_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn latest_block(&self) -> Result<Option<BlockRow>> {
        let row =
            sqlx::query_as::<_, BlockRow>("SELECT * FROM blocks ORDER BY height DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn block_by_height(&self, height: i64) -> Result<Option<BlockRow>> {
        let row = sqlx::query_as::<_, BlockRow>("SELECT * FROM blocks WHERE height = ?1")
            .bind(height)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn block_by_id(&self, id: i64) -> Result<Option<BlockRow>> {
        let row = sqlx::query_as::<_, BlockRow>("SELECT * FROM blocks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn blocks_in_range(&self, from_height: i64, to_height: i64) -> Result<Vec<BlockRow>> {
        let rows = sqlx::query_as::<_, BlockRow>(
            "SELECT * FROM blocks WHERE height BETWEEN ?1 AND ?2 ORDER BY height",
        )
        .bind(from_height)
        .bind(to_height)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Insert a block and fold its transactions, atomically.
    ///
    /// Fails (and rolls back) if any submission is no longer eligible, so
    /// no submission can land in two blocks.
    pub async fn commit_block(
        &self,
        block: &NewBlock,
        txs: &[(i64, String)],
    ) -> Result<BlockRow> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, BlockRow>(
            "INSERT INTO blocks \
               (height, block_hash, parent_hash, timestamp, tx_count, total_points, \
                miner_user_id, btc_anchor) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) RETURNING *",
        )
        .bind(block.height)
        .bind(&block.block_hash)
        .bind(&block.parent_hash)
        .bind(block.timestamp)
        .bind(block.tx_count)
        .bind(block.total_points)
        .bind(block.miner_user_id)
        .bind(block.btc_anchor.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        for (submission_id, tx_hash) in txs {
            let updated = sqlx::query(
                "UPDATE submissions SET block_id = ?1, tx_hash = ?2 \
                 WHERE id = ?3 AND verdict = 'AC' AND block_id IS NULL",
            )
            .bind(row.id)
            .bind(tx_hash)
            .bind(submission_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated != 1 {
                anyhow::bail!(
                    "submission {} no longer eligible for block {}",
                    submission_id,
                    block.height
                );
            }
        }

        if let Some(miner) = block.miner_user_id {
            sqlx::query(
                "INSERT INTO user_scores (user_id, total_points, blocks_mined) \
                 VALUES (?1, 0, 1) \
                 ON CONFLICT (user_id) DO UPDATE SET \
                   blocks_mined = user_scores.blocks_mined + 1",
            )
            .bind(miner)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row)
    }

    /// Try to take (or keep) the single-writer mining lease.
    pub async fn try_acquire_miner_lease(
        &self,
        holder: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO miner_lease (id, holder, expires_at) VALUES (1, ?1, ?2) \
             ON CONFLICT (id) DO UPDATE SET \
               holder = excluded.holder, expires_at = excluded.expires_at \
             WHERE miner_lease.expires_at <= ?3 OR miner_lease.holder = excluded.holder",
        )
        .bind(holder)
        .bind(now_ms + ttl_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ---- scores ----

    pub async fn user_score(&self, user_id: i64) -> Result<Option<UserScore>> {
        let row = sqlx::query_as::<_, UserScore>("SELECT * FROM user_scores WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_problem() -> Store {
        let store = Store::connect_in_memory().await.unwrap();
        store
            .register_problem(7, "Add", "easy", 1000.0, "approved", "p7", 0)
            .await
            .unwrap();
        store
    }

    fn params() -> ScoringParams {
        ScoringParams {
            base_points: 1000.0,
            alpha: 10.0,
            floor: 1.0,
        }
    }

    #[tokio::test]
    async fn test_lease_is_fifo_per_user_problem_pair() {
        let store = store_with_problem().await;
        let first = store
            .insert_submission(1, 7, "print(7)", "python", 100)
            .await
            .unwrap();
        let second = store
            .insert_submission(1, 7, "print(7)", "python", 200)
            .await
            .unwrap();

        let leased = store.lease_next("w0", 1000, 60_000).await.unwrap().unwrap();
        assert_eq!(leased.id, first);

        // same pair is busy; the newer row must wait
        assert!(store.lease_next("w1", 1000, 60_000).await.unwrap().is_none());

        store
            .commit_verdict(first, &VerdictRecord::new(Verdict::Wa, 1500), None)
            .await
            .unwrap();

        let leased = store.lease_next("w1", 2000, 60_000).await.unwrap().unwrap();
        assert_eq!(leased.id, second);
    }

    #[tokio::test]
    async fn test_unrelated_pairs_lease_concurrently() {
        let store = store_with_problem().await;
        store
            .insert_submission(1, 7, "a", "python", 100)
            .await
            .unwrap();
        store
            .insert_submission(2, 7, "b", "python", 200)
            .await
            .unwrap();

        let a = store.lease_next("w0", 1000, 60_000).await.unwrap().unwrap();
        let b = store.lease_next("w1", 1000, 60_000).await.unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test]
    async fn test_verdict_commits_exactly_once() {
        let store = store_with_problem().await;
        let id = store
            .insert_submission(1, 7, "a", "python", 100)
            .await
            .unwrap();
        store.lease_next("w0", 1000, 60_000).await.unwrap().unwrap();

        let first = store
            .commit_verdict(id, &VerdictRecord::new(Verdict::Wa, 1500), None)
            .await
            .unwrap();
        assert!(matches!(
            first,
            CommitOutcome::Committed {
                verdict: Verdict::Wa,
                ..
            }
        ));

        // a second finalization attempt must not change anything
        let second = store
            .commit_verdict(id, &VerdictRecord::new(Verdict::Ac, 1600), Some(&params()))
            .await
            .unwrap();
        assert_eq!(second, CommitOutcome::Skipped);

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.verdict, Verdict::Wa);
        assert_eq!(row.judged_at, Some(1500));
    }

    #[tokio::test]
    async fn test_accepted_points_snapshot_and_score_credit() {
        let store = store_with_problem().await;

        let s1 = store
            .insert_submission(1, 7, "a", "python", 100)
            .await
            .unwrap();
        store.lease_next("w0", 1000, 60_000).await.unwrap();
        let outcome = store
            .commit_verdict(s1, &VerdictRecord::new(Verdict::Ac, 1500), Some(&params()))
            .await
            .unwrap();

        // first solver earns the full base value
        let CommitOutcome::Committed { points, .. } = outcome else {
            panic!("expected commit");
        };
        assert_eq!(points, Some(1000.0));

        let s2 = store
            .insert_submission(2, 7, "b", "python", 200)
            .await
            .unwrap();
        store.lease_next("w0", 2000, 60_000).await.unwrap();
        let outcome = store
            .commit_verdict(s2, &VerdictRecord::new(Verdict::Ac, 2500), Some(&params()))
            .await
            .unwrap();

        // second solver sees the decayed value: 1000 / (1 + 1/10)
        let CommitOutcome::Committed { points, .. } = outcome else {
            panic!("expected commit");
        };
        let expected = 1000.0 / 1.1;
        assert!((points.unwrap() - expected).abs() < 1e-9);

        let score = store.user_score(2).await.unwrap().unwrap();
        assert!((score.total_points - expected).abs() < 1e-9);

        // earlier award is untouched by later decay
        let row = store.get_submission(s1).await.unwrap().unwrap();
        assert_eq!(row.points_earned, Some(1000.0));
    }

    #[tokio::test]
    async fn test_repeat_ac_does_not_advance_decay() {
        let store = store_with_problem().await;

        for submitted_at in [100, 200] {
            let id = store
                .insert_submission(1, 7, "a", "python", submitted_at)
                .await
                .unwrap();
            store
                .lease_next("w0", submitted_at + 500, 60_000)
                .await
                .unwrap();
            store
                .commit_verdict(
                    id,
                    &VerdictRecord::new(Verdict::Ac, submitted_at + 900),
                    Some(&params()),
                )
                .await
                .unwrap();
        }

        // one distinct solver: a fresh user still sees k = 1
        let id = store
            .insert_submission(2, 7, "b", "python", 300)
            .await
            .unwrap();
        store.lease_next("w0", 900, 60_000).await.unwrap();
        let outcome = store
            .commit_verdict(id, &VerdictRecord::new(Verdict::Ac, 950), Some(&params()))
            .await
            .unwrap();
        let CommitOutcome::Committed { points, .. } = outcome else {
            panic!("expected commit");
        };
        assert!((points.unwrap() - 1000.0 / 1.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cancelled_while_judging_finalizes_internal_error() {
        let store = store_with_problem().await;
        let id = store
            .insert_submission(1, 7, "a", "python", 100)
            .await
            .unwrap();
        store.lease_next("w0", 1000, 60_000).await.unwrap();
        store.cancel_submission(id).await.unwrap();

        let outcome = store
            .commit_verdict(id, &VerdictRecord::new(Verdict::Ac, 1500), Some(&params()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Committed {
                verdict: Verdict::Ie,
                points: None,
            }
        ));

        // no score mutation on IE
        assert!(store.user_score(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_lease_is_skipped() {
        let store = store_with_problem().await;
        let id = store
            .insert_submission(1, 7, "a", "python", 100)
            .await
            .unwrap();
        store.cancel_submission(id).await.unwrap();
        assert!(store.lease_next("w0", 1000, 60_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reaper_rewinds_then_poisons() {
        let store = store_with_problem().await;
        let id = store
            .insert_submission(1, 7, "a", "python", 100)
            .await
            .unwrap();

        // first lease expires and is rewound
        store.lease_next("w0", 1000, 10_000).await.unwrap().unwrap();
        let summary = store.reap_expired(20_000, 10_000, 2).await.unwrap();
        assert_eq!(summary.rewound, 1);
        assert_eq!(summary.poisoned, 0);

        // second expired lease hits the attempt ceiling
        store.lease_next("w0", 21_000, 10_000).await.unwrap().unwrap();
        let summary = store.reap_expired(40_000, 10_000, 2).await.unwrap();
        assert_eq!(summary.poisoned, 1);

        let row = store.get_submission(id).await.unwrap().unwrap();
        assert_eq!(row.verdict, Verdict::Ie);
        assert_eq!(row.error_message.as_deref(), Some("judging attempts exhausted"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_reclaimed_directly() {
        let store = store_with_problem().await;
        let id = store
            .insert_submission(1, 7, "a", "python", 100)
            .await
            .unwrap();

        store.lease_next("w0", 1000, 10_000).await.unwrap().unwrap();
        // w1 picks the row up once the lease window has passed
        let row = store.lease_next("w1", 20_000, 10_000).await.unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.attempts, 2);
        assert_eq!(row.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_mempool_and_block_fold_exactly_once() {
        let store = store_with_problem().await;

        let mut ids = Vec::new();
        for (user, t) in [(1, 100), (2, 200)] {
            let id = store
                .insert_submission(user, 7, "a", "python", t)
                .await
                .unwrap();
            store.lease_next("w0", t + 10, 60_000).await.unwrap();
            store
                .commit_verdict(id, &VerdictRecord::new(Verdict::Ac, t + 20), Some(&params()))
                .await
                .unwrap();
            ids.push(id);
        }

        let mempool = store.mempool().await.unwrap();
        assert_eq!(mempool.len(), 2);
        assert_eq!(mempool[0].id, ids[0]);

        let block = NewBlock {
            height: 0,
            block_hash: "h0".into(),
            parent_hash: "0".repeat(64),
            timestamp: 1000,
            tx_count: 2,
            total_points: 1900.0,
            miner_user_id: Some(1),
            btc_anchor: None,
        };
        let txs: Vec<(i64, String)> =
            ids.iter().map(|id| (*id, format!("tx{}", id))).collect();
        let committed = store.commit_block(&block, &txs).await.unwrap();

        assert!(store.mempool().await.unwrap().is_empty());
        let row = store.get_submission(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.block_id, Some(committed.id));
        assert!(row.tx_hash.is_some());

        // folding the same submissions again must fail and roll back
        let next = NewBlock {
            height: 1,
            block_hash: "h1".into(),
            parent_hash: "h0".into(),
            ..block.clone()
        };
        assert!(store.commit_block(&next, &txs).await.is_err());
        assert!(store.block_by_height(1).await.unwrap().is_none());

        let miner = store.user_score(1).await.unwrap().unwrap();
        assert_eq!(miner.blocks_mined, 1);
    }

    #[tokio::test]
    async fn test_miner_lease_is_single_writer() {
        let store = store_with_problem().await;

        assert!(store.try_acquire_miner_lease("a", 1000, 10_000).await.unwrap());
        // another holder cannot steal a live lease
        assert!(!store.try_acquire_miner_lease("b", 2000, 10_000).await.unwrap());
        // the holder may renew
        assert!(store.try_acquire_miner_lease("a", 3000, 10_000).await.unwrap());
        // an expired lease is up for grabs
        assert!(store.try_acquire_miner_lease("b", 14_000, 10_000).await.unwrap());
    }
}
