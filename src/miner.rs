//! Block miner: folds accepted submissions into a hash-linked ledger on a
//! fixed epoch.
//!
//! Every tick drains the mempool (accepted submissions not yet in a
//! block) into one block whose hash links to its parent. Mining is
//! strictly single-writer: a store-side lease plus an in-process lock
//! keep concurrent ticks out.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::store::{now_ms, BlockRow, NewBlock, Store, Submission};

const GENESIS_PARENT: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

pub struct Miner {
    store: Store,
    epoch_ms: u64,
    holder: String,
    tick_lock: Mutex<()>,
}

impl Miner {
    pub fn new(store: Store, epoch_ms: u64) -> Self {
        Self {
            store,
            epoch_ms,
            holder: format!("chainjudge-{}", std::process::id()),
            tick_lock: Mutex::new(()),
        }
    }

    /// Create the genesis block if the chain is empty.
    pub async fn ensure_genesis(&self) -> Result<()> {
        if self.store.latest_block().await?.is_some() {
            return Ok(());
        }

        let timestamp = now_ms();
        let tx_list_hash = sha256_hex(canonical_tx_list(&[]).as_bytes());
        let block = NewBlock {
            height: 0,
            block_hash: block_hash(0, GENESIS_PARENT, timestamp, &tx_list_hash, None),
            parent_hash: GENESIS_PARENT.to_string(),
            timestamp,
            tx_count: 0,
            total_points: 0.0,
            miner_user_id: None,
            btc_anchor: None,
        };

        let row = self.store.commit_block(&block, &[]).await?;
        info!(hash = %row.block_hash, "created genesis block");
        Ok(())
    }

    /// Tick every epoch until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.epoch_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the interval fires immediately; skip that first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.mine_once().await {
                Ok(Some(block)) => {
                    info!(
                        height = block.height,
                        hash = %block.block_hash,
                        tx_count = block.tx_count,
                        miner = ?block.miner_user_id,
                        "mined block"
                    );
                }
                Ok(None) => {}
                // a failed tick leaves the mempool untouched; the next
                // epoch retries
                Err(e) => error!("mining tick failed: {:#}", e),
            }
        }

        info!("miner stopped");
        Ok(())
    }

    /// Mine one block. Returns None when another leader holds the lease.
    pub async fn mine_once(&self) -> Result<Option<BlockRow>> {
        let _guard = self.tick_lock.lock().await;

        let now = now_ms();
        if !self
            .store
            .try_acquire_miner_lease(&self.holder, now, self.epoch_ms as i64)
            .await?
        {
            info!("mining lease held elsewhere, skipping tick");
            return Ok(None);
        }

        let parent = self
            .store
            .latest_block()
            .await?
            .context("chain has no genesis block")?;
        let txs = self.store.mempool().await?;

        let height = parent.height + 1;
        let timestamp = now_ms();
        let tx_list_hash = sha256_hex(canonical_tx_list(&txs).as_bytes());
        let miner_user_id = select_miner(&txs);

        let block = NewBlock {
            height,
            block_hash: block_hash(
                height,
                &parent.block_hash,
                timestamp,
                &tx_list_hash,
                miner_user_id,
            ),
            parent_hash: parent.block_hash.clone(),
            timestamp,
            tx_count: txs.len() as i64,
            total_points: txs.iter().filter_map(|s| s.points_earned).sum(),
            miner_user_id,
            btc_anchor: None,
        };

        let tx_hashes: Vec<(i64, String)> = txs
            .iter()
            .map(|s| (s.id, tx_hash(s.id, height, timestamp)))
            .collect();

        let row = self.store.commit_block(&block, &tx_hashes).await?;
        Ok(Some(row))
    }
}

/// Deterministic serialization of the transaction list.
///
/// One line per submission, in mempool order:
/// `submission_id:user_id:problem_id:points`.
pub fn canonical_tx_list(txs: &[Submission]) -> String {
    txs.iter()
        .map(|s| {
            format!(
                "{}:{}:{}:{:.4}",
                s.id,
                s.user_id,
                s.problem_id,
                s.points_earned.unwrap_or(0.0)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `SHA256(height | parent_hash | timestamp | tx_list_hash | miner)`.
pub fn block_hash(
    height: i64,
    parent_hash: &str,
    timestamp: i64,
    tx_list_hash: &str,
    miner_user_id: Option<i64>,
) -> String {
    let miner = miner_user_id.map(|id| id.to_string()).unwrap_or_default();
    sha256_hex(
        format!(
            "{}|{}|{}|{}|{}",
            height, parent_hash, timestamp, tx_list_hash, miner
        )
        .as_bytes(),
    )
}

/// Per-transaction hash recorded on each folded submission.
pub fn tx_hash(submission_id: i64, height: i64, timestamp: i64) -> String {
    sha256_hex(format!("{}:{}:{}", submission_id, height, timestamp).as_bytes())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Pick the block's miner: the first solver of the problem with the most
/// accepted submissions in the batch, ties broken by earliest submission.
pub fn select_miner(txs: &[Submission]) -> Option<i64> {
    let mut counts: HashMap<i64, u64> = HashMap::new();
    let mut firsts: HashMap<i64, &Submission> = HashMap::new();

    // txs arrive ordered by (submitted_at, id), so the first sighting of a
    // problem is its earliest accepted submission
    for submission in txs {
        *counts.entry(submission.problem_id).or_insert(0) += 1;
        firsts.entry(submission.problem_id).or_insert(submission);
    }

    firsts
        .values()
        .max_by(|a, b| {
            counts[&a.problem_id]
                .cmp(&counts[&b.problem_id])
                .then_with(|| b.submitted_at.cmp(&a.submitted_at))
                .then_with(|| b.id.cmp(&a.id))
        })
        .map(|s| s.user_id)
}
