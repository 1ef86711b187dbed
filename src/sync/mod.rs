//! Per-network forward sync.
//!
//! The [`BlockTracker`] advances one network's frontier from the last
//! processed block to the chain tip: repair orphans, fetch the next block,
//! extract and persist its tracked transactions, record the block, then
//! notify and refresh balances. One tracker pass per network runs at a time;
//! overlapping triggers return [`SyncOutcome::AlreadyRunning`] instead of
//! double-processing.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::adapter::{ChainAdapter, ChainBlock, ChainWalk, RawTx, TxPayload};
use crate::balance::BalanceRefresher;
use crate::error::TrackerError;
use crate::extract::extract_envelopes;
use crate::ledger::accounts::tracked_addresses;
use crate::ledger::{upsert_envelope, LedgerEntry};
use crate::notify::{build_messages, TxPublisher};
use crate::pool::Pool;
use crate::types::{AccountId, Network, MAX_REORG_DEPTH};

pub mod blocks;
pub mod orphan;

// ============================================================================
// Task dedup
// ============================================================================

/// In-process mutual exclusion for named tasks.
///
/// Keyed permits stop a slow sync pass and its next scheduled trigger from
/// interleaving. The permit releases on drop, including on error paths.
#[derive(Default)]
pub struct TaskGuard {
    running: Mutex<HashSet<String>>,
}

impl TaskGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<TaskPermit> {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.insert(key.to_string()) {
            Some(TaskPermit {
                guard: Arc::clone(self),
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

pub struct TaskPermit {
    guard: Arc<TaskGuard>,
    key: String,
}

impl Drop for TaskPermit {
    fn drop(&mut self) {
        let mut running = match self.guard.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        running.remove(&self.key);
    }
}

// ============================================================================
// Block tracker
// ============================================================================

/// Result of a sync trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The frontier reached the tip; `blocks` were processed this pass.
    Completed { blocks: u32 },
    /// Another pass for the same network already holds the permit.
    AlreadyRunning,
}

/// Drives one network's sync pipeline.
pub struct BlockTracker {
    pool: Pool,
    adapter: Arc<dyn ChainAdapter>,
    publisher: Arc<dyn TxPublisher>,
    refresher: Arc<BalanceRefresher>,
    guard: Arc<TaskGuard>,
    max_reorg_depth: u32,
}

impl BlockTracker {
    pub fn new(
        pool: Pool,
        adapter: Arc<dyn ChainAdapter>,
        publisher: Arc<dyn TxPublisher>,
        refresher: Arc<BalanceRefresher>,
        guard: Arc<TaskGuard>,
    ) -> Self {
        Self {
            pool,
            adapter,
            publisher,
            refresher,
            guard,
            max_reorg_depth: MAX_REORG_DEPTH,
        }
    }

    pub fn network(&self) -> Network {
        self.adapter.network()
    }

    /// Processes blocks forward until the chain has no newer block, repairing
    /// any reorg first.
    pub async fn sync_to_tip(&self) -> Result<SyncOutcome, TrackerError> {
        let network = self.network();
        let key = format!("sync_blocks:{network}");
        let _permit = match self.guard.try_acquire(&key) {
            Some(permit) => permit,
            None => {
                debug!(network = %network, "sync already running; skipping");
                return Ok(SyncOutcome::AlreadyRunning);
            }
        };

        let mut frontier =
            orphan::resolve_orphans(&self.pool, &self.adapter, self.max_reorg_depth).await?;

        let mut processed = 0u32;
        loop {
            let next = match &frontier {
                None => {
                    // Nothing recorded yet. Start at the current tip rather
                    // than replaying chain history; account history comes
                    // from registration scans, not block replay.
                    let tip_hash = self.adapter.last_block_hash().await?;
                    self.adapter.block_by_hash(&tip_hash).await?
                }
                Some(last) => self.next_block(last).await?,
            };

            let block = match next {
                Some(block) => block,
                None => break,
            };

            // A reorg can land while a pass is mid-flight. A fetched block
            // that does not link to the frontier means the frontier went
            // stale after the last resolver run; re-resolve before writing
            // anything on top of it.
            if let Some(last) = &frontier {
                if block.previous_hash != last.block_hash {
                    warn!(
                        network = %network,
                        height = block.height,
                        hash = %block.hash,
                        frontier = %last.block_hash,
                        "fetched block does not extend the frontier; re-resolving"
                    );
                    frontier =
                        orphan::resolve_orphans(&self.pool, &self.adapter, self.max_reorg_depth)
                            .await?;
                    continue;
                }
            }

            self.process_block(&block).await?;
            frontier = Some(blocks::record_block(&self.pool, network, &block).await?);
            processed += 1;
        }

        if processed > 0 {
            info!(network = %network, blocks = processed, "synced to tip");
        }
        Ok(SyncOutcome::Completed { blocks: processed })
    }

    async fn next_block(
        &self,
        last: &blocks::ProcessedBlockRow,
    ) -> Result<Option<ChainBlock>, TrackerError> {
        match self.adapter.walk() {
            ChainWalk::ByHeight => self.adapter.block_at_height(last.block_height + 1).await,
            ChainWalk::ByHash => match self.adapter.next_block_hash(&last.block_hash).await? {
                Some(hash) => self.adapter.block_by_hash(&hash).await,
                None => Ok(None),
            },
        }
    }

    /// Extracts and persists every tracked transaction in the block, then
    /// publishes notifications and schedules balance refreshes. Ledger writes
    /// commit before anything is published, so a crash mid-notify re-emits
    /// rather than losing rows.
    async fn process_block(&self, block: &ChainBlock) -> Result<(), TrackerError> {
        let network = self.network();
        let raw_txs = self.adapter.transactions_in_block(&block.hash).await?;
        if raw_txs.is_empty() {
            return Ok(());
        }

        let candidates = candidate_addresses(&raw_txs);
        let tracked_rows = tracked_addresses(&self.pool, network, &candidates).await?;
        if tracked_rows.is_empty() {
            return Ok(());
        }
        let tracked: HashSet<String> = tracked_rows.iter().map(|r| r.address.clone()).collect();

        let envelopes = extract_envelopes(&raw_txs, &tracked);
        let mut entries: Vec<LedgerEntry> = Vec::new();
        for envelope in &envelopes {
            entries.extend(upsert_envelope(&self.pool, network, envelope).await?);
        }

        debug!(
            network = %network,
            height = block.height,
            hash = %block.hash,
            txs = raw_txs.len(),
            entries = entries.len(),
            "block processed"
        );

        // Rows are committed at this point. A failed publish is logged and
        // dropped rather than failing the pass; the frontier still advances.
        for message in build_messages(&entries) {
            if let Err(e) = self.publisher.publish_tx(&message).await {
                warn!(txid = %message.txid, error = %e, "notification publish failed");
            }
        }

        let touched: Vec<(AccountId, String)> = entries
            .iter()
            .map(|e| (e.account_id, e.address.clone()))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        self.refresher.maybe_refresh(network, touched);

        Ok(())
    }
}

/// Every address a transaction batch could touch, deduplicated for the
/// tracked-address intersection query.
fn candidate_addresses(raw_txs: &[RawTx]) -> Vec<String> {
    let mut seen = HashSet::new();
    for tx in raw_txs {
        match &tx.payload {
            TxPayload::Utxo { inputs, outputs } => {
                for input in inputs {
                    if let Some(addr) = &input.address {
                        seen.insert(addr.clone());
                    }
                }
                for output in outputs {
                    for addr in &output.addresses {
                        seen.insert(addr.clone());
                    }
                }
            }
            TxPayload::Transfers {
                origin, transfers, ..
            } => {
                seen.insert(origin.clone());
                for transfer in transfers {
                    seen.insert(transfer.from.clone());
                    seen.insert(transfer.to.clone());
                }
            }
        }
    }
    seen.into_iter().collect()
}
