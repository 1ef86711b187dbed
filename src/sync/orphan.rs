//! Orphan resolution.
//!
//! Before advancing the sync frontier, the tracker verifies that its latest
//! recorded block is still on the best chain. When it is not, the resolver
//! walks backward through the stored parent links, marking each abandoned
//! block orphaned and cascading its ledger rows away, until it lands on a
//! block the chain still agrees on. Forward sync then rebuilds from there.

use std::sync::Arc;

use tracing::{info, warn};

use crate::adapter::{CanonicalCheck, ChainAdapter};
use crate::error::TrackerError;
use crate::ledger::delete_ledger_rows_for_block;
use crate::pool::Pool;
use crate::sync::blocks::{self, ProcessedBlockRow};

/// Checks the latest recorded block and repairs any reorg, returning the
/// newest block that is still canonical (`None` when nothing has been
/// recorded yet).
///
/// The walk is bounded: after `max_depth` abandoned blocks the resolver stops
/// with [`TrackerError::ReorgTooDeep`] rather than unwinding arbitrary
/// amounts of history. Already-orphaned rows encountered along the parent
/// links are stepped over without re-cascading.
pub async fn resolve_orphans(
    pool: &Pool,
    adapter: &Arc<dyn ChainAdapter>,
    max_depth: u32,
) -> Result<Option<ProcessedBlockRow>, TrackerError> {
    let network = adapter.network();
    let mut current = match blocks::latest_block(pool, network).await? {
        Some(row) => row,
        None => return Ok(None),
    };

    let mut depth = 0u32;
    loop {
        if is_canonical(adapter, &current).await? {
            if depth > 0 {
                info!(
                    network = %network,
                    height = current.block_height,
                    orphaned = depth,
                    "reorg repaired"
                );
            }
            return Ok(Some(current));
        }

        if depth >= max_depth {
            return Err(TrackerError::ReorgTooDeep {
                network,
                depth: max_depth,
            });
        }
        depth += 1;

        warn!(
            network = %network,
            height = current.block_height,
            hash = %current.block_hash,
            "block orphaned by reorg"
        );
        blocks::mark_orphaned(pool, network, &current.block_hash).await?;
        let removed = delete_ledger_rows_for_block(pool, network, &current.block_hash).await?;
        if removed > 0 {
            info!(
                network = %network,
                hash = %current.block_hash,
                rows = removed,
                "orphaned ledger rows removed"
            );
        }

        current = match skip_orphaned_ancestors(pool, network, &current.previous_hash, max_depth, &mut depth).await? {
            Some(parent) => parent,
            None => {
                // History ends before the fork point. Forward sync restarts
                // from the chain's view.
                return Ok(None);
            }
        };
    }
}

/// Steps backward through parent links until a non-orphaned ancestor is
/// found, counting already-orphaned rows against the depth budget without
/// re-cascading them.
async fn skip_orphaned_ancestors(
    pool: &Pool,
    network: crate::types::Network,
    from_hash: &str,
    max_depth: u32,
    depth: &mut u32,
) -> Result<Option<ProcessedBlockRow>, TrackerError> {
    let mut hash = from_hash.to_string();
    loop {
        let row = match blocks::get_by_hash(pool, network, &hash).await? {
            Some(row) => row,
            None => return Ok(None),
        };
        if !row.is_orphaned {
            return Ok(Some(row));
        }
        if *depth >= max_depth {
            return Err(TrackerError::ReorgTooDeep {
                network,
                depth: max_depth,
            });
        }
        *depth += 1;
        hash = row.previous_hash;
    }
}

async fn is_canonical(
    adapter: &Arc<dyn ChainAdapter>,
    row: &ProcessedBlockRow,
) -> Result<bool, TrackerError> {
    match adapter.canonical_check() {
        CanonicalCheck::HashAtHeight => {
            let chain_hash = adapter.block_hash_at_height(row.block_height).await?;
            Ok(chain_hash.as_deref() == Some(row.block_hash.as_str()))
        }
        CanonicalCheck::ConfirmationSign => {
            let confirmations = adapter.block_confirmations(&row.block_hash).await?;
            Ok(confirmations >= 0)
        }
    }
}
