//! A programmable in-memory chain for exercising the sync pipeline.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{TimeZone, Utc};

use crate::adapter::{
    AddressDeriver, AssetRef, CanonicalCheck, ChainAdapter, ChainBlock, ChainWalk, RawTx,
    Transfer, TransferKind, TxIn, TxOut, TxPayload,
};
use crate::error::TrackerError;
use crate::notify::{SyncStatusMessage, TxMessage, TxPublisher};
use crate::types::{AddressKind, BlockRef, Network, ScriptType};

#[derive(Default)]
struct ChainState {
    /// The current best chain, ascending by height.
    canonical: Vec<ChainBlock>,
    /// Blocks the chain once served but no longer considers canonical.
    forked: HashMap<String, ChainBlock>,
    txs_by_block: HashMap<String, Vec<RawTx>>,
    histories: HashMap<String, Vec<RawTx>>,
    balances: HashMap<(String, String), BigDecimal>,
}

/// Mock [`ChainAdapter`] with a mutable canonical chain.
///
/// Tests append blocks, trigger reorgs by replacing a suffix of the chain,
/// and seed address histories for registration scans.
pub(crate) struct MockChain {
    network: Network,
    check: CanonicalCheck,
    walk: ChainWalk,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub(crate) fn new(network: Network) -> Self {
        let (check, walk) = if network.is_account_model() {
            (CanonicalCheck::HashAtHeight, ChainWalk::ByHeight)
        } else {
            (CanonicalCheck::ConfirmationSign, ChainWalk::ByHash)
        };
        Self {
            network,
            check,
            walk,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends a block to the canonical chain and returns its reference.
    pub(crate) fn push_block(&self, hash: &str, txs: Vec<RawTx>) -> BlockRef {
        let mut state = self.lock();
        let (height, previous_hash) = match state.canonical.last() {
            Some(tip) => (tip.height + 1, tip.hash.clone()),
            None => (100, "genesis".to_string()),
        };
        let block = ChainBlock {
            height,
            hash: hash.to_string(),
            time: Utc.timestamp_opt(1_700_000_000 + height * 600, 0).unwrap(),
            previous_hash,
        };
        let block_ref = block.as_ref();
        let txs = txs
            .into_iter()
            .map(|mut tx| {
                tx.block = Some(block_ref.clone());
                tx
            })
            .collect();
        state.txs_by_block.insert(hash.to_string(), txs);
        state.canonical.push(block);
        block_ref
    }

    /// Drops every canonical block at or above `height`, remembering the
    /// dropped blocks as forked so `block_by_hash` still serves them.
    pub(crate) fn reorg_from(&self, height: i64) {
        let mut state = self.lock();
        let keep = state
            .canonical
            .iter()
            .position(|b| b.height >= height)
            .unwrap_or(state.canonical.len());
        for block in state.canonical.split_off(keep) {
            state.forked.insert(block.hash.clone(), block);
        }
    }

    /// Re-adopts a previously forked block as the next canonical block.
    pub(crate) fn readopt(&self, hash: &str) {
        let mut state = self.lock();
        if let Some(block) = state.forked.remove(hash) {
            state.canonical.push(block);
        }
    }

    pub(crate) fn set_history(&self, address: &str, txs: Vec<RawTx>) {
        self.lock().histories.insert(address.to_string(), txs);
    }

    pub(crate) fn set_balance(&self, address: &str, identifier: &str, balance: i64) {
        self.lock().balances.insert(
            (address.to_string(), identifier.to_string()),
            BigDecimal::from(balance),
        );
    }
}

#[async_trait]
impl ChainAdapter for MockChain {
    fn network(&self) -> Network {
        self.network
    }

    fn canonical_check(&self) -> CanonicalCheck {
        self.check
    }

    fn walk(&self) -> ChainWalk {
        self.walk
    }

    async fn block_at_height(&self, height: i64) -> Result<Option<ChainBlock>, TrackerError> {
        Ok(self
            .lock()
            .canonical
            .iter()
            .find(|b| b.height == height)
            .cloned())
    }

    async fn block_hash_at_height(&self, height: i64) -> Result<Option<String>, TrackerError> {
        Ok(self.block_at_height(height).await?.map(|b| b.hash))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<ChainBlock>, TrackerError> {
        let state = self.lock();
        Ok(state
            .canonical
            .iter()
            .find(|b| b.hash == hash)
            .cloned()
            .or_else(|| state.forked.get(hash).cloned()))
    }

    async fn next_block_hash(&self, hash: &str) -> Result<Option<String>, TrackerError> {
        Ok(self
            .lock()
            .canonical
            .iter()
            .find(|b| b.previous_hash == hash)
            .map(|b| b.hash.clone()))
    }

    async fn last_block_hash(&self) -> Result<String, TrackerError> {
        self.lock()
            .canonical
            .last()
            .map(|b| b.hash.clone())
            .ok_or_else(|| TrackerError::Adapter("mock chain is empty".into()))
    }

    async fn block_confirmations(&self, hash: &str) -> Result<i64, TrackerError> {
        let state = self.lock();
        let tip = state
            .canonical
            .last()
            .map(|b| b.height)
            .ok_or_else(|| TrackerError::Adapter("mock chain is empty".into()))?;
        match state.canonical.iter().find(|b| b.hash == hash) {
            Some(block) => Ok(tip - block.height + 1),
            None => Ok(-1),
        }
    }

    async fn transactions_in_block(&self, hash: &str) -> Result<Vec<RawTx>, TrackerError> {
        Ok(self.lock().txs_by_block.get(hash).cloned().unwrap_or_default())
    }

    async fn transactions_for_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<RawTx>, TrackerError> {
        let state = self.lock();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for address in addresses {
            for tx in state.histories.get(address).into_iter().flatten() {
                if seen.insert(tx.txid.clone()) {
                    out.push(tx.clone());
                }
            }
        }
        Ok(out)
    }

    async fn balance(&self, address: &str, asset: &AssetRef) -> Result<BigDecimal, TrackerError> {
        let identifier = match asset {
            AssetRef::Native => self.network.as_str().to_string(),
            AssetRef::Token(meta) => meta.contract_address.clone(),
        };
        Ok(self
            .lock()
            .balances
            .get(&(address.to_string(), identifier))
            .cloned()
            .unwrap_or_else(|| BigDecimal::from(0)))
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<String, TrackerError> {
        Ok(format!("broadcast:{raw_tx}"))
    }
}

// ============================================================================
// Transaction builders
// ============================================================================

/// A UTXO transaction paying `value` from `from` to `to`, keeping `change`
/// back to the sender.
pub(crate) fn utxo_payment(
    txid: &str,
    from: &str,
    to: &str,
    value: i64,
    change: i64,
    fee: i64,
) -> RawTx {
    RawTx {
        txid: txid.to_string(),
        block: None,
        success: true,
        memo: None,
        raw: serde_json::json!({ "txid": txid }),
        payload: TxPayload::Utxo {
            inputs: vec![TxIn {
                address: Some(from.to_string()),
                value: BigDecimal::from(value + change + fee),
            }],
            outputs: vec![
                TxOut {
                    addresses: vec![to.to_string()],
                    value: BigDecimal::from(value),
                },
                TxOut {
                    addresses: vec![from.to_string()],
                    value: BigDecimal::from(change),
                },
            ],
        },
    }
}

/// An account-model native transfer.
pub(crate) fn native_transfer(txid: &str, from: &str, to: &str, value: i64, fee: i64) -> RawTx {
    RawTx {
        txid: txid.to_string(),
        block: None,
        success: true,
        memo: None,
        raw: serde_json::json!({ "txid": txid }),
        payload: TxPayload::Transfers {
            origin: from.to_string(),
            fee: BigDecimal::from(fee),
            transfers: vec![Transfer {
                kind: TransferKind::Standard,
                from: from.to_string(),
                to: to.to_string(),
                asset: AssetRef::Native,
                amount: BigDecimal::from(value),
            }],
        },
    }
}

// ============================================================================
// Deriver and publisher doubles
// ============================================================================

/// Deterministic deriver producing `{xpub}-{chain}-{index}` strings.
pub(crate) struct MockDeriver;

impl AddressDeriver for MockDeriver {
    fn derive(
        &self,
        xpub: &str,
        _network: Network,
        _script_type: ScriptType,
        kind: AddressKind,
        index: u32,
    ) -> Result<String, TrackerError> {
        Ok(format!("{}-{}-{}", xpub, kind.path_component(), index))
    }
}

/// Publisher that buffers messages for assertions.
#[derive(Default)]
pub(crate) struct BufferPublisher {
    pub(crate) txs: Mutex<Vec<TxMessage>>,
    pub(crate) statuses: Mutex<Vec<SyncStatusMessage>>,
}

#[async_trait]
impl TxPublisher for BufferPublisher {
    async fn publish_tx(&self, message: &TxMessage) -> Result<(), TrackerError> {
        self.txs
            .lock()
            .expect("publisher lock")
            .push(message.clone());
        Ok(())
    }

    async fn publish_sync_status(&self, message: &SyncStatusMessage) -> Result<(), TrackerError> {
        self.statuses
            .lock()
            .expect("publisher lock")
            .push(message.clone());
        Ok(())
    }
}
