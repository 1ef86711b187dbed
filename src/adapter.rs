//! Chain adapter traits.
//!
//! Every network the tracker ingests is reached through a [`ChainAdapter`].
//! The adapter normalizes the chain's native transaction shape into either a
//! UTXO payload or an account-model transfer payload; everything downstream of
//! this seam is chain-agnostic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

use crate::error::TrackerError;
use crate::types::{BlockRef, Network};

// ============================================================================
// Normalized chain data
// ============================================================================

/// A block header as reported by a chain adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub height: i64,
    pub hash: String,
    pub time: DateTime<Utc>,
    /// Hash of the parent block. Used by the orphan resolver to walk
    /// backward, and by hash-linked tip walking.
    pub previous_hash: String,
}

impl ChainBlock {
    pub fn as_ref(&self) -> BlockRef {
        BlockRef {
            height: self.height,
            hash: self.hash.clone(),
            time: self.time,
        }
    }
}

/// One input of a UTXO transaction. Coinbase inputs carry no address and a
/// zero value.
#[derive(Debug, Clone)]
pub struct TxIn {
    pub address: Option<String>,
    pub value: BigDecimal,
}

/// One output of a UTXO transaction. Bare multisig outputs can pay to several
/// addresses at once; each listed address is credited the full output value.
#[derive(Debug, Clone)]
pub struct TxOut {
    pub addresses: Vec<String>,
    pub value: BigDecimal,
}

/// Metadata describing a token contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMeta {
    pub contract_address: String,
    pub name: String,
    pub symbol: String,
    pub precision: i32,
}

/// Classification of a single value movement in an account-model transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// A plain native-asset transfer.
    Standard,
    /// A native transfer executed by contract code rather than the
    /// transaction itself.
    Internal,
    /// A token contract transfer.
    Token,
    /// One leg of a swap routed through an exchange contract.
    Dex,
    /// A transfer into or out of a multisig contract.
    Multisig,
}

/// A single value movement inside an account-model transaction.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub kind: TransferKind,
    pub from: String,
    pub to: String,
    /// The asset moved. [`AssetRef::Native`] for the chain's own coin.
    pub asset: AssetRef,
    pub amount: BigDecimal,
}

/// Reference to an asset on a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRef {
    Native,
    Token(TokenMeta),
}

/// The chain-model-specific body of a normalized transaction.
#[derive(Debug, Clone)]
pub enum TxPayload {
    /// UTXO chains: the full input and output sets.
    Utxo {
        inputs: Vec<TxIn>,
        outputs: Vec<TxOut>,
    },
    /// Account-model chains: the originating address, the fee it paid, and
    /// every value movement the transaction caused.
    Transfers {
        origin: String,
        fee: BigDecimal,
        transfers: Vec<Transfer>,
    },
}

/// A transaction as normalized by a chain adapter, before extraction.
#[derive(Debug, Clone)]
pub struct RawTx {
    pub txid: String,
    /// `None` for mempool transactions.
    pub block: Option<BlockRef>,
    /// Whether the transaction executed successfully. Failed account-model
    /// transactions still charge the origin its fee.
    pub success: bool,
    pub memo: Option<String>,
    /// Chain-native representation, stored alongside the ledger rows for
    /// debugging and re-extraction.
    pub raw: serde_json::Value,
    pub payload: TxPayload,
}

// ============================================================================
// Adapter capabilities
// ============================================================================

/// How the orphan resolver decides whether a stored block is still canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalCheck {
    /// Compare the stored hash against the chain's current hash at the same
    /// height.
    HashAtHeight,
    /// Ask the chain for the block's confirmation count; a negative count
    /// means the block was orphaned.
    ConfirmationSign,
}

/// How the block tracker advances from the last processed block to the tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainWalk {
    /// Fetch blocks by incrementing height.
    ByHeight,
    /// Follow next-block hash links from the last processed block.
    ByHash,
}

/// Access to a single chain.
///
/// Implementations wrap whatever upstream source serves the network (a full
/// node, an indexer, an explorer API) and normalize its data. All methods
/// return [`TrackerError::Adapter`] on upstream failure.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// The network this adapter serves.
    fn network(&self) -> Network;

    /// The canonicality predicate this chain supports.
    fn canonical_check(&self) -> CanonicalCheck;

    /// The tip-walking mode this chain supports.
    fn walk(&self) -> ChainWalk;

    /// The block at the given height on the current best chain, if one
    /// exists.
    async fn block_at_height(&self, height: i64) -> Result<Option<ChainBlock>, TrackerError>;

    /// The hash at the given height on the current best chain.
    async fn block_hash_at_height(&self, height: i64) -> Result<Option<String>, TrackerError>;

    /// The block with the given hash, canonical or not.
    async fn block_by_hash(&self, hash: &str) -> Result<Option<ChainBlock>, TrackerError>;

    /// The hash of the canonical block following the one with the given hash,
    /// if it exists yet. Only meaningful for [`ChainWalk::ByHash`] chains.
    async fn next_block_hash(&self, hash: &str) -> Result<Option<String>, TrackerError>;

    /// The hash of the current chain tip.
    async fn last_block_hash(&self) -> Result<String, TrackerError>;

    /// Confirmation count for the block with the given hash. Negative when
    /// the block has been orphaned. Only meaningful for
    /// [`CanonicalCheck::ConfirmationSign`] chains.
    async fn block_confirmations(&self, hash: &str) -> Result<i64, TrackerError>;

    /// All transactions in the block with the given hash.
    async fn transactions_in_block(&self, hash: &str) -> Result<Vec<RawTx>, TrackerError>;

    /// Full transaction history touching any of the given addresses.
    async fn transactions_for_addresses(
        &self,
        addresses: &[String],
    ) -> Result<Vec<RawTx>, TrackerError>;

    /// Current on-chain balance of the given address in the given asset.
    async fn balance(&self, address: &str, asset: &AssetRef) -> Result<BigDecimal, TrackerError>;

    /// Submit a signed raw transaction, returning its txid.
    async fn broadcast(&self, raw_tx: &str) -> Result<String, TrackerError>;
}

/// Derives chain addresses from extended public keys.
///
/// Derivation is pure key arithmetic and lives behind this seam so the sync
/// pipeline can be exercised without real BIP32 material.
pub trait AddressDeriver: Send + Sync {
    /// The address at `m/<chain>/<index>` of the account the xpub roots,
    /// encoded for the given network and script type.
    fn derive(
        &self,
        xpub: &str,
        network: Network,
        script_type: crate::types::ScriptType,
        kind: crate::types::AddressKind,
        index: u32,
    ) -> Result<String, TrackerError>;

    /// The single address of an account-model account. The registered key
    /// string for these networks is the address itself.
    fn account_address(&self, xpub: &str, network: Network) -> Result<String, TrackerError> {
        let _ = network;
        Ok(xpub.to_string())
    }
}

/// The set of adapters the tracker dispatches on.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Network, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.network(), adapter);
    }

    /// Fails fast with [`TrackerError::AdapterMissing`] rather than letting a
    /// misconfigured network reach the sync pipeline.
    pub fn get(&self, network: Network) -> Result<Arc<dyn ChainAdapter>, TrackerError> {
        self.adapters
            .get(&network)
            .cloned()
            .ok_or(TrackerError::AdapterMissing(network))
    }

    pub fn networks(&self) -> impl Iterator<Item = Network> + '_ {
        self.adapters.keys().copied()
    }
}
