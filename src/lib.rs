//! *A PostgreSQL-backed multi-chain balance and history tracker.*
//!
//! `chain_tracker` follows registered accounts across heterogeneous
//! blockchains: hierarchical-deterministic accounts on UTXO chains and
//! single-address accounts on account-model chains. It ingests new blocks
//! through pluggable [`ChainAdapter`]s, repairs chain reorganizations,
//! extracts per-account balance movements into an idempotent ledger, and
//! emits notification messages through an injected [`TxPublisher`].
//!
//! # Design
//!
//! - **PostgreSQL backend**: all state lives in one database, written through
//!   idempotent upserts so block replay and concurrent scans converge
//! - **Chain-agnostic core**: adapters normalize each chain's transactions
//!   into UTXO or transfer payloads; everything past that seam is shared
//! - **Async-first**: built on sqlx and tokio
//!
//! # Components
//!
//! | Component | Module | Role |
//! |-----------|--------|------|
//! | [`BlockTracker`] | [`sync`] | walks each chain forward from the last processed block |
//! | orphan resolver | [`sync::orphan`] | unwinds reorganized blocks and their ledger rows |
//! | extractor | [`extract`] | turns raw transactions into per-account envelopes |
//! | ledger writer | [`ledger`] | atomic, idempotent persistence of envelopes |
//! | [`AddressRegistry`] | [`scan`] | registration workflow and gap-limit discovery |
//! | notifier | [`notify`] | per-(account, txid) message building and publishing |
//! | [`BalanceRefresher`] | [`balance`] | debounced on-chain balance snapshots |
//!
//! [`ChainAdapter`]: adapter::ChainAdapter
//! [`TxPublisher`]: notify::TxPublisher
//! [`BlockTracker`]: sync::BlockTracker
//! [`AddressRegistry`]: scan::AddressRegistry
//! [`BalanceRefresher`]: balance::BalanceRefresher

// Catch documentation errors caused by code changes.
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use crate::adapter::{AddressDeriver, ChainAdapter};
use crate::balance::BalanceRefresher;
use crate::notify::TxPublisher;
use crate::scan::AddressRegistry;
use crate::sync::{BlockTracker, SyncOutcome, TaskGuard};

pub use crate::adapter::AdapterRegistry;
pub use crate::error::TrackerError;
pub use crate::pool::{create_pool, create_pool_default, Pool, PoolConfig};
pub use crate::types::{AccountId, AddressId, AddressKind, Network, ScriptType, SyncStatus, TxRef};

pub mod adapter;
pub mod balance;
pub mod error;
pub mod extract;
pub mod init;
pub mod ledger;
pub mod notify;
pub mod pool;
pub mod scan;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testing;

/// Top-level handle wiring the components together.
///
/// Most deployments construct one `Tracker`, trigger [`Tracker::sync_network`]
/// from their scheduler for each network, and serve registrations through
/// [`Tracker::registry`].
pub struct Tracker {
    pool: Pool,
    adapters: AdapterRegistry,
    publisher: Arc<dyn TxPublisher>,
    refresher: Arc<BalanceRefresher>,
    registry: AddressRegistry,
    guard: Arc<TaskGuard>,
}

impl Tracker {
    pub fn new(
        pool: Pool,
        adapters: AdapterRegistry,
        deriver: Arc<dyn AddressDeriver>,
        publisher: Arc<dyn TxPublisher>,
    ) -> Self {
        let refresher = Arc::new(BalanceRefresher::new(pool.clone(), adapters.clone()));
        let registry = AddressRegistry::new(
            pool.clone(),
            adapters.clone(),
            deriver,
            Arc::clone(&publisher),
            Arc::clone(&refresher),
        );
        Self {
            pool,
            adapters,
            publisher,
            refresher,
            registry,
            guard: Arc::new(TaskGuard::new()),
        }
    }

    /// Runs database migrations.
    pub async fn init(&self) -> Result<(), TrackerError> {
        init::init_tracker_db(&self.pool).await
    }

    /// Advances the given network to its chain tip.
    pub async fn sync_network(&self, network: Network) -> Result<SyncOutcome, TrackerError> {
        self.block_tracker(network)?.sync_to_tip().await
    }

    /// A standalone tracker for one network, sharing this instance's pool,
    /// publisher, and task guard.
    pub fn block_tracker(&self, network: Network) -> Result<BlockTracker, TrackerError> {
        let adapter: Arc<dyn ChainAdapter> = self.adapters.get(network)?;
        Ok(BlockTracker::new(
            self.pool.clone(),
            adapter,
            Arc::clone(&self.publisher),
            Arc::clone(&self.refresher),
            Arc::clone(&self.guard),
        ))
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    pub fn refresher(&self) -> &Arc<BalanceRefresher> {
        &self.refresher
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
