//! Account registration and address discovery.
//!
//! Registering an account runs its initial history scan: account-model
//! chains track the single account address and pull its full history; HD
//! chains derive addresses window by window over both derivation chains at
//! once, stopping once a full gap of unused addresses has been observed past
//! the last use on either chain. Later registrations of the same account
//! re-enter the same workflow and converge on the same rows thanks to the
//! ledger's idempotent upserts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use tracing::{info, warn};

use crate::adapter::{AdapterRegistry, AddressDeriver, RawTx};
use crate::balance::BalanceRefresher;
use crate::error::TrackerError;
use crate::extract::extract_envelopes;
use crate::ledger::accounts::{
    self, clear_account_history, get_or_create_account, update_sync_status, AccountRow, AddressRow,
};
use crate::ledger::{upsert_envelope, LedgerEntry};
use crate::notify::{build_messages, SyncStatusMessage, TxPublisher};
use crate::pool::Pool;
use crate::types::{
    AccountId, AddressKind, Network, ScriptType, SyncStatus, ADDRESS_BATCH_SIZE, GAP_LIMIT,
    STALE_SYNC_SECS,
};

/// Result of a registration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The scan ran to completion. `created` is false for re-registrations.
    Synced { created: bool },
    /// Another registration for this account is in flight and fresh enough
    /// to trust.
    AlreadySyncing,
}

/// Registration workflow and address issuance.
pub struct AddressRegistry {
    pool: Pool,
    adapters: AdapterRegistry,
    deriver: Arc<dyn AddressDeriver>,
    publisher: Arc<dyn TxPublisher>,
    refresher: Arc<BalanceRefresher>,
}

impl AddressRegistry {
    pub fn new(
        pool: Pool,
        adapters: AdapterRegistry,
        deriver: Arc<dyn AddressDeriver>,
        publisher: Arc<dyn TxPublisher>,
        refresher: Arc<BalanceRefresher>,
    ) -> Self {
        Self {
            pool,
            adapters,
            deriver,
            publisher,
            refresher,
        }
    }

    /// Registers an account and runs its history scan.
    ///
    /// A `hard_refresh` drops the account's derived addresses and ledger
    /// history first and rebuilds from the chain; it is the recovery path for
    /// reorgs too deep for the orphan resolver.
    pub async fn register(
        &self,
        xpub: &str,
        network: Network,
        script_type: ScriptType,
        hard_refresh: bool,
    ) -> Result<RegisterOutcome, TrackerError> {
        let (account, created) =
            get_or_create_account(&self.pool, xpub, network, script_type).await?;

        if !created {
            if hard_refresh {
                info!(xpub = %xpub, network = %network, "hard refresh; clearing history");
                clear_account_history(&self.pool, account.id).await?;
            } else if account.sync_status == SyncStatus::Syncing {
                let age = Utc::now()
                    .signed_duration_since(account.updated_at)
                    .num_seconds();
                if age < STALE_SYNC_SECS {
                    return Ok(RegisterOutcome::AlreadySyncing);
                }
                // The previous scan died mid-flight; take over.
                warn!(
                    xpub = %xpub,
                    network = %network,
                    stale_secs = age,
                    "re-entering stale sync"
                );
            }
        }

        self.publish_status(&account, SyncStatus::Syncing).await?;
        update_sync_status(&self.pool, account.id, SyncStatus::Syncing).await?;

        match self.sync_account(&account).await {
            Ok(entries) => {
                update_sync_status(&self.pool, account.id, SyncStatus::Complete).await?;
                self.publish_status(&account, SyncStatus::Complete).await?;

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

                Ok(RegisterOutcome::Synced { created })
            }
            Err(e) => {
                update_sync_status(&self.pool, account.id, SyncStatus::Failed).await?;
                self.publish_status(&account, SyncStatus::Failed).await?;
                Err(e)
            }
        }
    }

    /// Removes the account entirely. Addresses, ledger rows, and balance
    /// snapshots go with it via foreign-key cascades.
    pub async fn unregister(
        &self,
        xpub: &str,
        network: Network,
        script_type: ScriptType,
    ) -> Result<(), TrackerError> {
        let account = accounts::get_account(&self.pool, xpub, network, script_type)
            .await?
            .ok_or_else(|| TrackerError::AccountNotRegistered {
                xpub: xpub.to_string(),
                network,
            })?;
        accounts::delete_account(&self.pool, account.id).await?;
        info!(xpub = %xpub, network = %network, "account unregistered");
        Ok(())
    }

    async fn publish_status(
        &self,
        account: &AccountRow,
        status: SyncStatus,
    ) -> Result<(), TrackerError> {
        self.publisher
            .publish_sync_status(&SyncStatusMessage::new(
                &account.xpub,
                account.network,
                account.script_type,
                status,
            ))
            .await
    }

    async fn sync_account(&self, account: &AccountRow) -> Result<Vec<LedgerEntry>, TrackerError> {
        if account.network.is_account_model() {
            self.sync_single_address(account).await
        } else {
            self.gap_limit_scan(account).await
        }
    }

    /// Account-model chains: one tracked address, full history in one fetch.
    async fn sync_single_address(
        &self,
        account: &AccountRow,
    ) -> Result<Vec<LedgerEntry>, TrackerError> {
        let adapter = self.adapters.get(account.network)?;
        let address = self
            .deriver
            .account_address(&account.xpub, account.network)?;
        accounts::upsert_address(&self.pool, account.id, &address, AddressKind::Receive, 0)
            .await?;

        let raw_txs = adapter.transactions_for_addresses(&[address.clone()]).await?;
        let tracked: HashSet<String> = [address].into_iter().collect();
        self.ingest(account.network, &raw_txs, &tracked).await
    }

    /// Iterative gap-limit discovery over both derivation chains at once.
    ///
    /// Each window derives GAP_LIMIT fresh receive and change addresses and
    /// fetches their histories in concurrent batches. The highest used index
    /// is shared between the two chains: use on either chain keeps the window
    /// advancing on both, so change outputs misfiled past the change chain's
    /// own gap are still found while the receive chain shows activity. A
    /// window with no used address on either chain ends the scan.
    async fn gap_limit_scan(&self, account: &AccountRow) -> Result<Vec<LedgerEntry>, TrackerError> {
        let mut entries = Vec::new();
        let mut from_index = 0u32;
        let mut to_index = GAP_LIMIT;

        loop {
            let receive = self
                .derive_window(account, AddressKind::Receive, from_index, to_index)
                .await?;
            let change = self
                .derive_window(account, AddressKind::Change, from_index, to_index)
                .await?;
            let window: Vec<String> = receive.iter().chain(change.iter()).cloned().collect();

            let raw_txs = self.fetch_histories(account.network, &window).await?;
            let tracked: HashSet<String> = window.into_iter().collect();
            let window_entries = self.ingest(account.network, &raw_txs, &tracked).await?;

            let used: HashSet<&str> = window_entries
                .iter()
                .map(|e| e.address.as_str())
                .collect();
            let max_in = |chain: &[String]| {
                chain
                    .iter()
                    .enumerate()
                    .filter(|(_, addr)| used.contains(addr.as_str()))
                    .map(|(offset, _)| from_index + offset as u32)
                    .max()
            };
            let max_used = max_in(&receive).max(max_in(&change));
            entries.extend(window_entries);

            let max_used = match max_used {
                Some(idx) => idx,
                // Neither chain saw use in this window: the gap is satisfied.
                None => break,
            };

            let next_to = max_used + GAP_LIMIT;
            if next_to <= to_index {
                break;
            }
            from_index = to_index;
            to_index = next_to;
        }

        info!(
            xpub = %account.xpub,
            network = %account.network,
            scanned = to_index,
            "gap-limit scan finished"
        );
        Ok(entries)
    }

    /// Derives and records addresses for indices `[from, to)`.
    async fn derive_window(
        &self,
        account: &AccountRow,
        kind: AddressKind,
        from: u32,
        to: u32,
    ) -> Result<Vec<String>, TrackerError> {
        let mut window = Vec::with_capacity((to - from) as usize);
        for index in from..to {
            let address = self.deriver.derive(
                &account.xpub,
                account.network,
                account.script_type,
                kind,
                index,
            )?;
            accounts::upsert_address(&self.pool, account.id, &address, kind, index).await?;
            window.push(address);
        }
        Ok(window)
    }

    async fn fetch_histories(
        &self,
        network: Network,
        addresses: &[String],
    ) -> Result<Vec<RawTx>, TrackerError> {
        let adapter = self.adapters.get(network)?;
        let batches = addresses
            .chunks(ADDRESS_BATCH_SIZE)
            .map(|chunk| adapter.transactions_for_addresses(chunk));
        let results = try_join_all(batches).await?;
        Ok(results.into_iter().flatten().collect())
    }

    async fn ingest(
        &self,
        network: Network,
        raw_txs: &[RawTx],
        tracked: &HashSet<String>,
    ) -> Result<Vec<LedgerEntry>, TrackerError> {
        let envelopes = extract_envelopes(raw_txs, tracked);
        let mut entries = Vec::new();
        for envelope in &envelopes {
            entries.extend(upsert_envelope(&self.pool, network, envelope).await?);
        }
        Ok(entries)
    }

    // ========================================================================
    // Address issuance
    // ========================================================================

    /// Returns `count` unused receive addresses, extending the derivation
    /// chain when fewer are on hand.
    pub async fn receive_addresses(
        &self,
        xpub: &str,
        network: Network,
        script_type: ScriptType,
        count: usize,
    ) -> Result<Vec<AddressRow>, TrackerError> {
        self.issue(xpub, network, script_type, AddressKind::Receive, count)
            .await
    }

    /// Returns one unused change address.
    pub async fn change_address(
        &self,
        xpub: &str,
        network: Network,
        script_type: ScriptType,
    ) -> Result<AddressRow, TrackerError> {
        let mut rows = self
            .issue(xpub, network, script_type, AddressKind::Change, 1)
            .await?;
        // issue() errors rather than under-delivering, so the pop is total.
        rows.pop().ok_or(TrackerError::NotEnoughAddresses {
            requested: 1,
            available: 0,
        })
    }

    async fn issue(
        &self,
        xpub: &str,
        network: Network,
        script_type: ScriptType,
        kind: AddressKind,
        count: usize,
    ) -> Result<Vec<AddressRow>, TrackerError> {
        if network.is_account_model() {
            return Err(TrackerError::IssuanceUnsupported(network));
        }
        let account = accounts::get_account(&self.pool, xpub, network, script_type)
            .await?
            .ok_or_else(|| TrackerError::AccountNotRegistered {
                xpub: xpub.to_string(),
                network,
            })?;

        let unused = accounts::unused_addresses(&self.pool, account.id, kind, count as i64).await?;
        if unused.len() >= count {
            return Ok(unused);
        }

        // Short on fresh addresses: extend the chain past the current end and
        // scan the extension so any out-of-band use is caught before issuing.
        let shortfall = count - unused.len();
        let from = match accounts::max_address_index(&self.pool, account.id, kind).await? {
            Some(max) => max + 1,
            None => 0,
        };
        let to = from + shortfall as u32 + GAP_LIMIT;
        let window = self.derive_window(&account, kind, from, to).await?;
        let raw_txs = self.fetch_histories(network, &window).await?;
        let tracked: HashSet<String> = window.into_iter().collect();
        self.ingest(network, &raw_txs, &tracked).await?;

        let unused = accounts::unused_addresses(&self.pool, account.id, kind, count as i64).await?;
        if unused.len() < count {
            return Err(TrackerError::NotEnoughAddresses {
                requested: count,
                available: unused.len(),
            });
        }
        Ok(unused)
    }
}
