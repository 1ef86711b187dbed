//! On-chain balance snapshots.
//!
//! The ledger's balance-change sums are the source of truth for history, but
//! downstream consumers also want the chain's own view of an address (which
//! includes mempool effects and anything the ledger has not seen yet). The
//! refresher queries adapters for those snapshots and caches them in
//! `account_balances`, debounced so a burst of activity on one address does
//! not hammer the upstream source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, warn};

use crate::adapter::{AdapterRegistry, AssetRef, TokenMeta};
use crate::error::TrackerError;
use crate::ledger::supported_tokens;
use crate::pool::Pool;
use crate::types::{AccountId, Network, BALANCE_REFRESH_TTL};

/// Snapshot balance types. `R` marks a regular spendable balance; staked and
/// unbonding variants exist for chains whose adapters report them.
pub const BALANCE_TYPE_REGULAR: &str = "R";
pub const BALANCE_TYPE_STAKED: &str = "S";
pub const BALANCE_TYPE_UNBONDING: &str = "U";

/// A cached balance snapshot row.
#[derive(Debug, Clone)]
pub struct AccountBalanceRow {
    pub id: i64,
    pub account_id: AccountId,
    pub network: Network,
    pub symbol: String,
    pub address: String,
    /// The asset identifier: the network ticker for native balances, the
    /// contract address for token balances.
    pub identifier: String,
    pub balance_type: String,
    pub balance: BigDecimal,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AccountBalanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let network: String = row.try_get("network")?;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: AccountId(row.try_get("account_id")?),
            network: network
                .parse()
                .map_err(|e: TrackerError| sqlx::Error::Decode(Box::new(e)))?,
            symbol: row.try_get("symbol")?,
            address: row.try_get("address")?,
            identifier: row.try_get("identifier")?,
            balance_type: row.try_get("balance_type")?,
            balance: row.try_get("balance")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Upserts one snapshot row. Zero balances are written, not skipped; an
/// address that spent everything must overwrite its stale positive snapshot.
pub async fn store_balance(
    pool: &Pool,
    account_id: AccountId,
    network: Network,
    symbol: &str,
    address: &str,
    identifier: &str,
    balance_type: &str,
    balance: &BigDecimal,
) -> Result<(), TrackerError> {
    sqlx::query(
        "INSERT INTO account_balances
             (account_id, network, symbol, address, identifier, balance_type, balance)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (network, address, identifier, balance_type)
         DO UPDATE SET
             account_id = EXCLUDED.account_id,
             symbol = EXCLUDED.symbol,
             balance = EXCLUDED.balance,
             updated_at = now()",
    )
    .bind(account_id.0)
    .bind(network.as_str())
    .bind(symbol)
    .bind(address)
    .bind(identifier)
    .bind(balance_type)
    .bind(balance)
    .execute(pool)
    .await?;
    Ok(())
}

/// All cached snapshots for an address on a network.
pub async fn address_balances(
    pool: &Pool,
    network: Network,
    address: &str,
) -> Result<Vec<AccountBalanceRow>, TrackerError> {
    let rows: Vec<AccountBalanceRow> = sqlx::query_as(
        "SELECT id, account_id, network, symbol, address, identifier, balance_type,
                balance, updated_at
         FROM account_balances
         WHERE network = $1 AND address = $2
         ORDER BY identifier, balance_type",
    )
    .bind(network.as_str())
    .bind(address)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Debounced snapshot refresher.
pub struct BalanceRefresher {
    pool: Pool,
    adapters: AdapterRegistry,
    markers: Mutex<HashMap<(Network, String), Instant>>,
    ttl: Duration,
}

impl BalanceRefresher {
    pub fn new(pool: Pool, adapters: AdapterRegistry) -> Self {
        Self::with_ttl(pool, adapters, BALANCE_REFRESH_TTL)
    }

    pub fn with_ttl(pool: Pool, adapters: AdapterRegistry, ttl: Duration) -> Self {
        Self {
            pool,
            adapters,
            markers: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Schedules background refreshes for the given addresses, skipping any
    /// refreshed within the TTL. Failures are logged, never propagated; a
    /// stale snapshot is not worth failing a sync pass over.
    pub fn maybe_refresh(
        self: &Arc<Self>,
        network: Network,
        touched: Vec<(AccountId, String)>,
    ) {
        let now = Instant::now();
        let due: Vec<(AccountId, String)> = {
            let mut markers = match self.markers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Expired markers are dropped here so the map stays bounded by
            // the set of addresses touched within one TTL, not by every
            // address ever seen.
            markers.retain(|_, last| now.duration_since(*last) < self.ttl);
            touched
                .into_iter()
                .filter(|(_, address)| {
                    let key = (network, address.clone());
                    match markers.get(&key) {
                        Some(_) => false,
                        None => {
                            markers.insert(key, now);
                            true
                        }
                    }
                })
                .collect()
        };

        for (account_id, address) in due {
            let refresher = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = refresher.refresh_now(account_id, network, &address).await {
                    warn!(
                        network = %network,
                        address = %address,
                        error = %e,
                        "balance refresh failed"
                    );
                }
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn marker_count(&self) -> usize {
        match self.markers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Fetches and stores the address's native snapshot, plus one per
    /// supported token on token-capable networks.
    pub async fn refresh_now(
        &self,
        account_id: AccountId,
        network: Network,
        address: &str,
    ) -> Result<(), TrackerError> {
        let adapter = self.adapters.get(network)?;

        let native = adapter.balance(address, &AssetRef::Native).await?;
        store_balance(
            &self.pool,
            account_id,
            network,
            network.as_str(),
            address,
            network.as_str(),
            BALANCE_TYPE_REGULAR,
            &native,
        )
        .await?;

        if network.supports_tokens() {
            for token in supported_tokens(&self.pool).await? {
                let meta = TokenMeta {
                    contract_address: token.contract_address.clone(),
                    name: token.name.clone().unwrap_or_default(),
                    symbol: token.symbol.clone().unwrap_or_default(),
                    precision: token.precision,
                };
                let balance = adapter.balance(address, &AssetRef::Token(meta)).await?;
                store_balance(
                    &self.pool,
                    account_id,
                    network,
                    token.symbol.as_deref().unwrap_or(""),
                    address,
                    &token.contract_address,
                    BALANCE_TYPE_REGULAR,
                    &balance,
                )
                .await?;
            }
        }

        debug!(network = %network, address = %address, "balance snapshot refreshed");
        Ok(())
    }
}
