//! Ledger storage: per-account transaction rows and balance changes.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;

use crate::adapter::TokenMeta;
use crate::error::TrackerError;
use crate::extract::TxEnvelope;
use crate::pool::Pool;
use crate::types::{confirmations, AccountId, AddressId, BlockRef, Network, TxRef};

pub mod accounts;

use accounts::tracked_addresses;

// ============================================================================
// Row types
// ============================================================================

/// Settlement state of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
}

/// One per-account ledger transaction row.
#[derive(Debug, Clone)]
pub struct LedgerTransaction {
    pub id: TxRef,
    pub account_id: AccountId,
    pub txid: String,
    pub block_height: Option<i64>,
    pub block_hash: Option<String>,
    pub block_time: Option<DateTime<Utc>>,
    pub token_id: Option<i64>,
    pub is_token_transfer: bool,
    pub is_token_fee: bool,
    pub is_dex_trade: bool,
    pub success: bool,
    pub memo: Option<String>,
    pub fee: Option<BigDecimal>,
}

impl LedgerTransaction {
    /// Pending until a block is recorded for the row.
    pub fn status(&self) -> TxStatus {
        if self.block_height.is_some() {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        }
    }

    /// Confirmation count relative to the given chain tip.
    pub fn confirmations(&self, latest_height: i64) -> Option<i64> {
        confirmations(latest_height, self.block_height)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for LedgerTransaction {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: TxRef(row.try_get("id")?),
            account_id: AccountId(row.try_get("account_id")?),
            txid: row.try_get("txid")?,
            block_height: row.try_get("block_height")?,
            block_hash: row.try_get("block_hash")?,
            block_time: row.try_get("block_time")?,
            token_id: row.try_get("token_id")?,
            is_token_transfer: row.try_get("is_token_transfer")?,
            is_token_fee: row.try_get("is_token_fee")?,
            is_dex_trade: row.try_get("is_dex_trade")?,
            success: row.try_get("success")?,
            memo: row.try_get("memo")?,
            fee: row.try_get("fee")?,
        })
    }
}

/// A token contract the ledger has observed.
#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub contract_address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub precision: i32,
    pub supported: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TokenRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            contract_address: row.try_get("contract_address")?,
            name: row.try_get("name")?,
            symbol: row.try_get("symbol")?,
            precision: row.try_get("precision")?,
            supported: row.try_get("supported")?,
        })
    }
}

/// A ledger row as written by [`upsert_envelope`], carrying everything the
/// notifier and balance refresher need without further queries.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account_id: AccountId,
    pub xpub: String,
    pub network: Network,
    pub txid: String,
    pub address: String,
    pub amount: BigDecimal,
    /// Token symbol for token rows, the network ticker otherwise.
    pub symbol: String,
    pub is_token_transfer: bool,
    pub is_token_fee: bool,
    pub is_dex_trade: bool,
    pub memo: Option<String>,
    pub block: Option<BlockRef>,
    pub token: Option<TokenMeta>,
}

// ============================================================================
// Token metadata
// ============================================================================

/// Records token metadata on first observation. Name and symbol refresh on
/// conflict so corrected upstream metadata propagates.
pub async fn get_or_create_token(pool: &Pool, meta: &TokenMeta) -> Result<TokenRow, TrackerError> {
    let row: TokenRow = sqlx::query_as(
        "INSERT INTO tokens (contract_address, name, symbol, precision)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (contract_address) DO UPDATE
             SET name = EXCLUDED.name,
                 symbol = EXCLUDED.symbol,
                 precision = EXCLUDED.precision
         RETURNING id, contract_address, name, symbol, precision, supported",
    )
    .bind(&meta.contract_address)
    .bind(&meta.name)
    .bind(&meta.symbol)
    .bind(meta.precision)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Marks a token as supported, opting it into proactive balance refresh.
pub async fn set_token_supported(
    pool: &Pool,
    contract_address: &str,
    supported: bool,
) -> Result<(), TrackerError> {
    sqlx::query("UPDATE tokens SET supported = $1 WHERE contract_address = $2")
        .bind(supported)
        .bind(contract_address)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn supported_tokens(pool: &Pool) -> Result<Vec<TokenRow>, TrackerError> {
    let rows: Vec<TokenRow> = sqlx::query_as(
        "SELECT id, contract_address, name, symbol, precision, supported
         FROM tokens WHERE supported ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ============================================================================
// Envelope upsert
// ============================================================================

/// Writes one extracted envelope to the ledger.
///
/// Addresses that resolve to tracked accounts are grouped by account; each
/// account gets one `transactions` row and one `balance_changes` row per
/// touched address, all within a single database transaction. Replaying the
/// same envelope is a no-op beyond refreshing the mutable block fields, so
/// tip re-processing and scan/tracker overlap are harmless.
pub async fn upsert_envelope(
    pool: &Pool,
    network: Network,
    envelope: &TxEnvelope,
) -> Result<Vec<LedgerEntry>, TrackerError> {
    let candidates: Vec<String> = envelope
        .changes
        .iter()
        .map(|d| d.address.clone())
        .collect();
    let resolved = tracked_addresses(pool, network, &candidates).await?;
    if resolved.is_empty() {
        return Ok(Vec::new());
    }

    let token = match &envelope.token {
        Some(meta) => Some(get_or_create_token(pool, meta).await?),
        None => None,
    };
    let token_id = token.as_ref().map(|t| t.id);
    let symbol = match (&envelope.token, envelope.is_token_fee) {
        // Fee rows are native-denominated even when token metadata is
        // attached for context.
        (Some(meta), false) => meta.symbol.clone(),
        _ => network.as_str().to_string(),
    };

    // (account, address_id, address, amount) tuples to write.
    let mut writes: Vec<(AccountId, AddressId, String, BigDecimal)> = Vec::new();
    for delta in &envelope.changes {
        for row in resolved.iter().filter(|r| r.address == delta.address) {
            writes.push((
                row.account_id,
                row.id,
                row.address.clone(),
                delta.amount.clone(),
            ));
        }
    }
    writes.sort_by_key(|(account, address, _, _)| (*account, address.0));

    let raw = envelope.raw.to_string();
    let (block_height, block_hash, block_time) = match &envelope.block {
        Some(b) => (Some(b.height), Some(b.hash.clone()), Some(b.time)),
        None => (None, None, None),
    };

    let mut db_tx = pool.begin().await?;
    let mut entries = Vec::new();
    let mut current_account: Option<(AccountId, TxRef)> = None;

    for (account_id, address_id, address, amount) in &writes {
        let tx_ref = match current_account {
            Some((acct, tx_ref)) if acct == *account_id => tx_ref,
            _ => {
                let id: (i64,) = sqlx::query_as(
                    "INSERT INTO transactions
                         (account_id, txid, block_height, block_hash, block_time, raw,
                          token_id, is_token_transfer, is_token_fee, is_dex_trade,
                          success, memo, fee)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                     ON CONFLICT (account_id, txid, COALESCE(token_id, 0), is_token_fee,
                                  COALESCE(memo, ''))
                     DO UPDATE SET
                         block_height = EXCLUDED.block_height,
                         block_hash = EXCLUDED.block_hash,
                         block_time = EXCLUDED.block_time,
                         raw = EXCLUDED.raw,
                         is_dex_trade = EXCLUDED.is_dex_trade,
                         success = EXCLUDED.success,
                         fee = EXCLUDED.fee
                     RETURNING id",
                )
                .bind(account_id.0)
                .bind(&envelope.txid)
                .bind(block_height)
                .bind(&block_hash)
                .bind(block_time)
                .bind(&raw)
                .bind(token_id)
                .bind(envelope.is_token_transfer)
                .bind(envelope.is_token_fee)
                .bind(envelope.is_dex_trade)
                .bind(envelope.success)
                .bind(&envelope.memo)
                .bind(&envelope.fee)
                .fetch_one(&mut *db_tx)
                .await?;
                let tx_ref = TxRef(id.0);
                current_account = Some((*account_id, tx_ref));
                tx_ref
            }
        };

        sqlx::query(
            "INSERT INTO balance_changes (account_id, address_id, transaction_id, amount)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (account_id, address_id, transaction_id)
             DO UPDATE SET amount = EXCLUDED.amount",
        )
        .bind(account_id.0)
        .bind(address_id.0)
        .bind(tx_ref.0)
        .bind(amount)
        .execute(&mut *db_tx)
        .await?;

        entries.push((*account_id, address.clone(), amount.clone()));
    }

    db_tx.commit().await?;

    // Account xpubs are attached after commit; the notifier needs them and
    // the lookup must not hold the write transaction open.
    let mut out = Vec::with_capacity(entries.len());
    for (account_id, address, amount) in entries {
        let account = accounts::get_account_by_id(pool, account_id)
            .await?
            .ok_or_else(|| {
                TrackerError::CorruptedData(format!(
                    "account {account_id} vanished during envelope upsert"
                ))
            })?;
        out.push(LedgerEntry {
            account_id,
            xpub: account.xpub,
            network,
            txid: envelope.txid.clone(),
            address,
            amount,
            symbol: symbol.clone(),
            is_token_transfer: envelope.is_token_transfer,
            is_token_fee: envelope.is_token_fee,
            is_dex_trade: envelope.is_dex_trade,
            memo: envelope.memo.clone(),
            block: envelope.block.clone(),
            token: envelope.token.clone(),
        });
    }

    debug!(
        txid = %envelope.txid,
        network = %network,
        rows = out.len(),
        "ledger envelope written"
    );
    Ok(out)
}

// ============================================================================
// Orphan cascade
// ============================================================================

/// Deletes all ledger rows attributed to the given block. Called by the
/// orphan resolver after the block is marked orphaned; the transactions and
/// their balance changes are rediscovered from the replacing canonical block.
pub async fn delete_ledger_rows_for_block(
    pool: &Pool,
    network: Network,
    block_hash: &str,
) -> Result<u64, TrackerError> {
    let result = sqlx::query(
        "DELETE FROM transactions t
         USING accounts ac
         WHERE t.account_id = ac.id
           AND ac.network = $1
           AND t.block_hash = $2",
    )
    .bind(network.as_str())
    .bind(block_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ============================================================================
// Repair and queries
// ============================================================================

/// Marks still-pending rows for the given txids as confirmed in `block`.
/// Rows already confirmed elsewhere are left alone.
pub async fn confirm_pending(
    pool: &Pool,
    network: Network,
    txid: &str,
    block: &BlockRef,
) -> Result<u64, TrackerError> {
    let result = sqlx::query(
        "UPDATE transactions t
         SET block_height = $3, block_hash = $4, block_time = $5
         FROM accounts ac
         WHERE t.account_id = ac.id
           AND ac.network = $1
           AND t.txid = $2
           AND t.block_height IS NULL",
    )
    .bind(network.as_str())
    .bind(txid)
    .bind(block.height)
    .bind(&block.hash)
    .bind(block.time)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Full ledger history for an account, newest first, pending rows leading.
pub async fn account_transactions(
    pool: &Pool,
    account_id: AccountId,
) -> Result<Vec<LedgerTransaction>, TrackerError> {
    let rows: Vec<LedgerTransaction> = sqlx::query_as(
        "SELECT id, account_id, txid, block_height, block_hash, block_time,
                token_id, is_token_transfer, is_token_fee, is_dex_trade,
                success, memo, fee
         FROM transactions
         WHERE account_id = $1
         ORDER BY block_height DESC NULLS FIRST, id DESC",
    )
    .bind(account_id.0)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Native-asset balance of an account: the sum of its balance changes,
/// excluding token-denominated rows.
pub async fn account_balance(
    pool: &Pool,
    account_id: AccountId,
) -> Result<BigDecimal, TrackerError> {
    let sum: (Option<BigDecimal>,) = sqlx::query_as(
        "SELECT SUM(bc.amount)
         FROM balance_changes bc
         JOIN transactions t ON t.id = bc.transaction_id
         WHERE bc.account_id = $1 AND NOT t.is_token_transfer",
    )
    .bind(account_id.0)
    .fetch_one(pool)
    .await?;
    Ok(sum.0.unwrap_or_else(|| BigDecimal::from(0)))
}

/// Native-asset balance of a single tracked address.
pub async fn address_balance(
    pool: &Pool,
    address_id: AddressId,
) -> Result<BigDecimal, TrackerError> {
    let sum: (Option<BigDecimal>,) = sqlx::query_as(
        "SELECT SUM(bc.amount)
         FROM balance_changes bc
         JOIN transactions t ON t.id = bc.transaction_id
         WHERE bc.address_id = $1 AND NOT t.is_token_transfer",
    )
    .bind(address_id.0)
    .fetch_one(pool)
    .await?;
    Ok(sum.0.unwrap_or_else(|| BigDecimal::from(0)))
}
