//! Account and address registry storage.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::error::TrackerError;
use crate::pool::Pool;
use crate::types::{AccountId, AddressId, AddressKind, Network, ScriptType, SyncStatus};

/// A registered account.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: AccountId,
    pub xpub: String,
    pub network: Network,
    pub script_type: ScriptType,
    pub sync_status: SyncStatus,
    pub migrated: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let network: String = row.try_get("network")?;
        let script_type: String = row.try_get("script_type")?;
        let sync_status: String = row.try_get("sync_status")?;
        let decode = |e: TrackerError| sqlx::Error::Decode(Box::new(e));
        Ok(Self {
            id: AccountId(row.try_get("id")?),
            xpub: row.try_get("xpub")?,
            network: network.parse().map_err(decode)?,
            script_type: ScriptType::decode(&script_type).map_err(decode)?,
            sync_status: SyncStatus::decode(&sync_status).map_err(decode)?,
            migrated: row.try_get("migrated")?,
            registered_at: row.try_get("registered_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A tracked address belonging to an account.
#[derive(Debug, Clone)]
pub struct AddressRow {
    pub id: AddressId,
    pub account_id: AccountId,
    pub address: String,
    pub kind: AddressKind,
    pub relpath: String,
    pub idx: u32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AddressRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let idx: i32 = row.try_get("idx")?;
        Ok(Self {
            id: AddressId(row.try_get("id")?),
            account_id: AccountId(row.try_get("account_id")?),
            address: row.try_get("address")?,
            kind: AddressKind::decode(&kind).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            relpath: row.try_get("relpath")?,
            idx: idx as u32,
        })
    }
}

// ============================================================================
// Account management
// ============================================================================

/// Creates the account if it does not exist, returning the row and whether it
/// was created by this call.
pub async fn get_or_create_account(
    pool: &Pool,
    xpub: &str,
    network: Network,
    script_type: ScriptType,
) -> Result<(AccountRow, bool), TrackerError> {
    let inserted: Option<AccountRow> = sqlx::query_as(
        "INSERT INTO accounts (xpub, network, script_type)
         VALUES ($1, $2, $3)
         ON CONFLICT (xpub, network, script_type) DO NOTHING
         RETURNING id, xpub, network, script_type, sync_status, migrated, registered_at, updated_at",
    )
    .bind(xpub)
    .bind(network.as_str())
    .bind(script_type.encode())
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok((row, true));
    }

    let existing = get_account(pool, xpub, network, script_type)
        .await?
        .ok_or_else(|| TrackerError::AccountNotRegistered {
            xpub: xpub.to_string(),
            network,
        })?;
    Ok((existing, false))
}

pub async fn get_account(
    pool: &Pool,
    xpub: &str,
    network: Network,
    script_type: ScriptType,
) -> Result<Option<AccountRow>, TrackerError> {
    let row: Option<AccountRow> = sqlx::query_as(
        "SELECT id, xpub, network, script_type, sync_status, migrated, registered_at, updated_at
         FROM accounts
         WHERE xpub = $1 AND network = $2 AND script_type = $3",
    )
    .bind(xpub)
    .bind(network.as_str())
    .bind(script_type.encode())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_account_by_id(
    pool: &Pool,
    account_id: AccountId,
) -> Result<Option<AccountRow>, TrackerError> {
    let row: Option<AccountRow> = sqlx::query_as(
        "SELECT id, xpub, network, script_type, sync_status, migrated, registered_at, updated_at
         FROM accounts WHERE id = $1",
    )
    .bind(account_id.0)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn update_sync_status(
    pool: &Pool,
    account_id: AccountId,
    status: SyncStatus,
) -> Result<(), TrackerError> {
    sqlx::query("UPDATE accounts SET sync_status = $1, updated_at = now() WHERE id = $2")
        .bind(status.encode())
        .bind(account_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_migrated(
    pool: &Pool,
    account_id: AccountId,
    migrated: bool,
) -> Result<(), TrackerError> {
    sqlx::query("UPDATE accounts SET migrated = $1, updated_at = now() WHERE id = $2")
        .bind(migrated)
        .bind(account_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

/// Removes the account and, via cascade, its addresses, transactions, and
/// balance changes.
pub async fn delete_account(pool: &Pool, account_id: AccountId) -> Result<(), TrackerError> {
    sqlx::query("DELETE FROM accounts WHERE id = $1")
        .bind(account_id.0)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clears the account's derived history ahead of a from-scratch re-sync. The
/// account row itself survives so its identity and registration time hold.
pub async fn clear_account_history(pool: &Pool, account_id: AccountId) -> Result<(), TrackerError> {
    let mut db_tx = pool.begin().await?;
    sqlx::query("DELETE FROM transactions WHERE account_id = $1")
        .bind(account_id.0)
        .execute(&mut *db_tx)
        .await?;
    sqlx::query("DELETE FROM addresses WHERE account_id = $1")
        .bind(account_id.0)
        .execute(&mut *db_tx)
        .await?;
    db_tx.commit().await?;
    Ok(())
}

// ============================================================================
// Address management
// ============================================================================

/// Records a derived address, updating nothing if it is already present.
pub async fn upsert_address(
    pool: &Pool,
    account_id: AccountId,
    address: &str,
    kind: AddressKind,
    index: u32,
) -> Result<AddressId, TrackerError> {
    let id: (i64,) = sqlx::query_as(
        "INSERT INTO addresses (account_id, address, kind, relpath, idx)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (address, account_id) DO UPDATE SET address = EXCLUDED.address
         RETURNING id",
    )
    .bind(account_id.0)
    .bind(address)
    .bind(kind.encode())
    .bind(kind.relpath(index))
    .bind(index as i32)
    .fetch_one(pool)
    .await?;
    Ok(AddressId(id.0))
}

pub async fn get_address(
    pool: &Pool,
    account_id: AccountId,
    address: &str,
) -> Result<Option<AddressRow>, TrackerError> {
    let row: Option<AddressRow> = sqlx::query_as(
        "SELECT id, account_id, address, kind, relpath, idx
         FROM addresses WHERE account_id = $1 AND address = $2",
    )
    .bind(account_id.0)
    .bind(address)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Filters a candidate set down to the addresses tracked on the network,
/// returning each with its owning account.
pub async fn tracked_addresses(
    pool: &Pool,
    network: Network,
    candidates: &[String],
) -> Result<Vec<AddressRow>, TrackerError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<AddressRow> = sqlx::query_as(
        "SELECT a.id, a.account_id, a.address, a.kind, a.relpath, a.idx
         FROM addresses a
         JOIN accounts ac ON ac.id = a.account_id
         WHERE ac.network = $1 AND a.address = ANY($2)",
    )
    .bind(network.as_str())
    .bind(candidates)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// All addresses tracked for one account.
pub async fn account_addresses(
    pool: &Pool,
    account_id: AccountId,
) -> Result<Vec<AddressRow>, TrackerError> {
    let rows: Vec<AddressRow> = sqlx::query_as(
        "SELECT id, account_id, address, kind, relpath, idx
         FROM addresses WHERE account_id = $1
         ORDER BY kind, idx",
    )
    .bind(account_id.0)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The highest derived index on the given chain, if any address exists there.
pub async fn max_address_index(
    pool: &Pool,
    account_id: AccountId,
    kind: AddressKind,
) -> Result<Option<u32>, TrackerError> {
    let max: (Option<i32>,) = sqlx::query_as(
        "SELECT MAX(idx) FROM addresses WHERE account_id = $1 AND kind = $2",
    )
    .bind(account_id.0)
    .bind(kind.encode())
    .fetch_one(pool)
    .await?;
    Ok(max.0.map(|i| i as u32))
}

/// Addresses on the given chain with no ledger activity, lowest index first.
pub async fn unused_addresses(
    pool: &Pool,
    account_id: AccountId,
    kind: AddressKind,
    limit: i64,
) -> Result<Vec<AddressRow>, TrackerError> {
    let rows: Vec<AddressRow> = sqlx::query_as(
        "SELECT a.id, a.account_id, a.address, a.kind, a.relpath, a.idx
         FROM addresses a
         WHERE a.account_id = $1 AND a.kind = $2
           AND NOT EXISTS (
             SELECT 1 FROM balance_changes bc WHERE bc.address_id = a.id
           )
         ORDER BY a.idx
         LIMIT $3",
    )
    .bind(account_id.0)
    .bind(kind.encode())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
