//! Processed-block frontier storage.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::adapter::ChainBlock;
use crate::error::TrackerError;
use crate::pool::Pool;
use crate::types::Network;

/// A block the tracker has ingested, canonical or orphaned.
#[derive(Debug, Clone)]
pub struct ProcessedBlockRow {
    pub id: i64,
    pub network: Network,
    pub block_height: i64,
    pub block_hash: String,
    pub block_time: DateTime<Utc>,
    pub previous_hash: String,
    pub processed_at: DateTime<Utc>,
    pub is_orphaned: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProcessedBlockRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let network: String = row.try_get("network")?;
        Ok(Self {
            id: row.try_get("id")?,
            network: network
                .parse()
                .map_err(|e: TrackerError| sqlx::Error::Decode(Box::new(e)))?,
            block_height: row.try_get("block_height")?,
            block_hash: row.try_get("block_hash")?,
            block_time: row.try_get("block_time")?,
            previous_hash: row.try_get("previous_hash")?,
            processed_at: row.try_get("processed_at")?,
            is_orphaned: row.try_get("is_orphaned")?,
        })
    }
}

const COLUMNS: &str =
    "id, network, block_height, block_hash, block_time, previous_hash, processed_at, is_orphaned";

/// The highest non-orphaned block recorded for the network.
pub async fn latest_block(
    pool: &Pool,
    network: Network,
) -> Result<Option<ProcessedBlockRow>, TrackerError> {
    let row: Option<ProcessedBlockRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM processed_blocks
         WHERE network = $1 AND NOT is_orphaned
         ORDER BY block_height DESC LIMIT 1"
    ))
    .bind(network.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_by_hash(
    pool: &Pool,
    network: Network,
    block_hash: &str,
) -> Result<Option<ProcessedBlockRow>, TrackerError> {
    let row: Option<ProcessedBlockRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM processed_blocks WHERE network = $1 AND block_hash = $2"
    ))
    .bind(network.as_str())
    .bind(block_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Records a processed block.
///
/// If the hash was previously recorded (including as an orphan that the chain
/// has since re-adopted), the existing row is un-orphaned and refreshed
/// instead of duplicated.
pub async fn record_block(
    pool: &Pool,
    network: Network,
    block: &ChainBlock,
) -> Result<ProcessedBlockRow, TrackerError> {
    let row: ProcessedBlockRow = sqlx::query_as(&format!(
        "INSERT INTO processed_blocks
             (network, block_height, block_hash, block_time, previous_hash)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (network, block_hash) DO UPDATE SET
             is_orphaned = FALSE,
             block_time = EXCLUDED.block_time,
             previous_hash = EXCLUDED.previous_hash,
             processed_at = now()
         RETURNING {COLUMNS}"
    ))
    .bind(network.as_str())
    .bind(block.height)
    .bind(&block.hash)
    .bind(block.time)
    .bind(&block.previous_hash)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn mark_orphaned(
    pool: &Pool,
    network: Network,
    block_hash: &str,
) -> Result<(), TrackerError> {
    sqlx::query(
        "UPDATE processed_blocks SET is_orphaned = TRUE
         WHERE network = $1 AND block_hash = $2",
    )
    .bind(network.as_str())
    .bind(block_hash)
    .execute(pool)
    .await?;
    Ok(())
}
