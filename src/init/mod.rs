//! Database initialization and migrations.
//!
//! This module uses SQLx's built-in migration system. Migrations are stored in
//! `migrations/` at the crate root and are embedded into the binary at compile time.

use crate::error::TrackerError;
use crate::pool::Pool;

/// Initializes the tracker database by running all pending migrations.
///
/// This function should be called before using the database. It will create
/// all necessary tables if they don't exist, or update them if migrations
/// are pending.
///
/// Migrations are automatically tracked in the `_sqlx_migrations` table,
/// which SQLx manages internally.
///
/// # Arguments
/// * `pool` - The database connection pool
pub async fn init_tracker_db(pool: &Pool) -> Result<(), TrackerError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
