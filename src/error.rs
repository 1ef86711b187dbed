//! Error types for the chain tracker.

use std::fmt;

use crate::types::Network;

/// Errors that can occur while tracking chains.
#[derive(Debug)]
pub enum TrackerError {
    /// An error occurred executing a SQL query.
    DbError(sqlx::Error),

    /// An error occurred running database migrations.
    MigrationError(Box<sqlx::migrate::MigrateError>),

    /// An error occurred during IO.
    Io(std::io::Error),

    /// A network string did not match any supported network.
    UnsupportedNetwork(String),

    /// No adapter has been registered for the given network.
    AdapterMissing(Network),

    /// The account for the given key was not found.
    AccountNotRegistered {
        /// The account's extended public key or chain address.
        xpub: String,
        /// The network the account was looked up on.
        network: Network,
    },

    /// Address issuance was requested for a network that does not derive
    /// addresses.
    IssuanceUnsupported(Network),

    /// Fewer unused addresses were available than were requested, even after
    /// extending the derivation chain.
    NotEnoughAddresses {
        /// The number of addresses requested.
        requested: usize,
        /// The number of addresses available.
        available: usize,
    },

    /// The orphan resolver walked past its depth bound without reaching a
    /// canonical block.
    ReorgTooDeep {
        /// The network on which the reorg was detected.
        network: Network,
        /// The number of blocks walked before giving up.
        depth: u32,
    },

    /// A corrupted data error with a descriptive message.
    CorruptedData(String),

    /// A chain adapter call failed.
    Adapter(String),

    /// Publishing a notification message failed.
    Publish(String),

    /// An error occurred deriving an address from an extended public key.
    Derivation(String),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::DbError(e) => write!(f, "Database error: {}", e),
            TrackerError::MigrationError(e) => write!(f, "Migration error: {}", e),
            TrackerError::Io(e) => write!(f, "IO error: {}", e),
            TrackerError::UnsupportedNetwork(s) => write!(f, "Unsupported network: {}", s),
            TrackerError::AdapterMissing(network) => {
                write!(f, "No adapter registered for network {}", network)
            }
            TrackerError::AccountNotRegistered { xpub, network } => {
                write!(f, "Account {} not registered on {}", xpub, network)
            }
            TrackerError::IssuanceUnsupported(network) => {
                write!(f, "Network {} does not derive addresses", network)
            }
            TrackerError::NotEnoughAddresses {
                requested,
                available,
            } => write!(
                f,
                "Not enough unused addresses: requested {}, available {}",
                requested, available
            ),
            TrackerError::ReorgTooDeep { network, depth } => {
                write!(
                    f,
                    "Reorg on {} deeper than {} blocks; hard refresh required",
                    network, depth
                )
            }
            TrackerError::CorruptedData(msg) => write!(f, "Corrupted data: {}", msg),
            TrackerError::Adapter(msg) => write!(f, "Chain adapter error: {}", msg),
            TrackerError::Publish(msg) => write!(f, "Publish error: {}", msg),
            TrackerError::Derivation(msg) => write!(f, "Address derivation error: {}", msg),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::DbError(e) => Some(e),
            TrackerError::MigrationError(e) => Some(e.as_ref()),
            TrackerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for TrackerError {
    fn from(e: sqlx::Error) -> Self {
        TrackerError::DbError(e)
    }
}

impl From<sqlx::migrate::MigrateError> for TrackerError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        TrackerError::MigrationError(Box::new(e))
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        TrackerError::Io(e)
    }
}
