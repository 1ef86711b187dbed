//! Core types for the chain tracker.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::TrackerError;

/// Number of consecutive unused derived addresses scanned before discovery
/// stops.
///
/// The same limit is applied to both the external (receive) and internal
/// (change) derivation chains. Wallets that misfile change onto the external
/// chain are still discovered, at the cost of scanning a little further.
pub const GAP_LIMIT: u32 = 20;

/// Number of addresses per adapter history lookup during a scan window.
pub const ADDRESS_BATCH_SIZE: usize = 10;

/// A SYNCING account whose last update is older than this is considered
/// abandoned and may be re-entered by a new registration.
pub const STALE_SYNC_SECS: i64 = 900;

/// Maximum number of blocks the orphan resolver will walk backward before
/// giving up with [`TrackerError::ReorgTooDeep`]. Reorgs deeper than this are
/// repaired by an operator-triggered hard refresh instead.
pub const MAX_REORG_DEPTH: u32 = 100;

/// Debounce window for balance snapshot refreshes per (network, address).
pub const BALANCE_REFRESH_TTL: Duration = Duration::from_secs(30);

/// The closed set of networks the tracker can ingest.
///
/// Dispatch on networks goes through this enum and the
/// [`AdapterRegistry`](crate::adapter::AdapterRegistry); an unknown network
/// string fails fast at the boundary instead of propagating into the sync
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Network {
    Btc,
    Bch,
    Ltc,
    Doge,
    Dash,
    Dgb,
    Eth,
    Atom,
    Rune,
    Kava,
    Scrt,
    Osmo,
    Bnb,
    Xrp,
    Eos,
    Fio,
}

impl Network {
    pub const ALL: [Network; 16] = [
        Network::Btc,
        Network::Bch,
        Network::Ltc,
        Network::Doge,
        Network::Dash,
        Network::Dgb,
        Network::Eth,
        Network::Atom,
        Network::Rune,
        Network::Kava,
        Network::Scrt,
        Network::Osmo,
        Network::Bnb,
        Network::Xrp,
        Network::Eos,
        Network::Fio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Btc => "BTC",
            Network::Bch => "BCH",
            Network::Ltc => "LTC",
            Network::Doge => "DOGE",
            Network::Dash => "DASH",
            Network::Dgb => "DGB",
            Network::Eth => "ETH",
            Network::Atom => "ATOM",
            Network::Rune => "RUNE",
            Network::Kava => "KAVA",
            Network::Scrt => "SCRT",
            Network::Osmo => "OSMO",
            Network::Bnb => "BNB",
            Network::Xrp => "XRP",
            Network::Eos => "EOS",
            Network::Fio => "FIO",
        }
    }

    /// Returns true for chains where the account's own address is the single
    /// tracked address, bypassing HD discovery entirely.
    pub fn is_account_model(&self) -> bool {
        !matches!(
            self,
            Network::Btc
                | Network::Bch
                | Network::Ltc
                | Network::Doge
                | Network::Dash
                | Network::Dgb
        )
    }

    /// The smallest-unit denomination reported in notification messages.
    pub fn balance_units(&self) -> &'static str {
        match self {
            Network::Btc
            | Network::Bch
            | Network::Ltc
            | Network::Doge
            | Network::Dash
            | Network::Dgb => "sats",
            Network::Eth => "wei",
            Network::Atom => "uatom",
            Network::Rune => "rune",
            Network::Kava => "ukava",
            Network::Scrt => "uscrt",
            Network::Osmo => "uosmo",
            Network::Bnb => "jager",
            Network::Xrp => "drops",
            Network::Eos => "eos",
            Network::Fio => "suf",
        }
    }

    /// Returns true for networks whose ledger can carry token (contract)
    /// transfers with separately tracked fee rows.
    pub fn supports_tokens(&self) -> bool {
        matches!(self, Network::Eth)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::ALL
            .iter()
            .find(|n| n.as_str() == s)
            .copied()
            .ok_or_else(|| TrackerError::UnsupportedNetwork(s.to_string()))
    }
}

/// Script type of the keys an HD account derives.
///
/// Account-model networks register with [`ScriptType::P2pkh`] by convention;
/// the value is part of the account identity key but otherwise unused there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
}

impl ScriptType {
    pub fn encode(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2shP2wpkh => "p2sh-p2wpkh",
            ScriptType::P2wpkh => "p2wpkh",
        }
    }

    pub fn decode(s: &str) -> Result<Self, TrackerError> {
        match s {
            "p2pkh" => Ok(ScriptType::P2pkh),
            "p2sh-p2wpkh" => Ok(ScriptType::P2shP2wpkh),
            "p2wpkh" => Ok(ScriptType::P2wpkh),
            other => Err(TrackerError::CorruptedData(format!(
                "script type not recognized: {other}"
            ))),
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Lifecycle of an account's sync workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    NotStarted,
    Syncing,
    Failed,
    Complete,
}

impl SyncStatus {
    pub fn encode(&self) -> &'static str {
        match self {
            SyncStatus::NotStarted => "NOT_STARTED",
            SyncStatus::Syncing => "SYNCING",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Complete => "COMPLETE",
        }
    }

    pub fn decode(s: &str) -> Result<Self, TrackerError> {
        match s {
            "NOT_STARTED" => Ok(SyncStatus::NotStarted),
            "SYNCING" => Ok(SyncStatus::Syncing),
            "FAILED" => Ok(SyncStatus::Failed),
            "COMPLETE" => Ok(SyncStatus::Complete),
            other => Err(TrackerError::CorruptedData(format!(
                "sync status not recognized: {other}"
            ))),
        }
    }
}

/// Which derivation chain an HD address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Receive,
    Change,
}

impl AddressKind {
    pub fn encode(&self) -> &'static str {
        match self {
            AddressKind::Receive => "receive",
            AddressKind::Change => "change",
        }
    }

    pub fn decode(s: &str) -> Result<Self, TrackerError> {
        match s {
            "receive" => Ok(AddressKind::Receive),
            "change" => Ok(AddressKind::Change),
            other => Err(TrackerError::CorruptedData(format!(
                "address kind not recognized: {other}"
            ))),
        }
    }

    /// BIP32 chain component: 0 for the external chain, 1 for change.
    pub fn path_component(&self) -> u32 {
        match self {
            AddressKind::Receive => 0,
            AddressKind::Change => 1,
        }
    }

    /// Derivation coordinate such as `0/5`.
    pub fn relpath(&self, index: u32) -> String {
        format!("{}/{}", self.path_component(), index)
    }
}

/// A typesafe wrapper for the primary key of a row in the `accounts` table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub i64);

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        AccountId(id)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typesafe wrapper for the primary key of a row in the `addresses` table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AddressId(pub i64);

impl From<i64> for AddressId {
    fn from(id: i64) -> Self {
        AddressId(id)
    }
}

/// A typesafe wrapper for the primary key of a row in the `transactions`
/// table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxRef(pub i64);

impl From<i64> for TxRef {
    fn from(id: i64) -> Self {
        TxRef(id)
    }
}

/// Position of a block in its chain: height, hash, and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub height: i64,
    pub hash: String,
    pub time: DateTime<Utc>,
}

/// Number of confirmations for a transaction mined at `block_height`, given
/// the latest chain height. A transaction in the tip block has one
/// confirmation; a pending transaction (no height) has none.
pub fn confirmations(latest_height: i64, block_height: Option<i64>) -> Option<i64> {
    match block_height {
        Some(h) if h > 0 => Some(latest_height + 1 - h),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_round_trip() {
        for network in Network::ALL {
            assert_eq!(network.as_str().parse::<Network>().unwrap(), network);
        }
    }

    #[test]
    fn unknown_network_fails_fast() {
        assert!(matches!(
            "GARBAGE".parse::<Network>(),
            Err(TrackerError::UnsupportedNetwork(_))
        ));
    }

    #[test]
    fn account_model_classification() {
        assert!(!Network::Btc.is_account_model());
        assert!(!Network::Doge.is_account_model());
        assert!(Network::Eth.is_account_model());
        assert!(Network::Atom.is_account_model());
        assert!(Network::Xrp.is_account_model());
    }

    #[test]
    fn confirmation_arithmetic() {
        assert_eq!(confirmations(100, Some(95)), Some(6));
        assert_eq!(confirmations(100, Some(100)), Some(1));
        assert_eq!(confirmations(100, None), None);
        // Height zero means unset, matching explorers that report 0 for
        // unconfirmed transactions.
        assert_eq!(confirmations(100, Some(0)), None);
    }

    #[test]
    fn relpath_coordinates() {
        assert_eq!(AddressKind::Receive.relpath(5), "0/5");
        assert_eq!(AddressKind::Change.relpath(0), "1/0");
    }

    #[test]
    fn codec_round_trips() {
        for kind in [AddressKind::Receive, AddressKind::Change] {
            assert_eq!(AddressKind::decode(kind.encode()).unwrap(), kind);
        }
        for status in [
            SyncStatus::NotStarted,
            SyncStatus::Syncing,
            SyncStatus::Failed,
            SyncStatus::Complete,
        ] {
            assert_eq!(SyncStatus::decode(status.encode()).unwrap(), status);
        }
        for script in [ScriptType::P2pkh, ScriptType::P2shP2wpkh, ScriptType::P2wpkh] {
            assert_eq!(ScriptType::decode(script.encode()).unwrap(), script);
        }
    }
}
