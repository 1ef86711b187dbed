//! Outbound notification messages.
//!
//! Ledger entries written for a block or scan batch are condensed into one
//! message per (account, transaction) and handed to the injected
//! [`TxPublisher`] after the database commit. Delivery is therefore
//! at-least-once: a crash between commit and publish re-emits the message on
//! the next pass over the same block.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use serde::Serialize;
use tracing::warn;

use crate::error::TrackerError;
use crate::ledger::LedgerEntry;
use crate::types::{AccountId, Network, ScriptType, SyncStatus};

/// Direction of a transaction from the account's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxDirection {
    Send,
    Receive,
    Fee,
}

/// A per-account transaction notification.
///
/// Amounts are serialized as decimal strings in the chain's smallest unit;
/// consumers on the other side of the wire are not expected to parse
/// 78-digit integers as JSON numbers.
#[derive(Debug, Clone, Serialize)]
pub struct TxMessage {
    pub txid: String,
    pub network: String,
    pub symbol: String,
    pub xpub: String,
    pub balance_change: String,
    pub balance_units: String,
    #[serde(rename = "type")]
    pub direction: TxDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockheight: Option<i64>,
    /// Unix epoch seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocktime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_asset_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_asset_amount: Option<String>,
}

/// Registration workflow progress for one account.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusMessage {
    pub xpub: String,
    pub network: String,
    pub script_type: String,
    pub sync_status: String,
}

impl SyncStatusMessage {
    pub fn new(xpub: &str, network: Network, script_type: ScriptType, status: SyncStatus) -> Self {
        Self {
            xpub: xpub.to_string(),
            network: network.as_str().to_string(),
            script_type: script_type.encode().to_string(),
            sync_status: status.encode().to_string(),
        }
    }
}

/// Destination for outbound messages.
///
/// Implementations wrap whatever broker carries notifications downstream,
/// reporting failures as [`TrackerError::Publish`]. Callers log and drop
/// failed transaction messages; the ledger rows they describe are already
/// committed.
#[async_trait]
pub trait TxPublisher: Send + Sync {
    async fn publish_tx(&self, message: &TxMessage) -> Result<(), TrackerError>;
    async fn publish_sync_status(&self, message: &SyncStatusMessage) -> Result<(), TrackerError>;
}

/// Discards every message. Useful for backfills where downstream consumers
/// must not be replayed an account's whole history.
pub struct NullPublisher;

#[async_trait]
impl TxPublisher for NullPublisher {
    async fn publish_tx(&self, _message: &TxMessage) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn publish_sync_status(&self, _message: &SyncStatusMessage) -> Result<(), TrackerError> {
        Ok(())
    }
}

/// Condenses ledger entries into one message per (account, txid).
///
/// Within a group the balance changes are summed; the direction is `fee`
/// only when every constituent row is a fee row. Trade groups with exactly
/// one bought and one sold leg merge into a single receive message naming
/// both assets; any other leg arity falls back to the plain summed message.
pub fn build_messages(entries: &[LedgerEntry]) -> Vec<TxMessage> {
    let mut groups: BTreeMap<(AccountId, String), Vec<&LedgerEntry>> = BTreeMap::new();
    for entry in entries {
        groups
            .entry((entry.account_id, entry.txid.clone()))
            .or_default()
            .push(entry);
    }

    let mut messages = Vec::with_capacity(groups.len());
    for ((_, txid), rows) in groups {
        let first = rows[0];
        let block = rows.iter().find_map(|r| r.block.as_ref());
        let memo = rows.iter().find_map(|r| r.memo.clone());

        if let Some(message) = merge_trade_legs(&txid, &rows, first, block) {
            messages.push(message);
            continue;
        }

        let total: BigDecimal = rows.iter().map(|r| r.amount.clone()).sum();
        let all_fee = rows.iter().all(|r| r.is_token_fee);
        let direction = if all_fee {
            TxDirection::Fee
        } else if total < BigDecimal::zero() {
            TxDirection::Send
        } else {
            TxDirection::Receive
        };

        messages.push(TxMessage {
            txid,
            network: first.network.as_str().to_string(),
            symbol: first.symbol.clone(),
            xpub: first.xpub.clone(),
            balance_change: total.to_string(),
            balance_units: first.network.balance_units().to_string(),
            direction,
            blockheight: block.map(|b| b.height),
            blocktime: block.map(|b| b.time.timestamp()),
            memo,
            buy_asset: None,
            buy_asset_amount: None,
            sell_asset: None,
            sell_asset_amount: None,
        });
    }
    messages
}

fn merge_trade_legs(
    txid: &str,
    rows: &[&LedgerEntry],
    first: &LedgerEntry,
    block: Option<&crate::types::BlockRef>,
) -> Option<TxMessage> {
    let legs: Vec<&LedgerEntry> = rows
        .iter()
        .copied()
        .filter(|r| r.is_dex_trade && !r.is_token_fee)
        .collect();
    if legs.is_empty() {
        return None;
    }

    let bought: Vec<&LedgerEntry> = legs
        .iter()
        .copied()
        .filter(|r| r.amount > BigDecimal::zero())
        .collect();
    let sold: Vec<&LedgerEntry> = legs
        .iter()
        .copied()
        .filter(|r| r.amount < BigDecimal::zero())
        .collect();
    if bought.len() != 1 || sold.len() != 1 {
        warn!(
            txid = %txid,
            bought = bought.len(),
            sold = sold.len(),
            "trade legs do not pair; emitting plain message"
        );
        return None;
    }
    let buy = bought[0];
    let sell = sold[0];

    Some(TxMessage {
        txid: txid.to_string(),
        network: first.network.as_str().to_string(),
        symbol: buy.symbol.clone(),
        xpub: first.xpub.clone(),
        balance_change: buy.amount.to_string(),
        balance_units: first.network.balance_units().to_string(),
        direction: TxDirection::Receive,
        blockheight: block.map(|b| b.height),
        blocktime: block.map(|b| b.time.timestamp()),
        memo: legs.iter().find_map(|r| r.memo.clone()),
        buy_asset: Some(buy.symbol.clone()),
        buy_asset_amount: Some(buy.amount.to_string()),
        sell_asset: Some(sell.symbol.clone()),
        sell_asset_amount: Some(sell.amount.abs().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockRef;
    use chrono::TimeZone;

    fn entry(amount: i64, symbol: &str, dex: bool, fee: bool) -> LedgerEntry {
        LedgerEntry {
            account_id: AccountId(1),
            xpub: "xpub1".into(),
            network: Network::Eth,
            txid: "tx1".into(),
            address: "addr".into(),
            amount: BigDecimal::from(amount),
            symbol: symbol.into(),
            is_token_transfer: symbol != "ETH",
            is_token_fee: fee,
            is_dex_trade: dex,
            memo: None,
            block: Some(BlockRef {
                height: 50,
                hash: "h50".into(),
                time: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            }),
            token: None,
        }
    }

    #[test]
    fn sums_rows_per_account_and_txid() {
        let entries = vec![entry(-30, "ETH", false, false), entry(10, "ETH", false, false)];
        let messages = build_messages(&entries);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].balance_change, "-20");
        assert_eq!(messages[0].direction, TxDirection::Send);
        assert_eq!(messages[0].blockheight, Some(50));
    }

    #[test]
    fn fee_direction_requires_all_fee_rows() {
        let fee_only = build_messages(&[entry(-21_000, "ETH", false, true)]);
        assert_eq!(fee_only[0].direction, TxDirection::Fee);

        let mixed = build_messages(&[
            entry(-21_000, "ETH", false, true),
            entry(500, "ETH", false, false),
        ]);
        assert_ne!(mixed[0].direction, TxDirection::Fee);
    }

    #[test]
    fn trade_legs_merge_into_one_message() {
        let entries = vec![entry(-100, "ETH", true, false), entry(42, "TOK", true, false)];
        let messages = build_messages(&entries);
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.direction, TxDirection::Receive);
        assert_eq!(m.buy_asset.as_deref(), Some("TOK"));
        assert_eq!(m.buy_asset_amount.as_deref(), Some("42"));
        assert_eq!(m.sell_asset.as_deref(), Some("ETH"));
        assert_eq!(m.sell_asset_amount.as_deref(), Some("100"));
    }

    #[test]
    fn lopsided_trade_falls_back_to_summed_message() {
        let entries = vec![
            entry(-100, "ETH", true, false),
            entry(42, "TOK", true, false),
            entry(7, "OTHER", true, false),
        ];
        let messages = build_messages(&entries);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].buy_asset.is_none());
        assert_eq!(messages[0].balance_change, "-51");
    }

    #[test]
    fn groups_split_by_txid() {
        let mut a = entry(5, "ETH", false, false);
        a.txid = "tx_a".into();
        let mut b = entry(-5, "ETH", false, false);
        b.txid = "tx_b".into();
        let messages = build_messages(&[a, b]);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn serializes_type_and_skips_empty_fields() {
        let messages = build_messages(&[entry(5, "ETH", false, false)]);
        let json = serde_json::to_value(&messages[0]).unwrap();
        assert_eq!(json["type"], "receive");
        assert_eq!(json["balance_units"], "wei");
        assert!(json.get("buy_asset").is_none());
    }
}
