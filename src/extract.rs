//! Transaction extraction.
//!
//! Turns adapter-normalized transactions into per-account ledger envelopes.
//! A single chain transaction can produce several envelopes: the native-asset
//! movement, one envelope per token contract it touched, and a standalone fee
//! envelope when a tracked origin moved tokens without moving the native
//! asset. Addresses the tracker does not follow are ignored entirely.

use std::collections::{BTreeMap, HashSet};

use bigdecimal::{BigDecimal, Zero};

use crate::adapter::{RawTx, TokenMeta, Transfer, TransferKind, TxPayload};
use crate::types::BlockRef;

/// A signed balance movement for one tracked address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDelta {
    pub address: String,
    pub amount: BigDecimal,
}

/// One ledger-ready transaction for one asset.
///
/// Deltas of zero are kept: a self-send still produces a history row, it just
/// does not move the balance.
#[derive(Debug, Clone)]
pub struct TxEnvelope {
    pub txid: String,
    pub block: Option<BlockRef>,
    /// Set for token envelopes and for token-fee envelopes (where it names
    /// the contract whose transfer incurred the fee).
    pub token: Option<TokenMeta>,
    /// True when the envelope's deltas are denominated in the token.
    pub is_token_transfer: bool,
    /// True for the standalone native-asset fee row of a token transfer.
    pub is_token_fee: bool,
    /// True when the transaction routed value through an exchange contract.
    pub is_dex_trade: bool,
    pub success: bool,
    pub memo: Option<String>,
    /// Total fee the transaction paid, in native units. Absent for coinbase.
    pub fee: Option<BigDecimal>,
    pub raw: serde_json::Value,
    pub changes: Vec<AddressDelta>,
}

/// Extracts ledger envelopes from a batch of normalized transactions,
/// restricted to the given set of tracked addresses.
pub fn extract_envelopes(raw_txs: &[RawTx], tracked: &HashSet<String>) -> Vec<TxEnvelope> {
    let mut envelopes = Vec::new();
    for tx in raw_txs {
        match &tx.payload {
            TxPayload::Utxo { inputs, outputs } => {
                extract_utxo(tx, inputs, outputs, tracked, &mut envelopes)
            }
            TxPayload::Transfers {
                origin,
                fee,
                transfers,
            } => extract_transfers(tx, origin, fee, transfers, tracked, &mut envelopes),
        }
    }
    envelopes
}

fn extract_utxo(
    tx: &RawTx,
    inputs: &[crate::adapter::TxIn],
    outputs: &[crate::adapter::TxOut],
    tracked: &HashSet<String>,
    out: &mut Vec<TxEnvelope>,
) {
    // BTreeMap keeps delta ordering deterministic across runs.
    let mut deltas: BTreeMap<String, BigDecimal> = BTreeMap::new();

    for input in inputs {
        if let Some(addr) = &input.address {
            if tracked.contains(addr) {
                *deltas.entry(addr.clone()).or_insert_with(BigDecimal::zero) -= &input.value;
            }
        }
    }
    for output in outputs {
        // Bare multisig outputs list several addresses; each sees the full
        // output value.
        for addr in &output.addresses {
            if tracked.contains(addr) {
                *deltas.entry(addr.clone()).or_insert_with(BigDecimal::zero) += &output.value;
            }
        }
    }

    if deltas.is_empty() {
        return;
    }

    // Coinbase transactions have no spendable inputs and pay no fee.
    let fee = if inputs.iter().all(|i| i.address.is_none()) {
        None
    } else {
        let total_in: BigDecimal = inputs.iter().map(|i| i.value.clone()).sum();
        let total_out: BigDecimal = outputs.iter().map(|o| o.value.clone()).sum();
        Some(total_in - total_out)
    };

    out.push(TxEnvelope {
        txid: tx.txid.clone(),
        block: tx.block.clone(),
        token: None,
        is_token_transfer: false,
        is_token_fee: false,
        is_dex_trade: false,
        success: tx.success,
        memo: tx.memo.clone(),
        fee,
        raw: tx.raw.clone(),
        changes: collect(deltas),
    });
}

fn extract_transfers(
    tx: &RawTx,
    origin: &str,
    fee: &BigDecimal,
    transfers: &[Transfer],
    tracked: &HashSet<String>,
    out: &mut Vec<TxEnvelope>,
) {
    let origin_tracked = tracked.contains(origin);
    let has_dex = transfers.iter().any(|t| t.kind == TransferKind::Dex);

    // A failed transaction moves nothing but still charges the origin its
    // fee.
    if !tx.success {
        if origin_tracked {
            out.push(TxEnvelope {
                txid: tx.txid.clone(),
                block: tx.block.clone(),
                token: None,
                is_token_transfer: false,
                is_token_fee: false,
                is_dex_trade: has_dex,
                success: false,
                memo: tx.memo.clone(),
                fee: Some(fee.clone()),
                raw: tx.raw.clone(),
                changes: vec![AddressDelta {
                    address: origin.to_string(),
                    amount: -fee.clone(),
                }],
            });
        }
        return;
    }

    // Native-asset deltas. Self-sends net to zero before the fee is applied,
    // so a tracked origin sending to itself nets exactly -fee.
    let mut native: BTreeMap<String, BigDecimal> = BTreeMap::new();
    let mut native_dex = false;
    let mut token_groups: BTreeMap<String, (TokenMeta, BTreeMap<String, BigDecimal>, bool)> =
        BTreeMap::new();

    for transfer in transfers {
        match &transfer.asset {
            crate::adapter::AssetRef::Native => {
                apply_transfer(&mut native, transfer, tracked);
                if transfer.kind == TransferKind::Dex {
                    native_dex = true;
                }
            }
            crate::adapter::AssetRef::Token(meta) => {
                let entry = token_groups
                    .entry(meta.contract_address.clone())
                    .or_insert_with(|| (meta.clone(), BTreeMap::new(), false));
                apply_transfer(&mut entry.1, transfer, tracked);
                if transfer.kind == TransferKind::Dex {
                    entry.2 = true;
                }
            }
        }
    }

    // The origin pays the fee. When it also moved the native asset the fee
    // folds into that envelope; when it only moved tokens the fee gets its
    // own row so token amounts and native fees never mix.
    let moved_tokens = !token_groups.is_empty();
    let origin_in_native = native.contains_key(origin);
    let mut fee_envelope_token: Option<TokenMeta> = None;

    if origin_tracked {
        if origin_in_native || !moved_tokens {
            *native
                .entry(origin.to_string())
                .or_insert_with(BigDecimal::zero) -= fee;
        } else {
            fee_envelope_token = token_groups.values().next().map(|(meta, _, _)| meta.clone());
        }
    }

    if !native.is_empty() {
        out.push(TxEnvelope {
            txid: tx.txid.clone(),
            block: tx.block.clone(),
            token: None,
            is_token_transfer: false,
            is_token_fee: false,
            is_dex_trade: native_dex,
            success: true,
            memo: tx.memo.clone(),
            fee: Some(fee.clone()),
            raw: tx.raw.clone(),
            changes: collect(native),
        });
    }

    for (_, (meta, deltas, dex)) in token_groups {
        if deltas.is_empty() {
            continue;
        }
        out.push(TxEnvelope {
            txid: tx.txid.clone(),
            block: tx.block.clone(),
            token: Some(meta),
            is_token_transfer: true,
            is_token_fee: false,
            is_dex_trade: dex,
            success: true,
            memo: tx.memo.clone(),
            fee: Some(fee.clone()),
            raw: tx.raw.clone(),
            changes: collect(deltas),
        });
    }

    if origin_tracked {
        if let Some(meta) = fee_envelope_token {
            // Memo is deliberately dropped here; it belongs to the token
            // movement, not the fee.
            out.push(TxEnvelope {
                txid: tx.txid.clone(),
                block: tx.block.clone(),
                token: Some(meta),
                is_token_transfer: false,
                is_token_fee: true,
                is_dex_trade: false,
                success: true,
                memo: None,
                fee: Some(fee.clone()),
                raw: tx.raw.clone(),
                changes: vec![AddressDelta {
                    address: origin.to_string(),
                    amount: -fee.clone(),
                }],
            });
        }
    }
}

fn apply_transfer(
    deltas: &mut BTreeMap<String, BigDecimal>,
    transfer: &Transfer,
    tracked: &HashSet<String>,
) {
    if tracked.contains(&transfer.from) {
        *deltas
            .entry(transfer.from.clone())
            .or_insert_with(BigDecimal::zero) -= &transfer.amount;
    }
    if tracked.contains(&transfer.to) {
        *deltas
            .entry(transfer.to.clone())
            .or_insert_with(BigDecimal::zero) += &transfer.amount;
    }
}

fn collect(deltas: BTreeMap<String, BigDecimal>) -> Vec<AddressDelta> {
    deltas
        .into_iter()
        .map(|(address, amount)| AddressDelta { address, amount })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AssetRef, RawTx, TxIn, TxOut, TxPayload};

    fn tracked(addrs: &[&str]) -> HashSet<String> {
        addrs.iter().map(|a| a.to_string()).collect()
    }

    fn amt(v: i64) -> BigDecimal {
        BigDecimal::from(v)
    }

    fn utxo_tx(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> RawTx {
        RawTx {
            txid: "tx1".into(),
            block: None,
            success: true,
            memo: None,
            raw: serde_json::json!({}),
            payload: TxPayload::Utxo { inputs, outputs },
        }
    }

    fn transfers_tx(origin: &str, fee: i64, transfers: Vec<Transfer>, success: bool) -> RawTx {
        RawTx {
            txid: "tx1".into(),
            block: None,
            success,
            memo: None,
            raw: serde_json::json!({}),
            payload: TxPayload::Transfers {
                origin: origin.into(),
                fee: amt(fee),
                transfers,
            },
        }
    }

    fn token() -> TokenMeta {
        TokenMeta {
            contract_address: "0xtoken".into(),
            name: "Token".into(),
            symbol: "TOK".into(),
            precision: 18,
        }
    }

    #[test]
    fn utxo_net_delta_and_fee() {
        let tx = utxo_tx(
            vec![TxIn {
                address: Some("mine".into()),
                value: amt(100_000),
            }],
            vec![
                TxOut {
                    addresses: vec!["theirs".into()],
                    value: amt(60_000),
                },
                TxOut {
                    addresses: vec!["mine".into()],
                    value: amt(39_000),
                },
            ],
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].fee, Some(amt(1_000)));
        assert_eq!(
            envs[0].changes,
            vec![AddressDelta {
                address: "mine".into(),
                amount: amt(-61_000),
            }]
        );
    }

    #[test]
    fn utxo_sole_input_without_change_loses_outputs_plus_fee() {
        // "mine" funds the whole spend and gets nothing back, so its delta is
        // the full output sum plus the fee.
        let tx = utxo_tx(
            vec![TxIn {
                address: Some("mine".into()),
                value: amt(100_000),
            }],
            vec![
                TxOut {
                    addresses: vec!["theirs".into()],
                    value: amt(60_000),
                },
                TxOut {
                    addresses: vec!["other".into()],
                    value: amt(39_000),
                },
            ],
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].fee, Some(amt(1_000)));
        assert_eq!(
            envs[0].changes,
            vec![AddressDelta {
                address: "mine".into(),
                amount: amt(-(60_000 + 39_000 + 1_000)),
            }]
        );
    }

    #[test]
    fn utxo_untracked_tx_dropped() {
        let tx = utxo_tx(
            vec![TxIn {
                address: Some("a".into()),
                value: amt(10),
            }],
            vec![TxOut {
                addresses: vec!["b".into()],
                value: amt(9),
            }],
        );
        assert!(extract_envelopes(&[tx], &tracked(&["mine"])).is_empty());
    }

    #[test]
    fn utxo_coinbase_has_no_fee() {
        let tx = utxo_tx(
            vec![TxIn {
                address: None,
                value: amt(0),
            }],
            vec![TxOut {
                addresses: vec!["mine".into()],
                value: amt(625_000_000),
            }],
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].fee, None);
        assert_eq!(envs[0].changes[0].amount, amt(625_000_000));
    }

    #[test]
    fn utxo_multisig_output_credits_each_address() {
        let tx = utxo_tx(
            vec![TxIn {
                address: Some("funder".into()),
                value: amt(100),
            }],
            vec![TxOut {
                addresses: vec!["a".into(), "b".into()],
                value: amt(99),
            }],
        );
        let envs = extract_envelopes(&[tx], &tracked(&["a", "b"]));
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].changes.len(), 2);
        assert!(envs[0].changes.iter().all(|d| d.amount == amt(99)));
    }

    #[test]
    fn native_self_send_nets_to_minus_fee() {
        let tx = transfers_tx(
            "mine",
            21_000,
            vec![Transfer {
                kind: TransferKind::Standard,
                from: "mine".into(),
                to: "mine".into(),
                asset: AssetRef::Native,
                amount: amt(1_000_000),
            }],
            true,
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].changes[0].amount, amt(-21_000));
    }

    #[test]
    fn failed_tx_charges_fee_only() {
        let tx = transfers_tx(
            "mine",
            21_000,
            vec![Transfer {
                kind: TransferKind::Standard,
                from: "mine".into(),
                to: "theirs".into(),
                asset: AssetRef::Native,
                amount: amt(1_000_000),
            }],
            false,
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 1);
        assert!(!envs[0].success);
        assert_eq!(envs[0].changes[0].amount, amt(-21_000));
    }

    #[test]
    fn token_transfer_splits_fee_into_own_envelope() {
        let tx = transfers_tx(
            "mine",
            50_000,
            vec![Transfer {
                kind: TransferKind::Token,
                from: "mine".into(),
                to: "theirs".into(),
                asset: AssetRef::Token(token()),
                amount: amt(777),
            }],
            true,
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 2);

        let token_env = envs.iter().find(|e| e.is_token_transfer).unwrap();
        assert_eq!(token_env.changes[0].amount, amt(-777));

        let fee_env = envs.iter().find(|e| e.is_token_fee).unwrap();
        assert_eq!(fee_env.changes[0].amount, amt(-50_000));
        assert!(fee_env.memo.is_none());
        assert_eq!(
            fee_env.token.as_ref().unwrap().contract_address,
            "0xtoken"
        );
    }

    #[test]
    fn token_self_send_records_zero_delta() {
        let tx = transfers_tx(
            "other_origin",
            50_000,
            vec![Transfer {
                kind: TransferKind::Token,
                from: "mine".into(),
                to: "mine".into(),
                asset: AssetRef::Token(token()),
                amount: amt(5),
            }],
            true,
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 1);
        assert!(envs[0].is_token_transfer);
        assert_eq!(envs[0].changes[0].amount, amt(0));
    }

    #[test]
    fn fee_folds_into_native_when_native_also_moved() {
        let tx = transfers_tx(
            "mine",
            10,
            vec![
                Transfer {
                    kind: TransferKind::Standard,
                    from: "mine".into(),
                    to: "theirs".into(),
                    asset: AssetRef::Native,
                    amount: amt(500),
                },
                Transfer {
                    kind: TransferKind::Token,
                    from: "mine".into(),
                    to: "theirs".into(),
                    asset: AssetRef::Token(token()),
                    amount: amt(7),
                },
            ],
            true,
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 2);
        assert!(envs.iter().all(|e| !e.is_token_fee));
        let native = envs.iter().find(|e| !e.is_token_transfer).unwrap();
        assert_eq!(native.changes[0].amount, amt(-510));
    }

    #[test]
    fn dex_legs_flagged() {
        let tx = transfers_tx(
            "mine",
            10,
            vec![
                Transfer {
                    kind: TransferKind::Dex,
                    from: "mine".into(),
                    to: "pool".into(),
                    asset: AssetRef::Native,
                    amount: amt(100),
                },
                Transfer {
                    kind: TransferKind::Dex,
                    from: "pool".into(),
                    to: "mine".into(),
                    asset: AssetRef::Token(token()),
                    amount: amt(42),
                },
            ],
            true,
        );
        let envs = extract_envelopes(&[tx], &tracked(&["mine"]));
        assert_eq!(envs.len(), 2);
        assert!(envs.iter().all(|e| e.is_dex_trade));
    }
}
