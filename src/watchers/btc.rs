//! BTC deposit block seeker.
//!
//! Walks confirmed blocks, records tenant deposits and every output paying
//! an address we issued, and indexes observed spends of tracked UTXOs.

use eyre::Result;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::db;
use crate::db::models::{NewBtcDeposit, NewBtcUtxo};
use crate::locks;
use crate::metrics;
use crate::rpc::btc::{BtcRpcClient, TxResult};
use crate::types::{UtxoType, OMNI_RETURN_PREFIX};
use crate::units::btc_float_to_str;

/// True when any output carries the OMNI OP_RETURN marker.
pub(crate) fn is_omni_tx(tx: &TxResult) -> bool {
    tx.vout
        .iter()
        .any(|v| v.script_pub_key.hex.starts_with(OMNI_RETURN_PREFIX))
}

/// Locate the OMNI reference output: walk outputs from last to first, skip
/// the first output that pays the sending address (change), take the next
/// addressed output. Multi-address outputs are rejected outright.
pub(crate) fn omni_reference_index(tx: &TxResult, vin_address: &str) -> Option<i64> {
    let mut exchanged = false;
    for vout in tx.vout.iter().rev() {
        let addrs = vout.script_pub_key.addresses();
        if addrs.is_empty() {
            continue;
        }
        if !exchanged && addrs.join(",") == vin_address {
            exchanged = true;
            continue;
        }
        if addrs.len() == 1 {
            return Some(vout.n);
        }
        return None;
    }
    None
}

/// Resolve the OMNI sending address: the first input whose previous output
/// decodes to an address.
pub(crate) async fn omni_vin_address(rpc: &BtcRpcClient, tx: &TxResult) -> Result<Option<String>> {
    for vin in &tx.vin {
        if vin.coinbase.is_some() || vin.txid.is_empty() {
            continue;
        }
        if let Some(address) = rpc.prev_output_address(&vin.txid, vin.vout).await? {
            return Ok(Some(address));
        }
    }
    Ok(None)
}

/// Spend index for one block: (funding txid, vout) → (spending txid, vin n).
pub(crate) fn block_vin_map(
    txs: &[TxResult],
) -> (Vec<String>, HashMap<(String, i64), (String, i64)>) {
    let mut from_txids = Vec::new();
    let mut seen = HashSet::new();
    let mut vin_map = HashMap::new();
    for tx in txs {
        for (i, vin) in tx.vin.iter().enumerate() {
            if vin.coinbase.is_some() || vin.txid.is_empty() {
                continue;
            }
            if seen.insert(vin.txid.clone()) {
                from_txids.push(vin.txid.clone());
            }
            vin_map.insert((vin.txid.clone(), vin.vout), (tx.txid.clone(), i as i64));
        }
    }
    (from_txids, vin_map)
}

/// Mark tracked UTXOs that this block spends.
pub(crate) async fn index_block_spends(
    db: &PgPool,
    from_txids: &[String],
    vin_map: &HashMap<(String, i64), (String, i64)>,
) -> Result<()> {
    let keys = db::utxo_keys_by_txids(db, from_txids).await?;
    for key in keys {
        if let Some((spend_tx, spend_n)) = vin_map.get(&(key.tx_id.clone(), key.vout_n)) {
            db::mark_utxo_spend_observed(db, key.id, spend_tx, *spend_n).await?;
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct BtcDepositSeeker {
    db: PgPool,
    rpc: BtcRpcClient,
}

impl BtcDepositSeeker {
    pub fn new(db: PgPool, rpc: BtcRpcClient) -> Self {
        Self { db, rpc }
    }

    /// One bounded unit of work: scan every newly confirmed block.
    pub async fn step(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("BtcCheckBlockSeek") else {
            return Ok(());
        };
        let confirm = db::require_state_int(&self.db, "btc_block_confirm_num").await?;
        let seek = db::require_state_int(&self.db, "btc_seek_num").await?;
        let tip = self.rpc.get_block_count().await?;

        let start = seek + 1;
        let end = tip - confirm + 1;
        if start >= end {
            return Ok(());
        }

        let tokens = db::omni_tokens_all(&self.db).await?;
        let token_hot: HashSet<String> = tokens.iter().map(|t| t.hot_address.clone()).collect();
        let token_fee: HashSet<String> = tokens.iter().map(|t| t.fee_address.clone()).collect();

        for height in start..end {
            self.process_block(height, &token_hot, &token_fee).await?;
            // cursor moves only after the whole block committed
            db::advance_state_int(&self.db, "btc_seek_num", height).await?;
            metrics::record_block_processed("btc", height as u64);
        }
        Ok(())
    }

    async fn process_block(
        &self,
        height: i64,
        token_hot: &HashSet<String>,
        token_fee: &HashSet<String>,
    ) -> Result<()> {
        let hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block_verbose(&hash).await?;

        let (from_txids, vin_map) = block_vin_map(&block.tx);

        // candidate output addresses across the whole block
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        for tx in &block.tx {
            for vout in &tx.vout {
                let addrs = vout.script_pub_key.addresses();
                if addrs.len() == 1 && seen.insert(addrs[0].clone()) {
                    candidates.push(addrs[0].clone());
                }
            }
        }
        let owned: HashMap<String, i64> = db::addresses_in(&self.db, &candidates)
            .await?
            .into_iter()
            .map(|r| (r.address, r.use_tag))
            .collect();

        let mut deposits: Vec<NewBtcDeposit> = Vec::new();
        let mut utxos: Vec<NewBtcUtxo> = Vec::new();

        for tx in &block.tx {
            let matched: Vec<(&crate::rpc::btc::TxVout, String, i64)> = tx
                .vout
                .iter()
                .filter_map(|vout| {
                    let addrs = vout.script_pub_key.addresses();
                    if addrs.len() != 1 {
                        return None;
                    }
                    let address = addrs.into_iter().next().unwrap();
                    owned.get(&address).map(|tag| (vout, address, *tag))
                })
                .collect();
            if matched.is_empty() {
                continue;
            }

            let omni = is_omni_tx(tx);
            let omni_ref = if omni {
                match omni_vin_address(&self.rpc, tx).await? {
                    Some(vin_addr) => omni_reference_index(tx, &vin_addr),
                    None => None,
                }
            } else {
                None
            };

            for (vout, address, use_tag) in matched {
                let value = btc_float_to_str(vout.value);
                if use_tag > 0 && !omni {
                    deposits.push(NewBtcDeposit {
                        product_id: use_tag,
                        block_hash: block.hash.clone(),
                        tx_id: tx.txid.clone(),
                        vout_n: vout.n,
                        address: address.clone(),
                        value: value.clone(),
                    });
                }

                let mut utxo_type = if use_tag > 0 { UtxoType::Tx } else { UtxoType::Hot };
                if token_hot.contains(&address) {
                    utxo_type = UtxoType::OmniHot;
                }
                if token_fee.contains(&address) {
                    utxo_type = UtxoType::OmniOrgFee;
                }
                if omni_ref == Some(vout.n) {
                    utxo_type = UtxoType::Omni;
                }

                utxos.push(NewBtcUtxo {
                    utxo_type: utxo_type.as_str().to_string(),
                    block_hash: block.hash.clone(),
                    tx_id: tx.txid.clone(),
                    vout_n: vout.n,
                    address,
                    value,
                    script: vout.script_pub_key.hex.clone(),
                });
            }
        }

        if !deposits.is_empty() {
            info!(height, count = deposits.len(), "New BTC deposits detected");
        }
        for dep in &deposits {
            if db::insert_btc_deposit(&self.db, dep).await? {
                metrics::record_deposit_detected("btc");
            }
        }
        for utxo in &utxos {
            db::insert_btc_utxo(&self.db, utxo).await?;
        }

        index_block_spends(&self.db, &from_txids, &vin_map).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::btc::{ScriptPubKey, TxVout};

    fn vout(n: i64, address: Option<&str>, hex: &str) -> TxVout {
        TxVout {
            value: 0.1,
            n,
            script_pub_key: ScriptPubKey {
                hex: hex.to_string(),
                addresses: None,
                address: address.map(|a| a.to_string()),
            },
        }
    }

    fn omni_tx(vouts: Vec<TxVout>) -> TxResult {
        TxResult {
            txid: "ab".repeat(32),
            vsize: 200,
            vin: vec![],
            vout: vouts,
            blockhash: None,
            confirmations: 1,
        }
    }

    #[test]
    fn test_omni_marker_detection() {
        let tx = omni_tx(vec![vout(0, None, "6a146f6d6e69000000000000001f0000000000000064")]);
        assert!(is_omni_tx(&tx));
        let plain = omni_tx(vec![vout(0, Some("addr"), "0014aa")]);
        assert!(!is_omni_tx(&plain));
    }

    #[test]
    fn test_reference_is_last_non_change_output() {
        // vout: [OP_RETURN, change back to sender, reference]
        let tx = omni_tx(vec![
            vout(0, None, "6a146f6d6e69"),
            vout(1, Some("sender"), "00"),
            vout(2, Some("receiver"), "00"),
        ]);
        assert_eq!(omni_reference_index(&tx, "sender"), Some(2));
    }

    #[test]
    fn test_reference_skips_change_when_it_sorts_last() {
        // vout: [OP_RETURN, reference, change]; walking from the end must
        // skip the change output first.
        let tx = omni_tx(vec![
            vout(0, None, "6a146f6d6e69"),
            vout(1, Some("receiver"), "00"),
            vout(2, Some("sender"), "00"),
        ]);
        assert_eq!(omni_reference_index(&tx, "sender"), Some(1));
    }

    #[test]
    fn test_no_reference_when_only_change() {
        let tx = omni_tx(vec![
            vout(0, None, "6a146f6d6e69"),
            vout(1, Some("sender"), "00"),
        ]);
        assert_eq!(omni_reference_index(&tx, "sender"), None);
    }

    #[test]
    fn test_block_vin_map_skips_coinbase() {
        use crate::rpc::btc::TxVin;
        let txs = vec![TxResult {
            txid: "cd".repeat(32),
            vsize: 100,
            vin: vec![
                TxVin { coinbase: Some("03".into()), txid: String::new(), vout: 0 },
                TxVin { coinbase: None, txid: "ee".repeat(32), vout: 1 },
            ],
            vout: vec![],
            blockhash: None,
            confirmations: 1,
        }];
        let (from_txids, vin_map) = block_vin_map(&txs);
        assert_eq!(from_txids, vec!["ee".repeat(32)]);
        assert_eq!(
            vin_map.get(&("ee".repeat(32), 1)),
            Some(&("cd".repeat(32), 1))
        );
    }
}
