//! BTC broadcast and confirmation loops.
//!
//! Broadcast sends every leader hex once, transitions all Send rows that
//! share the transaction hash, and predictively registers UTXOs created at
//! our own addresses so the planners can spend change before the next
//! block scan.

use bitcoin::Network;
use eyre::Result;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

use crate::chains::btc::script_to_address;
use crate::db;
use crate::db::models::{BtcSend, NewBtcUtxo};
use crate::locks;
use crate::notify;
use crate::rpc::BtcRpcClient;
use crate::types::{
    NotifyType, OrgStatus, RelatedType, SendStatus, UtxoType, WithdrawStatus, OMNI_RETURN_PREFIX,
};
use crate::units::sats_to_btc;

/// Node answers that mean the transaction is already known.
fn is_duplicate_broadcast(message: &str) -> bool {
    message.contains("already in block chain")
        || message.contains("already known")
        || message.contains("known transaction")
        || message.contains("txn-already-known")
}

#[derive(Clone)]
pub struct BtcConfirmer {
    db: PgPool,
    rpc: BtcRpcClient,
    network: Network,
}

impl BtcConfirmer {
    pub fn new(db: PgPool, rpc: BtcRpcClient, network: Network) -> Self {
        Self { db, rpc, network }
    }

    /// Broadcast queued transactions and transition their records.
    pub async fn check_raw_tx_send(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("BtcCheckRawTxSend") else {
            return Ok(());
        };
        let send_rows = db::btc_sends_by_status(&self.db, SendStatus::Init.as_str()).await?;
        if send_rows.is_empty() {
            return Ok(());
        }
        let (withdraws, products) = self.withdraw_context(&send_rows).await?;

        let mut sent_txids: HashSet<String> = HashSet::new();
        let mut sent_hexes: Vec<String> = Vec::new();
        for row in send_rows.iter().filter(|r| !r.hex.is_empty()) {
            match self.rpc.send_raw_transaction(&row.hex).await {
                Ok(_) => {}
                Err(e) if is_duplicate_broadcast(&e.to_string()) => {
                    info!(txid = row.tx_id.as_str(), "transaction already known to the network");
                }
                Err(e) => {
                    crate::metrics::record_broadcast("btc", false);
                    error!(txid = row.tx_id.as_str(), error = %e, "broadcast failed");
                    continue;
                }
            }
            crate::metrics::record_broadcast("btc", true);
            sent_txids.insert(row.tx_id.clone());
            if !sent_hexes.contains(&row.hex) {
                sent_hexes.push(row.hex.clone());
            }
        }

        let mut send_ids = Vec::new();
        let mut withdraw_ids = Vec::new();
        let mut omni_org_ids = Vec::new();
        for row in &send_rows {
            if !sent_txids.contains(&row.tx_id) {
                continue;
            }
            send_ids.push(row.id);
            match RelatedType::parse(&row.related_type) {
                Some(RelatedType::Withdraw) => {
                    if !withdraw_ids.contains(&row.related_id) {
                        withdraw_ids.push(row.related_id);
                        self.queue_withdraw_notification(
                            &withdraws,
                            &products,
                            row.related_id,
                            NotifyType::WithdrawSend,
                        )
                        .await?;
                    }
                }
                Some(RelatedType::OmniOrg) => {
                    if !omni_org_ids.contains(&row.related_id) {
                        omni_org_ids.push(row.related_id);
                    }
                }
                _ => {}
            }
        }

        db::update_withdraws_status(&self.db, &withdraw_ids, WithdrawStatus::Send.as_str()).await?;
        db::update_omni_deposits_org_status(&self.db, &omni_org_ids, OrgStatus::Send.as_str()).await?;
        self.register_sent_utxos(&sent_hexes).await?;
        db::update_btc_sends_status(&self.db, &send_ids, SendStatus::Send.as_str()).await?;
        Ok(())
    }

    /// Promote broadcast transactions that the chain has confirmed.
    pub async fn check_raw_tx_confirm(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("BtcCheckRawTxConfirm") else {
            return Ok(());
        };
        let send_rows = db::btc_sends_by_status(&self.db, SendStatus::Send.as_str()).await?;
        if send_rows.is_empty() {
            return Ok(());
        }
        let (withdraws, products) = self.withdraw_context(&send_rows).await?;

        let mut checked: HashMap<String, bool> = HashMap::new();
        let mut send_ids = Vec::new();
        let mut withdraw_ids = Vec::new();
        let mut omni_org_ids = Vec::new();
        for row in &send_rows {
            let confirmed = match checked.get(&row.tx_id) {
                Some(&c) => c,
                None => {
                    let c = match self.rpc.get_raw_transaction_verbose(&row.tx_id).await {
                        Ok(tx) => tx.confirmations > 0,
                        Err(e) => {
                            warn!(txid = row.tx_id.as_str(), error = %e, "confirm lookup failed");
                            false
                        }
                    };
                    checked.insert(row.tx_id.clone(), c);
                    c
                }
            };
            if !confirmed {
                continue;
            }
            send_ids.push(row.id);
            match RelatedType::parse(&row.related_type) {
                Some(RelatedType::Withdraw) => {
                    if !withdraw_ids.contains(&row.related_id) {
                        withdraw_ids.push(row.related_id);
                        self.queue_withdraw_notification(
                            &withdraws,
                            &products,
                            row.related_id,
                            NotifyType::WithdrawConfirm,
                        )
                        .await?;
                    }
                }
                Some(RelatedType::OmniOrg) => {
                    if !omni_org_ids.contains(&row.related_id) {
                        omni_org_ids.push(row.related_id);
                    }
                }
                _ => {}
            }
        }

        db::update_withdraws_status(&self.db, &withdraw_ids, WithdrawStatus::Confirm.as_str()).await?;
        db::update_omni_deposits_org_status(&self.db, &omni_org_ids, OrgStatus::Confirm.as_str()).await?;
        db::update_btc_sends_status(&self.db, &send_ids, SendStatus::Confirm.as_str()).await?;
        Ok(())
    }

    async fn withdraw_context(
        &self,
        send_rows: &[BtcSend],
    ) -> Result<(
        HashMap<i64, db::models::Withdraw>,
        HashMap<i64, db::models::Product>,
    )> {
        let mut withdraw_ids: Vec<i64> = send_rows
            .iter()
            .filter(|r| r.related_type == RelatedType::Withdraw.as_str())
            .map(|r| r.related_id)
            .collect();
        withdraw_ids.sort();
        withdraw_ids.dedup();
        let withdraws = db::withdraw_map(&self.db, &withdraw_ids).await?;
        let mut product_ids: Vec<i64> = withdraws.values().map(|w| w.product_id).collect();
        product_ids.sort();
        product_ids.dedup();
        let products = db::product_map(&self.db, &product_ids).await?;
        Ok((withdraws, products))
    }

    async fn queue_withdraw_notification(
        &self,
        withdraws: &HashMap<i64, db::models::Withdraw>,
        products: &HashMap<i64, db::models::Product>,
        withdraw_id: i64,
        notify_type: NotifyType,
    ) -> Result<()> {
        let Some(withdraw) = withdraws.get(&withdraw_id) else {
            error!(withdraw = withdraw_id, "no withdraw row for send");
            return Ok(());
        };
        let Some(product) = products.get(&withdraw.product_id) else {
            error!(product = withdraw.product_id, "no product row for withdraw");
            return Ok(());
        };
        let row = notify::withdraw_notification(withdraw, product, notify_type);
        db::insert_notification(&self.db, &row).await
    }

    /// Decode just-broadcast transactions and pre-insert any outputs paying
    /// the hot wallet or token hot/fee addresses. `(tx_id, vout_n)` is the
    /// natural key, so the later block-seek pass only enriches the row.
    async fn register_sent_utxos(&self, hexes: &[String]) -> Result<()> {
        if hexes.is_empty() {
            return Ok(());
        }
        let hot_address = db::require_state_str(&self.db, "hot_wallet_address_btc").await?;
        let tokens = db::omni_tokens_all(&self.db).await?;
        let token_hot: HashSet<String> = tokens.iter().map(|t| t.hot_address.clone()).collect();
        let token_fee: HashSet<String> = tokens.iter().map(|t| t.fee_address.clone()).collect();

        for tx_hex in hexes {
            let raw = hex::decode(tx_hex)?;
            let tx: bitcoin::Transaction = bitcoin::consensus::encode::deserialize(&raw)?;
            let txid = tx.compute_txid().to_string();

            let is_omni = tx
                .output
                .iter()
                .any(|o| hex::encode(o.script_pubkey.as_bytes()).starts_with(OMNI_RETURN_PREFIX));
            let omni_ref = if is_omni {
                self.sent_omni_reference(&tx).await?
            } else {
                None
            };

            for (i, out) in tx.output.iter().enumerate() {
                let Some(address) = script_to_address(&out.script_pubkey, self.network) else {
                    continue;
                };
                let utxo_type = if address == hot_address {
                    UtxoType::Hot
                } else if token_fee.contains(&address) || token_hot.contains(&address) {
                    if omni_ref == Some(i) {
                        UtxoType::Omni
                    } else if token_fee.contains(&address) {
                        UtxoType::OmniOrgFee
                    } else {
                        UtxoType::OmniHot
                    }
                } else {
                    continue;
                };
                db::insert_btc_utxo(
                    &self.db,
                    &NewBtcUtxo {
                        utxo_type: utxo_type.as_str().to_string(),
                        block_hash: String::new(),
                        tx_id: txid.clone(),
                        vout_n: i as i64,
                        address,
                        value: sats_to_btc(out.value.to_sat() as i64),
                        script: hex::encode(out.script_pubkey.as_bytes()),
                    },
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Reference-output index of one of our own OMNI transactions: resolve
    /// the first input's previous output, then apply the last-non-change
    /// walk over the decoded outputs.
    async fn sent_omni_reference(&self, tx: &bitcoin::Transaction) -> Result<Option<usize>> {
        let mut vin_address = None;
        for input in &tx.input {
            let prev = input.previous_output;
            if let Some(addr) = self
                .rpc
                .prev_output_address(&prev.txid.to_string(), prev.vout as i64)
                .await?
            {
                vin_address = Some(addr);
                break;
            }
        }
        let Some(vin_address) = vin_address else {
            return Ok(None);
        };

        let mut exchanged = false;
        for (i, out) in tx.output.iter().enumerate().rev() {
            let Some(address) = script_to_address(&out.script_pubkey, self.network) else {
                continue;
            };
            if !exchanged && address == vin_address {
                exchanged = true;
                continue;
            }
            return Ok(Some(i));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_broadcast_detection() {
        assert!(is_duplicate_broadcast("rpc error -27: already in block chain"));
        assert!(is_duplicate_broadcast("txn-already-known"));
        assert!(is_duplicate_broadcast("known transaction: deadbeef"));
        assert!(!is_duplicate_broadcast("insufficient fee"));
        assert!(!is_duplicate_broadcast("missing inputs"));
    }
}
