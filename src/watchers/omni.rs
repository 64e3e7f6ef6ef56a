//! OMNI deposit block seeker.
//!
//! Finds OMNI-marked transactions whose reference output credits a
//! tenant-owned address, then validates each candidate against
//! `omni_gettransaction` before recording the deposit.

use eyre::Result;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use super::btc::{is_omni_tx, omni_reference_index, omni_vin_address};
use crate::db;
use crate::db::models::NewOmniDeposit;
use crate::locks;
use crate::metrics;
use crate::rpc::btc::BtcRpcClient;

#[derive(Clone)]
pub struct OmniDepositSeeker {
    db: PgPool,
    rpc: BtcRpcClient,
}

impl OmniDepositSeeker {
    pub fn new(db: PgPool, rpc: BtcRpcClient) -> Self {
        Self { db, rpc }
    }

    pub async fn step(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("OmniCheckBlockSeek") else {
            return Ok(());
        };
        let confirm = db::require_state_int(&self.db, "btc_block_confirm_num").await?;
        let seek = db::require_state_int(&self.db, "omni_seek_num").await?;
        let tip = self.rpc.get_block_count().await?;

        let start = seek + 1;
        let end = tip - confirm + 1;
        if start >= end {
            return Ok(());
        }

        let tokens = db::omni_tokens_all(&self.db).await?;
        let token_symbols: HashMap<i64, String> = tokens
            .iter()
            .map(|t| (t.token_index, t.token_symbol.clone()))
            .collect();

        for height in start..end {
            self.process_block(height, &token_symbols).await?;
            db::advance_state_int(&self.db, "omni_seek_num", height).await?;
            metrics::record_block_processed("omni", height as u64);
        }
        Ok(())
    }

    async fn process_block(
        &self,
        height: i64,
        token_symbols: &HashMap<i64, String>,
    ) -> Result<()> {
        let hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block_verbose(&hash).await?;

        // reference address → candidate txids
        let mut candidates: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut by_address: HashMap<String, Vec<String>> = HashMap::new();
        for tx in &block.tx {
            if !is_omni_tx(tx) {
                continue;
            }
            let Some(vin_addr) = omni_vin_address(&self.rpc, tx).await? else {
                continue;
            };
            let Some(ref_n) = omni_reference_index(tx, &vin_addr) else {
                continue;
            };
            let Some(vout) = tx.vout.iter().find(|v| v.n == ref_n) else {
                continue;
            };
            let addrs = vout.script_pub_key.addresses();
            if addrs.len() != 1 {
                continue;
            }
            let address = addrs.into_iter().next().unwrap();
            if seen.insert(address.clone()) {
                candidates.push(address.clone());
            }
            by_address.entry(address).or_default().push(tx.txid.clone());
        }

        let owned: HashMap<String, i64> = db::addresses_in(&self.db, &candidates)
            .await?
            .into_iter()
            .map(|r| (r.address, r.use_tag))
            .collect();

        for (address, txids) in &by_address {
            let Some(&use_tag) = owned.get(address) else {
                continue;
            };
            if use_tag <= 0 {
                continue;
            }
            for txid in txids {
                let omni_tx = self.rpc.omni_get_transaction(txid).await?;
                // only valid, confirmed simple sends count
                if omni_tx.type_int != 0 || !omni_tx.valid || omni_tx.confirmations <= 0 {
                    continue;
                }
                let Some(symbol) = token_symbols.get(&omni_tx.propertyid) else {
                    warn!(
                        txid = txid.as_str(),
                        property = omni_tx.propertyid,
                        "OMNI send for unconfigured token"
                    );
                    continue;
                };
                let inserted = db::insert_omni_deposit(
                    &self.db,
                    &NewOmniDeposit {
                        product_id: use_tag,
                        token_index: omni_tx.propertyid,
                        token_symbol: symbol.clone(),
                        block_hash: omni_tx.blockhash.clone(),
                        tx_id: omni_tx.txid.clone(),
                        from_address: omni_tx.sendingaddress.clone(),
                        to_address: omni_tx.referenceaddress.clone(),
                        value: omni_tx.amount.clone(),
                    },
                )
                .await?;
                if inserted {
                    metrics::record_deposit_detected("omni");
                    info!(
                        txid = txid.as_str(),
                        token = symbol.as_str(),
                        amount = omni_tx.amount.as_str(),
                        height,
                        "New OMNI deposit detected"
                    );
                }
            }
        }
        Ok(())
    }
}
