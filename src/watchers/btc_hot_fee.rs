//! BTC hot/fee UTXO seeker.
//!
//! Tracks outputs paying the BTC hot wallet and the OMNI token hot/fee
//! addresses. Unlike the deposit seeker it follows the raw tip with no
//! confirmation delay; its cursor bootstraps at the tip on first run so a
//! fresh deployment does not scan history.

use eyre::Result;
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::info;

use super::btc::{block_vin_map, index_block_spends, is_omni_tx, omni_reference_index,
    omni_vin_address};
use crate::db;
use crate::db::models::NewBtcUtxo;
use crate::locks;
use crate::metrics;
use crate::rpc::btc::BtcRpcClient;
use crate::types::UtxoType;
use crate::units::btc_float_to_str;

#[derive(Clone)]
pub struct BtcHotFeeSeeker {
    db: PgPool,
    rpc: BtcRpcClient,
}

impl BtcHotFeeSeeker {
    pub fn new(db: PgPool, rpc: BtcRpcClient) -> Self {
        Self { db, rpc }
    }

    pub async fn step(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("BtcCheckBlockSeekHotAndFee") else {
            return Ok(());
        };
        let seek = match db::get_state_int(&self.db, "btc_hot_fee_seek_num").await? {
            Some(v) => v,
            None => {
                let tip = self.rpc.get_block_count().await?;
                db::init_state_int(&self.db, "btc_hot_fee_seek_num", tip).await?;
                info!(tip, "Bootstrapped hot/fee seek cursor at the tip");
                tip
            }
        };
        let tip = self.rpc.get_block_count().await?;
        if seek >= tip {
            return Ok(());
        }

        let hot_address = db::require_state_str(&self.db, "hot_wallet_address_btc").await?;
        let tokens = db::omni_tokens_all(&self.db).await?;
        let token_hot: HashSet<String> = tokens.iter().map(|t| t.hot_address.clone()).collect();
        let token_fee: HashSet<String> = tokens.iter().map(|t| t.fee_address.clone()).collect();

        for height in (seek + 1)..=tip {
            self.process_block(height, &hot_address, &token_hot, &token_fee)
                .await?;
            db::advance_state_int(&self.db, "btc_hot_fee_seek_num", height).await?;
            metrics::record_block_processed("btc_hot_fee", height as u64);
        }
        Ok(())
    }

    async fn process_block(
        &self,
        height: i64,
        hot_address: &str,
        token_hot: &HashSet<String>,
        token_fee: &HashSet<String>,
    ) -> Result<()> {
        let hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block_verbose(&hash).await?;

        let (from_txids, vin_map) = block_vin_map(&block.tx);

        let mut utxos: Vec<NewBtcUtxo> = Vec::new();
        for tx in &block.tx {
            let relevant = tx.vout.iter().any(|vout| {
                let addrs = vout.script_pub_key.addresses();
                addrs.len() == 1
                    && (addrs[0] == hot_address
                        || token_hot.contains(&addrs[0])
                        || token_fee.contains(&addrs[0]))
            });
            if !relevant {
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

            for vout in &tx.vout {
                let addrs = vout.script_pub_key.addresses();
                if addrs.len() != 1 {
                    continue;
                }
                let address = addrs.into_iter().next().unwrap();

                let utxo_type = if address == hot_address {
                    UtxoType::Hot
                } else if token_fee.contains(&address) || token_hot.contains(&address) {
                    if omni_ref == Some(vout.n) {
                        UtxoType::Omni
                    } else if token_fee.contains(&address) {
                        UtxoType::OmniOrgFee
                    } else {
                        UtxoType::OmniHot
                    }
                } else {
                    continue;
                };

                utxos.push(NewBtcUtxo {
                    utxo_type: utxo_type.as_str().to_string(),
                    block_hash: block.hash.clone(),
                    tx_id: tx.txid.clone(),
                    vout_n: vout.n,
                    address,
                    value: btc_float_to_str(vout.value),
                    script: vout.script_pub_key.hex.clone(),
                });
            }
        }

        for utxo in &utxos {
            db::insert_btc_utxo(&self.db, utxo).await?;
        }
        index_block_spends(&self.db, &from_txids, &vin_map).await?;
        Ok(())
    }
}
