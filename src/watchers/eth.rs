//! ETH deposit block seeker.
//!
//! Records plain value transfers to tenant-owned addresses. Transfers sent
//! by the ERC-20 fee wallets are internal fee funding and are skipped.

use eyre::Result;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::db;
use crate::db::models::NewEthDeposit;
use crate::locks;
use crate::metrics;
use crate::rpc::eth::{hex_to_u256, EthRpcClient};
use crate::units::wei_to_eth;

#[derive(Clone)]
pub struct EthDepositSeeker {
    db: PgPool,
    rpc: EthRpcClient,
}

impl EthDepositSeeker {
    pub fn new(db: PgPool, rpc: EthRpcClient) -> Self {
        Self { db, rpc }
    }

    pub async fn step(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("EthCheckBlockSeek") else {
            return Ok(());
        };
        let confirm = db::require_state_int(&self.db, "block_confirm_num").await?;
        let seek = db::require_state_int(&self.db, "eth_seek_num").await?;
        let tip = self.rpc.block_number().await?;

        let start = seek + 1;
        let end = tip - confirm + 1;
        if start >= end {
            return Ok(());
        }

        let fee_wallets: HashSet<String> = db::get_state_str(&self.db, "fee_wallet_address_list_erc20")
            .await?
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_lowercase())
            .collect();

        for height in start..end {
            self.process_block(height, &fee_wallets).await?;
            db::advance_state_int(&self.db, "eth_seek_num", height).await?;
            metrics::record_block_processed("eth", height as u64);
        }
        Ok(())
    }

    async fn process_block(&self, height: i64, fee_wallets: &HashSet<String>) -> Result<()> {
        let block = self.rpc.block_by_number(height).await?;

        // value transfers keyed by recipient
        let mut candidates: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut by_address: HashMap<String, Vec<&crate::rpc::eth::EthTx>> = HashMap::new();
        for tx in &block.transactions {
            let Some(to) = &tx.to else { continue };
            if hex_to_u256(&tx.value)?.is_zero() {
                continue;
            }
            if fee_wallets.contains(&tx.from.to_lowercase()) {
                continue;
            }
            let to = to.to_lowercase();
            if seen.insert(to.clone()) {
                candidates.push(to.clone());
            }
            by_address.entry(to).or_default().push(tx);
        }

        let owned: HashMap<String, i64> = db::addresses_in(&self.db, &candidates)
            .await?
            .into_iter()
            .map(|r| (r.address, r.use_tag))
            .collect();

        for (address, txs) in &by_address {
            let Some(&use_tag) = owned.get(address) else {
                continue;
            };
            if use_tag <= 0 {
                continue;
            }
            for tx in txs {
                let wei = hex_to_u256(&tx.value)?;
                let inserted = db::insert_eth_deposit(
                    &self.db,
                    &NewEthDeposit {
                        product_id: use_tag,
                        tx_id: tx.hash.to_lowercase(),
                        from_address: tx.from.to_lowercase(),
                        to_address: address.clone(),
                        value: wei_to_eth(wei),
                    },
                )
                .await?;
                if inserted {
                    metrics::record_deposit_detected("eth");
                    info!(tx = tx.hash.as_str(), height, "New ETH deposit detected");
                }
            }
        }
        Ok(())
    }
}
