//! ERC-20 deposit block seeker.
//!
//! Filters `Transfer` logs for the configured token contracts and accepts
//! only direct `transfer(to, tokens)` calls: the parent transaction must
//! target the token contract, succeed, and carry exactly the re-encoded
//! calldata. Internal-call-only transfers never become deposits.

use eyre::Result;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::chains::eth::{parse_address, transfer_calldata, transfer_topic0};
use crate::db;
use crate::db::models::{Erc20Token, NewErc20Deposit};
use crate::locks;
use crate::metrics;
use crate::rpc::eth::{hex_to_u256, EthLog, EthRpcClient};
use crate::units::units_to_token;

#[derive(Clone)]
pub struct Erc20DepositSeeker {
    db: PgPool,
    rpc: EthRpcClient,
}

impl Erc20DepositSeeker {
    pub fn new(db: PgPool, rpc: EthRpcClient) -> Self {
        Self { db, rpc }
    }

    pub async fn step(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("Erc20CheckBlockSeek") else {
            return Ok(());
        };
        let confirm = db::require_state_int(&self.db, "block_confirm_num").await?;
        let seek = db::require_state_int(&self.db, "erc20_seek_num").await?;
        let tip = self.rpc.block_number().await?;

        let start = seek + 1;
        let end = tip - confirm + 1;
        if start >= end {
            return Ok(());
        }

        let tokens = db::erc20_tokens_all(&self.db).await?;
        let token_map: HashMap<String, Erc20Token> = tokens
            .into_iter()
            .map(|t| (t.token_address.to_lowercase(), t))
            .collect();
        let token_addresses: Vec<String> = token_map.keys().cloned().collect();

        for height in start..end {
            if !token_addresses.is_empty() {
                self.process_block(height, &token_addresses, &token_map).await?;
            }
            db::advance_state_int(&self.db, "erc20_seek_num", height).await?;
            metrics::record_block_processed("erc20", height as u64);
        }
        Ok(())
    }

    async fn process_block(
        &self,
        height: i64,
        token_addresses: &[String],
        token_map: &HashMap<String, Erc20Token>,
    ) -> Result<()> {
        let logs = self
            .rpc
            .filter_logs(height, height, token_addresses, &transfer_topic0())
            .await?;

        let mut candidates: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let mut by_address: HashMap<String, Vec<&EthLog>> = HashMap::new();
        for log in &logs {
            if log.removed || log.topics.len() != 3 {
                continue;
            }
            let to = crate::chains::eth::topic_to_address(&log.topics[2])?;
            if seen.insert(to.clone()) {
                candidates.push(to.clone());
            }
            by_address.entry(to).or_default().push(log);
        }

        let owned: HashMap<String, i64> = db::addresses_in(&self.db, &candidates)
            .await?
            .into_iter()
            .map(|r| (r.address, r.use_tag))
            .collect();

        for (address, logs) in &by_address {
            let Some(&use_tag) = owned.get(address) else {
                continue;
            };
            if use_tag <= 0 {
                continue;
            }
            for log in logs {
                if let Some(dep) = self.verify_log(address, use_tag, log, token_map).await? {
                    if db::insert_erc20_deposit(&self.db, &dep).await? {
                        metrics::record_deposit_detected("erc20");
                        info!(
                            tx = log.transaction_hash.as_str(),
                            height,
                            token = dep.token_id,
                            "New ERC-20 deposit detected"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Cross-check one Transfer log against its parent transaction.
    async fn verify_log(
        &self,
        to_address: &str,
        use_tag: i64,
        log: &EthLog,
        token_map: &HashMap<String, Erc20Token>,
    ) -> Result<Option<NewErc20Deposit>> {
        let contract = log.address.to_lowercase();
        let Some(token) = token_map.get(&contract) else {
            return Ok(None);
        };
        let amount = hex_to_u256(&log.data)?;

        let Some(receipt) = self.rpc.transaction_receipt(&log.transaction_hash).await? else {
            return Ok(None);
        };
        if receipt.status.as_deref() != Some("0x1") {
            debug!(tx = log.transaction_hash.as_str(), "transfer tx reverted, skipping");
            return Ok(None);
        }

        let Some(tx) = self.rpc.transaction_by_hash(&log.transaction_hash).await? else {
            return Ok(None);
        };
        if tx.to.as_deref().map(|t| t.to_lowercase()) != Some(contract.clone()) {
            // an internal call raised the event, not a direct transfer
            return Ok(None);
        }
        let expected = transfer_calldata(parse_address(to_address)?, amount);
        let actual = tx.input.trim_start_matches("0x").to_lowercase();
        if actual != hex::encode(&expected) {
            return Ok(None);
        }

        let from = crate::chains::eth::topic_to_address(&log.topics[1])?;
        Ok(Some(NewErc20Deposit {
            token_id: token.id,
            product_id: use_tag,
            tx_id: log.transaction_hash.to_lowercase(),
            from_address: from,
            to_address: to_address.to_string(),
            value: units_to_token(amount, token.token_decimals),
        }))
    }
}
