//! ETH sweep and withdrawal planners, and nonce allocation.

use alloy::primitives::U256;
use eyre::{eyre, Result};
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::chains::eth::{parse_address, sign_legacy_tx, signer_from_hex};
use crate::db;
use crate::db::models::NewEthSend;
use crate::keyvault::KeyVault;
use crate::locks;
use crate::rpc::EthRpcClient;
use crate::types::{OrgStatus, RelatedType, WithdrawStatus, ETH_SYMBOL, ETH_TRANSFER_GAS};
use crate::units::{eth_to_wei, wei_to_eth};

/// Allocate the next nonce for `address`:
/// `max(chain nonce, 1 + highest nonce ever written to eth_sends)`.
/// Within a planner transaction the Send row inserted right after
/// reservation is visible to the next MAX query, so allocation is
/// gap-free and monotonic across restarts.
pub async fn allocate_nonce(
    db: impl sqlx::PgExecutor<'_>,
    rpc: &EthRpcClient,
    address: &str,
) -> Result<i64> {
    let chain_nonce = rpc.nonce_at(address).await?;
    let db_nonce = db::max_eth_send_nonce(db, address).await?.map(|n| n + 1);
    Ok(chain_nonce.max(db_nonce.unwrap_or(0)))
}

#[derive(Clone)]
pub struct EthPlanner {
    db: PgPool,
    rpc: EthRpcClient,
    vault: KeyVault,
}

impl EthPlanner {
    pub fn new(db: PgPool, rpc: EthRpcClient, vault: KeyVault) -> Self {
        Self { db, rpc, vault }
    }

    /// Sweep confirmed ETH deposits to the cold wallet, one transaction
    /// per deposit address, paying the fee out of the swept value.
    pub async fn check_address_org(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("EthCheckAddressOrg") else {
            return Ok(());
        };
        let cold_str = db::require_state_str(&self.db, "cold_wallet_address_eth").await?;
        let cold = parse_address(&cold_str)?;

        let mut tx = self.db.begin().await?;
        let rows = db::eth_deposits_for_org_for_update(&mut *tx).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let gas_price = db::require_state_int(&mut *tx, "to_cold_gas_price_eth").await?;
        let fee_wei = U256::from(ETH_TRANSFER_GAS as u64) * U256::from(gas_price as u64);
        let chain_id = self.rpc.chain_id().await?;

        struct OrgInfo {
            deposit_ids: Vec<i64>,
            balance_wei: U256,
        }
        let mut groups: BTreeMap<String, OrgInfo> = BTreeMap::new();
        for row in &rows {
            let info = groups.entry(row.to_address.clone()).or_insert_with(|| OrgInfo {
                deposit_ids: Vec::new(),
                balance_wei: U256::ZERO,
            });
            info.deposit_ids.push(row.id);
            info.balance_wei += eth_to_wei(&row.value)?;
        }

        let addresses: Vec<String> = groups.keys().cloned().collect();
        let sealed = db::encrypted_keys_map(&mut *tx, &addresses).await?;

        for (address, info) in &groups {
            let Some(blob) = sealed.get(address) else {
                error!(address = address.as_str(), "no signing key for sweep source");
                continue;
            };
            let signer = signer_from_hex(&self.vault.decrypt(blob)?)?;

            if info.balance_wei <= fee_wei {
                continue;
            }
            let send_wei = info.balance_wei - fee_wei;
            let nonce = allocate_nonce(&mut *tx, &self.rpc, address).await?;
            let (tx_hash, raw) = sign_legacy_tx(
                &signer,
                chain_id,
                nonce,
                gas_price,
                ETH_TRANSFER_GAS,
                cold,
                send_wei,
                vec![],
            )?;

            for (i, dep_id) in info.deposit_ids.iter().enumerate() {
                let leader = i == 0;
                db::insert_eth_send(
                    &mut *tx,
                    &NewEthSend {
                        related_type: RelatedType::Tx.as_str().to_string(),
                        related_id: *dep_id,
                        token_id: 0,
                        tx_id: tx_hash.clone(),
                        from_address: address.clone(),
                        to_address: cold_str.clone(),
                        balance: if leader { wei_to_eth(send_wei) } else { "0".to_string() },
                        gas: if leader { ETH_TRANSFER_GAS } else { 0 },
                        gas_price: if leader { gas_price } else { 0 },
                        nonce: if leader { nonce } else { -1 },
                        hex: if leader { raw.clone() } else { String::new() },
                    },
                )
                .await?;
            }
            db::update_eth_deposits_org_status(&mut *tx, &info.deposit_ids, OrgStatus::Hex.as_str()).await?;

            info!(
                tx = tx_hash.as_str(),
                address = address.as_str(),
                amount = wei_to_eth(send_wei).as_str(),
                "Planned ETH sweep"
            );
        }

        tx.commit().await?;
        Ok(())
    }

    /// Plan queued ETH withdrawals from the hot wallet, one transaction
    /// per withdrawal, each in its own row-locked database transaction.
    pub async fn check_withdraw(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("EthCheckWithdraw") else {
            return Ok(());
        };
        let symbols = vec![ETH_SYMBOL.to_string()];
        let withdraws = db::withdraws_by_status(&self.db, WithdrawStatus::Init.as_str(), &symbols).await?;
        if withdraws.is_empty() {
            return Ok(());
        }

        let hot = db::require_state_str(&self.db, "hot_wallet_address_eth").await?;
        let blob = db::encrypted_key_for(&self.db, &hot)
            .await?
            .ok_or_else(|| eyre!("no signing key for hot wallet {hot}"))?;
        let signer = signer_from_hex(&self.vault.decrypt(&blob)?)?;

        let gas_price = db::require_state_int(&self.db, "to_user_gas_price_eth").await?;
        let fee_wei = U256::from(ETH_TRANSFER_GAS as u64) * U256::from(gas_price as u64);
        let chain_id = self.rpc.chain_id().await?;

        let on_chain = self.rpc.balance_at(&hot).await?;
        let pending = eth_to_wei(&db::eth_pending_sum(&self.db, &hot).await?)?;
        let mut available = on_chain.saturating_sub(pending);

        for w in &withdraws {
            match self
                .handle_withdraw(w.id, chain_id, &hot, &signer, available, gas_price, fee_wei)
                .await
            {
                Ok(Some(spent)) => available = available.saturating_sub(spent),
                Ok(None) => {}
                Err(e) => {
                    error!(withdraw = w.id, error = %e, "ETH withdrawal planning failed");
                }
            }
        }
        Ok(())
    }

    /// Returns the wei consumed from the hot balance, or None if skipped.
    #[allow(clippy::too_many_arguments)]
    async fn handle_withdraw(
        &self,
        withdraw_id: i64,
        chain_id: u64,
        hot: &str,
        signer: &alloy::signers::local::PrivateKeySigner,
        available: U256,
        gas_price: i64,
        fee_wei: U256,
    ) -> Result<Option<U256>> {
        let mut tx = self.db.begin().await?;
        let Some(w) = db::withdraw_by_id_for_update(&mut *tx, withdraw_id, WithdrawStatus::Init.as_str()).await? else {
            return Ok(None);
        };
        let wei = eth_to_wei(&w.balance)?;
        if available < wei + fee_wei {
            warn!(withdraw = w.id, "eth hot balance limit");
            return Ok(None);
        }

        let nonce = allocate_nonce(&mut *tx, &self.rpc, hot).await?;
        let to = parse_address(&w.to_address)?;
        let (tx_hash, raw) = sign_legacy_tx(
            signer,
            chain_id,
            nonce,
            gas_price,
            ETH_TRANSFER_GAS,
            to,
            wei,
            vec![],
        )?;

        db::update_withdraw_gen_tx(&mut *tx, w.id, &tx_hash).await?;
        db::insert_eth_send(
            &mut *tx,
            &NewEthSend {
                related_type: RelatedType::Withdraw.as_str().to_string(),
                related_id: w.id,
                token_id: 0,
                tx_id: tx_hash.clone(),
                from_address: hot.to_string(),
                to_address: w.to_address.clone(),
                balance: w.balance.clone(),
                gas: ETH_TRANSFER_GAS,
                gas_price,
                nonce,
                hex: raw,
            },
        )
        .await?;
        tx.commit().await?;

        info!(tx = tx_hash.as_str(), withdraw = w.id, "Planned ETH withdrawal");
        Ok(Some(wei + fee_wei))
    }
}
