//! ERC-20 two-phase sweep and withdrawal planners.
//!
//! Sweeping a token balance needs ETH at the deposit address for gas.
//! Groups whose address cannot pay the transfer fee are funded from the
//! ERC-20 fee wallet first (`fee_hex → fee_send → fee_confirm`); once the
//! funding confirms the next pass re-admits them into the transfer branch.

use alloy::primitives::U256;
use eyre::{eyre, Result};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use tracing::{error, info, warn};

use super::eth::allocate_nonce;
use crate::chains::eth::{parse_address, sign_legacy_tx, signer_from_hex, transfer_calldata};
use crate::db;
use crate::db::models::{Erc20Token, NewEthSend};
use crate::keyvault::KeyVault;
use crate::locks;
use crate::rpc::EthRpcClient;
use crate::types::{OrgStatus, RelatedType, WithdrawStatus, ETH_TRANSFER_GAS};
use crate::units::{eth_to_wei, token_to_units, units_to_token, wei_to_eth};

#[derive(Clone)]
pub struct Erc20Planner {
    db: PgPool,
    rpc: EthRpcClient,
    vault: KeyVault,
}

struct OrgGroup {
    address: String,
    token_id: i64,
    deposit_ids: Vec<i64>,
    token_units: U256,
}

impl Erc20Planner {
    pub fn new(db: PgPool, rpc: EthRpcClient, vault: KeyVault) -> Self {
        Self { db, rpc, vault }
    }

    /// Two-phase sweep of ERC-20 deposits, grouped by (address, token).
    pub async fn check_tx_org(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("Erc20CheckTxOrg") else {
            return Ok(());
        };
        let erc20_gas = db::require_state_int(&self.db, "erc20_gas_use").await?;
        let gas_price = db::require_state_int(&self.db, "to_cold_gas_price_eth").await?;
        let erc20_fee = U256::from(erc20_gas as u64) * U256::from(gas_price as u64);
        let eth_fee = U256::from(ETH_TRANSFER_GAS as u64) * U256::from(gas_price as u64);
        let chain_id = self.rpc.chain_id().await?;

        let mut tx = self.db.begin().await?;
        let rows = db::erc20_deposits_for_org_for_update(&mut *tx).await?;
        if rows.is_empty() {
            return Ok(());
        }

        let token_ids: Vec<i64> = {
            let mut v: Vec<i64> = rows.iter().map(|r| r.token_id).collect();
            v.sort();
            v.dedup();
            v
        };
        let tokens: HashMap<i64, Erc20Token> = db::erc20_tokens_by_ids(&mut *tx, &token_ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        let mut groups: BTreeMap<(String, i64), OrgGroup> = BTreeMap::new();
        for row in &rows {
            let token = tokens
                .get(&row.token_id)
                .ok_or_else(|| eyre!("no token config for id {}", row.token_id))?;
            let group = groups
                .entry((row.to_address.clone(), row.token_id))
                .or_insert_with(|| OrgGroup {
                    address: row.to_address.clone(),
                    token_id: row.token_id,
                    deposit_ids: Vec::new(),
                    token_units: U256::ZERO,
                });
            group.deposit_ids.push(row.id);
            group.token_units += token_to_units(&row.value, token.token_decimals)?;
        }

        // ETH balance per source address, shared across token groups
        let mut eth_balance: HashMap<String, U256> = HashMap::new();
        for group in groups.values() {
            if !eth_balance.contains_key(&group.address) {
                let balance = self.rpc.balance_at(&group.address).await?;
                eth_balance.insert(group.address.clone(), balance);
            }
        }

        let addresses: Vec<String> = {
            let mut v: Vec<String> = groups.values().map(|g| g.address.clone()).collect();
            v.sort();
            v.dedup();
            v
        };
        let sealed = db::encrypted_keys_map(&mut *tx, &addresses).await?;

        let mut needs_fee: Vec<&OrgGroup> = Vec::new();
        for group in groups.values() {
            let balance = eth_balance
                .get_mut(&group.address)
                .expect("balance prefetched above");
            if *balance < erc20_fee {
                needs_fee.push(group);
                continue;
            }
            *balance -= erc20_fee;

            let token = &tokens[&group.token_id];
            let min_units = token_to_units(&token.org_min_balance, token.token_decimals)?;
            if group.token_units < min_units {
                continue;
            }
            let Some(blob) = sealed.get(&group.address) else {
                error!(address = group.address.as_str(), "no signing key for sweep source");
                continue;
            };
            let signer = signer_from_hex(&self.vault.decrypt(blob)?)?;

            let nonce = allocate_nonce(&mut *tx, &self.rpc, &group.address).await?;
            let input = transfer_calldata(parse_address(&token.cold_address)?, group.token_units);
            let (tx_hash, raw) = sign_legacy_tx(
                &signer,
                chain_id,
                nonce,
                gas_price,
                erc20_gas,
                parse_address(&token.token_address)?,
                U256::ZERO,
                input,
            )?;

            let balance_str = units_to_token(group.token_units, token.token_decimals);
            for (i, dep_id) in group.deposit_ids.iter().enumerate() {
                let leader = i == 0;
                db::insert_eth_send(
                    &mut *tx,
                    &NewEthSend {
                        related_type: RelatedType::TxErc20.as_str().to_string(),
                        related_id: *dep_id,
                        token_id: group.token_id,
                        tx_id: tx_hash.clone(),
                        from_address: group.address.clone(),
                        to_address: token.cold_address.clone(),
                        balance: if leader { balance_str.clone() } else { "0".to_string() },
                        gas: if leader { erc20_gas } else { 0 },
                        gas_price: if leader { gas_price } else { 0 },
                        nonce: if leader { nonce } else { -1 },
                        hex: if leader { raw.clone() } else { String::new() },
                    },
                )
                .await?;
            }
            db::update_erc20_deposits_org_status(&mut *tx, &group.deposit_ids, OrgStatus::Hex.as_str()).await?;

            info!(
                tx = tx_hash.as_str(),
                token = token.token_symbol.as_str(),
                amount = balance_str.as_str(),
                "Planned ERC-20 sweep"
            );
        }

        if !needs_fee.is_empty() {
            self.fund_fee_groups(
                &mut tx,
                &needs_fee,
                chain_id,
                gas_price,
                erc20_fee,
                eth_fee,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Send `erc20_fee` wei from the fee wallet to each gas-starved group
    /// address and park the group in `fee_hex`.
    async fn fund_fee_groups(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        groups: &[&OrgGroup],
        chain_id: u64,
        gas_price: i64,
        erc20_fee: U256,
        eth_fee: U256,
    ) -> Result<()> {
        let fee_wallet = db::require_state_str(&mut **tx, "fee_wallet_address_erc20").await?;
        let blob = db::encrypted_key_for(&mut **tx, &fee_wallet)
            .await?
            .ok_or_else(|| eyre!("no signing key for fee wallet {fee_wallet}"))?;
        let signer = signer_from_hex(&self.vault.decrypt(&blob)?)?;

        let on_chain = self.rpc.balance_at(&fee_wallet).await?;
        let pending = eth_to_wei(&db::eth_pending_sum(&mut **tx, &fee_wallet).await?)?;
        let mut available = on_chain.saturating_sub(pending);

        for group in groups {
            let cost = eth_fee + erc20_fee;
            if available < cost {
                return Err(eyre!("eth fee wallet balance limit"));
            }
            available -= cost;

            let nonce = allocate_nonce(&mut **tx, &self.rpc, &fee_wallet).await?;
            let (tx_hash, raw) = sign_legacy_tx(
                &signer,
                chain_id,
                nonce,
                gas_price,
                ETH_TRANSFER_GAS,
                parse_address(&group.address)?,
                erc20_fee,
                vec![],
            )?;

            for (i, dep_id) in group.deposit_ids.iter().enumerate() {
                let leader = i == 0;
                db::insert_eth_send(
                    &mut **tx,
                    &NewEthSend {
                        related_type: RelatedType::TxErc20Fee.as_str().to_string(),
                        related_id: *dep_id,
                        token_id: 0,
                        tx_id: tx_hash.clone(),
                        from_address: fee_wallet.clone(),
                        to_address: group.address.clone(),
                        balance: if leader { wei_to_eth(erc20_fee) } else { "0".to_string() },
                        gas: if leader { ETH_TRANSFER_GAS } else { 0 },
                        gas_price: if leader { gas_price } else { 0 },
                        nonce: if leader { nonce } else { -1 },
                        hex: if leader { raw.clone() } else { String::new() },
                    },
                )
                .await?;
            }
            db::update_erc20_deposits_org_status(&mut **tx, &group.deposit_ids, OrgStatus::FeeHex.as_str())
                .await?;

            info!(
                tx = tx_hash.as_str(),
                address = group.address.as_str(),
                "Planned ERC-20 sweep fee funding"
            );
        }
        Ok(())
    }

    /// Plan queued token withdrawals from each token's hot address.
    pub async fn check_withdraw(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("Erc20CheckWithdraw") else {
            return Ok(());
        };
        let tokens = db::erc20_tokens_all(&self.db).await?;
        if tokens.is_empty() {
            return Ok(());
        }
        let token_by_symbol: HashMap<String, &Erc20Token> =
            tokens.iter().map(|t| (t.token_symbol.clone(), t)).collect();
        let symbols: Vec<String> = tokens.iter().map(|t| t.token_symbol.clone()).collect();

        let withdraws = db::withdraws_by_status(&self.db, WithdrawStatus::Init.as_str(), &symbols).await?;
        if withdraws.is_empty() {
            return Ok(());
        }

        let gas_price = db::require_state_int(&self.db, "to_user_gas_price_eth").await?;
        let erc20_gas = db::require_state_int(&self.db, "erc20_gas_use").await?;
        let fee_wei = U256::from(erc20_gas as u64) * U256::from(gas_price as u64);
        let chain_id = self.rpc.chain_id().await?;

        // per hot address: signer, spendable ETH; per (hot, token): token units
        let mut signers: HashMap<String, alloy::signers::local::PrivateKeySigner> = HashMap::new();
        let mut eth_balance: HashMap<String, U256> = HashMap::new();
        let mut token_balance: HashMap<(String, i64), U256> = HashMap::new();
        for token in &tokens {
            if !signers.contains_key(&token.hot_address) {
                let blob = db::encrypted_key_for(&self.db, &token.hot_address)
                    .await?
                    .ok_or_else(|| eyre!("no signing key for hot wallet {}", token.hot_address))?;
                signers.insert(
                    token.hot_address.clone(),
                    signer_from_hex(&self.vault.decrypt(&blob)?)?,
                );
                let on_chain = self.rpc.balance_at(&token.hot_address).await?;
                let pending =
                    eth_to_wei(&db::eth_pending_sum(&self.db, &token.hot_address).await?)?;
                eth_balance.insert(token.hot_address.clone(), on_chain.saturating_sub(pending));
            }
            let units = self
                .rpc
                .token_balance(&token.token_address, &token.hot_address)
                .await?;
            token_balance.insert((token.hot_address.clone(), token.id), units);
        }

        for w in &withdraws {
            let Some(token) = token_by_symbol.get(&w.symbol) else {
                error!(symbol = w.symbol.as_str(), "no token config for withdraw");
                continue;
            };
            if let Err(e) = self
                .handle_withdraw(
                    w.id,
                    token,
                    chain_id,
                    gas_price,
                    erc20_gas,
                    fee_wei,
                    &signers,
                    &mut eth_balance,
                    &mut token_balance,
                )
                .await
            {
                error!(withdraw = w.id, error = %e, "ERC-20 withdrawal planning failed");
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_withdraw(
        &self,
        withdraw_id: i64,
        token: &Erc20Token,
        chain_id: u64,
        gas_price: i64,
        erc20_gas: i64,
        fee_wei: U256,
        signers: &HashMap<String, alloy::signers::local::PrivateKeySigner>,
        eth_balance: &mut HashMap<String, U256>,
        token_balance: &mut HashMap<(String, i64), U256>,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let Some(w) = db::withdraw_by_id_for_update(&mut *tx, withdraw_id, WithdrawStatus::Init.as_str()).await? else {
            return Ok(());
        };
        let hot = &token.hot_address;
        let signer = signers
            .get(hot)
            .ok_or_else(|| eyre!("no signer for hot wallet {hot}"))?;

        let eth = eth_balance.get_mut(hot).expect("balance prefetched");
        if *eth < fee_wei {
            warn!(hot = hot.as_str(), "erc20 hot wallet eth limit");
            return Ok(());
        }
        let units = token_to_units(&w.balance, token.token_decimals)?;
        let held = token_balance
            .get_mut(&(hot.clone(), token.id))
            .expect("token balance prefetched");
        if *held < units {
            warn!(hot = hot.as_str(), token = token.token_symbol.as_str(), "erc20 token balance limit");
            return Ok(());
        }

        let nonce = allocate_nonce(&mut *tx, &self.rpc, hot).await?;
        let input = transfer_calldata(parse_address(&w.to_address)?, units);
        let (tx_hash, raw) = sign_legacy_tx(
            signer,
            chain_id,
            nonce,
            gas_price,
            erc20_gas,
            parse_address(&token.token_address)?,
            U256::ZERO,
            input,
        )?;

        db::update_withdraw_gen_tx(&mut *tx, w.id, &tx_hash).await?;
        db::insert_eth_send(
            &mut *tx,
            &NewEthSend {
                related_type: RelatedType::Withdraw.as_str().to_string(),
                related_id: w.id,
                token_id: token.id,
                tx_id: tx_hash.clone(),
                from_address: hot.clone(),
                to_address: w.to_address.clone(),
                balance: w.balance.clone(),
                gas: erc20_gas,
                gas_price,
                nonce,
                hex: raw,
            },
        )
        .await?;
        tx.commit().await?;

        *eth -= fee_wei;
        *held -= units;
        info!(
            tx = tx_hash.as_str(),
            withdraw = w.id,
            token = token.token_symbol.as_str(),
            "Planned ERC-20 withdrawal"
        );
        Ok(())
    }
}
