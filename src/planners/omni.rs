//! OMNI sweep and withdrawal planners.
//!
//! An OMNI-bearing transaction needs the source address's carrier UTXO
//! plus enough fee UTXOs (org-fee for sweeps, hot for withdrawals) to pay
//! the miner and carry the dust reference output.

use bitcoin::Network;
use eyre::{eyre, Result};
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use tracing::{error, info};

use crate::chains::btc::txbuild::{
    build_omni_transfer, estimate_vsize, serialize_hex, tx_vsize, TxInput,
};
use crate::db;
use crate::db::models::{BtcUtxo, NewBtcSend, OmniToken};
use crate::keyvault::KeyVault;
use crate::locks;
use crate::rpc::BtcRpcClient;
use crate::types::{OrgStatus, RelatedType, UtxoType, WithdrawStatus, MIN_NONDUST_OUTPUT};
use crate::units::{btc_to_sats, sats_to_btc};

#[derive(Clone)]
pub struct OmniPlanner {
    db: PgPool,
    rpc: BtcRpcClient,
    vault: KeyVault,
    network: Network,
}

/// Extend `fee_utxos` one at a time until the inputs cover the dust output
/// plus the estimated miner fee. Returns how many fee UTXOs to take.
/// `carrier_sat` is the value already provided by the carrier input (zero
/// for withdrawals, where the carrier is itself the first fee UTXO).
fn extend_fee_inputs(
    fee_utxos: &[BtcUtxo],
    carrier_sat: i64,
    extra_carrier_input: bool,
    fee_rate: i64,
) -> Result<Option<usize>> {
    for take in 1..=fee_utxos.len() {
        let num_inputs = take as i64 + if extra_carrier_input { 1 } else { 0 };
        let fee = estimate_vsize(num_inputs, 2, true) * fee_rate;
        let mut in_balance = carrier_sat;
        for utxo in &fee_utxos[..take] {
            in_balance += btc_to_sats(&utxo.value)?;
        }
        if in_balance >= MIN_NONDUST_OUTPUT + fee {
            return Ok(Some(take));
        }
    }
    Ok(None)
}

impl OmniPlanner {
    pub fn new(db: PgPool, rpc: BtcRpcClient, vault: KeyVault, network: Network) -> Self {
        Self { db, rpc, vault, network }
    }

    /// Sweep confirmed OMNI deposits to each token's cold address, one
    /// transaction per (address, token) group, fees paid by the token's
    /// org-fee address.
    pub async fn check_tx_org(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("OmniCheckTxOrg") else {
            return Ok(());
        };
        let mut tx = self.db.begin().await?;

        let deposits = db::omni_deposits_for_org_for_update(&mut *tx).await?;
        if deposits.is_empty() {
            return Ok(());
        }

        struct OrgItem {
            address: String,
            token_index: i64,
            balance_sat: i64,
            deposit_ids: Vec<i64>,
        }
        let mut groups: BTreeMap<(String, i64), OrgItem> = BTreeMap::new();
        for dep in &deposits {
            let key = (dep.to_address.clone(), dep.token_index);
            let item = groups.entry(key).or_insert_with(|| OrgItem {
                address: dep.to_address.clone(),
                token_index: dep.token_index,
                balance_sat: 0,
                deposit_ids: Vec::new(),
            });
            item.balance_sat += btc_to_sats(&dep.value)?;
            item.deposit_ids.push(dep.id);
        }

        let fee_rate = db::require_state_int(&mut *tx, "to_cold_gas_price_btc").await?;
        let tokens: HashMap<i64, OmniToken> = db::omni_tokens_all(&mut *tx)
            .await?
            .into_iter()
            .map(|t| (t.token_index, t))
            .collect();

        let mut key_addresses: Vec<String> =
            groups.values().map(|g| g.address.clone()).collect();
        let mut fee_addresses: Vec<String> = Vec::new();
        for token in tokens.values() {
            key_addresses.push(token.fee_address.clone());
            fee_addresses.push(token.fee_address.clone());
        }
        key_addresses.sort();
        key_addresses.dedup();
        fee_addresses.sort();
        fee_addresses.dedup();
        let wifs = self.unsealed_keys(&mut tx, &key_addresses).await?;

        let source_addresses: Vec<String> = groups.values().map(|g| g.address.clone()).collect();
        let mut omni_map = group_by_address(
            db::utxos_by_addresses_type_for_update(&mut *tx, &source_addresses, UtxoType::Omni.as_str()).await?,
        );
        let mut fee_map = group_by_address(
            db::utxos_by_addresses_type_for_update(&mut *tx, &fee_addresses, UtxoType::OmniOrgFee.as_str())
                .await?,
        );

        for item in groups.values() {
            let Some(token) = tokens.get(&item.token_index) else {
                error!(token_index = item.token_index, "no token config for sweep");
                break;
            };
            let omni_utxos = omni_map.remove(&item.address).unwrap_or_default();
            if omni_utxos.is_empty() {
                error!(address = item.address.as_str(), "omni org sender utxo limit");
                break;
            }
            let fee_utxos = fee_map.remove(&token.fee_address).unwrap_or_default();
            if fee_utxos.is_empty() {
                error!("omni org fee limit");
                break;
            }

            let carrier = &omni_utxos[0];
            let carrier_sat = btc_to_sats(&carrier.value)?;
            let Some(take) = extend_fee_inputs(&fee_utxos, carrier_sat, true, fee_rate)? else {
                error!("omni org fee limit");
                break;
            };

            let carrier_input = utxo_input(carrier, &wifs)?;
            let fee_inputs = fee_utxos[..take]
                .iter()
                .map(|u| utxo_input(u, &wifs))
                .collect::<Result<Vec<_>>>()?;
            let built = build_omni_transfer(
                self.network,
                &carrier_input,
                &fee_inputs,
                item.token_index,
                item.balance_sat,
                &token.cold_address,
                &token.fee_address,
                fee_rate,
            )?;
            let txid = built.compute_txid().to_string();

            for (i, dep_id) in item.deposit_ids.iter().enumerate() {
                let leader = i == 0;
                db::insert_btc_send(
                    &mut *tx,
                    &NewBtcSend {
                        related_type: RelatedType::OmniOrg.as_str().to_string(),
                        related_id: *dep_id,
                        token_id: item.token_index,
                        tx_id: txid.clone(),
                        from_address: item.address.clone(),
                        to_address: token.cold_address.clone(),
                        balance: if leader {
                            sats_to_btc(item.balance_sat)
                        } else {
                            "0".to_string()
                        },
                        gas: if leader { tx_vsize(&built) } else { 0 },
                        gas_price: if leader { fee_rate } else { 0 },
                        hex: if leader { serialize_hex(&built) } else { String::new() },
                    },
                )
                .await?;
            }

            db::mark_utxo_used(&mut *tx, carrier.id, &txid, 0).await?;
            for (i, utxo) in fee_utxos[..take].iter().enumerate() {
                db::mark_utxo_used(&mut *tx, utxo.id, &txid, i as i64 + 1).await?;
            }
            db::update_omni_deposits_org_status(&mut *tx, &item.deposit_ids, OrgStatus::Hex.as_str()).await?;

            // leftovers stay available to the next group
            omni_map.insert(item.address.clone(), omni_utxos[1..].to_vec());
            fee_map.insert(token.fee_address.clone(), fee_utxos[take..].to_vec());

            info!(
                txid = txid.as_str(),
                token = token.token_symbol.as_str(),
                amount = sats_to_btc(item.balance_sat).as_str(),
                "Planned OMNI sweep"
            );
        }

        tx.commit().await?;
        Ok(())
    }

    /// Plan OMNI withdrawals from each token's hot address, one
    /// transaction per withdrawal.
    pub async fn check_withdraw(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("OmniCheckWithdraw") else {
            return Ok(());
        };

        let tokens = db::omni_tokens_all(&self.db).await?;
        if tokens.is_empty() {
            return Ok(());
        }
        let token_by_symbol: HashMap<String, &OmniToken> =
            tokens.iter().map(|t| (t.token_symbol.clone(), t)).collect();
        let symbols: Vec<String> = tokens.iter().map(|t| t.token_symbol.clone()).collect();

        // hot balance minus what pending withdrawals already reserve
        let mut hot_balance: HashMap<i64, i64> = HashMap::new();
        for token in &tokens {
            let on_chain = self
                .rpc
                .omni_get_balance(&token.hot_address, token.token_index)
                .await?;
            let pending =
                db::btc_pending_token_sum(&self.db, &token.hot_address, token.token_index).await?;
            hot_balance.insert(
                token.token_index,
                btc_to_sats(&on_chain.balance)? - btc_to_sats(&pending)?,
            );
        }

        let mut tx = self.db.begin().await?;
        let withdraws = db::withdraws_by_status_for_update(&mut *tx, WithdrawStatus::Init.as_str(), &symbols).await?;
        if withdraws.is_empty() {
            return Ok(());
        }
        let fee_rate = db::require_state_int(&mut *tx, "to_user_gas_price_btc").await?;

        let hot_addresses: Vec<String> = {
            let mut v: Vec<String> = tokens.iter().map(|t| t.hot_address.clone()).collect();
            v.sort();
            v.dedup();
            v
        };
        let wifs = self.unsealed_keys(&mut tx, &hot_addresses).await?;
        let mut hot_map = group_by_address(
            db::utxos_by_addresses_type_for_update(&mut *tx, &hot_addresses, UtxoType::OmniHot.as_str()).await?,
        );

        for w in &withdraws {
            let Some(token) = token_by_symbol.get(&w.symbol) else {
                error!(symbol = w.symbol.as_str(), "no token config for withdraw");
                continue;
            };
            let amount_sat = btc_to_sats(&w.balance)?;
            let balance = hot_balance.entry(token.token_index).or_insert(0);
            if *balance - amount_sat < 0 {
                error!(token = token.token_symbol.as_str(), "omni token balance limit");
                continue;
            }

            let hot_utxos = hot_map.remove(&token.hot_address).unwrap_or_default();
            if hot_utxos.is_empty() {
                error!(withdraw = w.id, "omni hot utxo limit");
                continue;
            }
            // the first hot UTXO doubles as the carrier input
            let Some(take) = extend_fee_inputs(&hot_utxos, 0, false, fee_rate)? else {
                error!("omni withdraw fee limit");
                hot_map.insert(token.hot_address.clone(), hot_utxos);
                break;
            };

            let carrier_input = utxo_input(&hot_utxos[0], &wifs)?;
            let fee_inputs = hot_utxos[1..take]
                .iter()
                .map(|u| utxo_input(u, &wifs))
                .collect::<Result<Vec<_>>>()?;
            let built = build_omni_transfer(
                self.network,
                &carrier_input,
                &fee_inputs,
                token.token_index,
                amount_sat,
                &w.to_address,
                &token.hot_address,
                fee_rate,
            )?;
            let txid = built.compute_txid().to_string();

            db::insert_btc_send(
                &mut *tx,
                &NewBtcSend {
                    related_type: RelatedType::Withdraw.as_str().to_string(),
                    related_id: w.id,
                    token_id: token.token_index,
                    tx_id: txid.clone(),
                    from_address: token.hot_address.clone(),
                    to_address: w.to_address.clone(),
                    balance: w.balance.clone(),
                    gas: tx_vsize(&built),
                    gas_price: fee_rate,
                    hex: serialize_hex(&built),
                },
            )
            .await?;
            for (i, utxo) in hot_utxos[..take].iter().enumerate() {
                db::mark_utxo_used(&mut *tx, utxo.id, &txid, i as i64).await?;
            }
            db::update_withdraw_gen_tx(&mut *tx, w.id, &txid).await?;

            *balance -= amount_sat;
            hot_map.insert(token.hot_address.clone(), hot_utxos[take..].to_vec());

            info!(
                txid = txid.as_str(),
                withdraw = w.id,
                token = token.token_symbol.as_str(),
                "Planned OMNI withdrawal"
            );
        }

        tx.commit().await?;
        Ok(())
    }

    async fn unsealed_keys(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        addresses: &[String],
    ) -> Result<HashMap<String, String>> {
        let sealed = db::encrypted_keys_map(&mut **tx, addresses).await?;
        let mut out = HashMap::new();
        for address in addresses {
            let Some(blob) = sealed.get(address) else {
                return Err(eyre!("no signing key for address {address}"));
            };
            out.insert(address.clone(), self.vault.decrypt(blob)?);
        }
        Ok(out)
    }
}

fn utxo_input(utxo: &BtcUtxo, wifs: &HashMap<String, String>) -> Result<TxInput> {
    let wif = wifs
        .get(&utxo.address)
        .ok_or_else(|| eyre!("no signing key for address {}", utxo.address))?;
    Ok(TxInput {
        tx_id: utxo.tx_id.clone(),
        vout_n: utxo.vout_n as u32,
        value_sat: btc_to_sats(&utxo.value)?,
        wif: wif.clone(),
    })
}

fn group_by_address(rows: Vec<BtcUtxo>) -> HashMap<String, Vec<BtcUtxo>> {
    let mut map: HashMap<String, Vec<BtcUtxo>> = HashMap::new();
    for row in rows {
        map.entry(row.address.clone()).or_default().push(row);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(id: i64, value: &str) -> BtcUtxo {
        BtcUtxo {
            id,
            utxo_type: "omni_hot".to_string(),
            block_hash: String::new(),
            tx_id: "bb".repeat(32),
            vout_n: id,
            address: "hot".to_string(),
            value: value.to_string(),
            script: String::new(),
            spend_tx_id: String::new(),
            spend_n: 0,
            handle_status: "init".to_string(),
        }
    }

    #[test]
    fn test_single_utxo_covers_fee() {
        // 0.001 BTC easily covers dust + fee at 10 sat/vB
        let utxos = vec![utxo(1, "0.001")];
        assert_eq!(extend_fee_inputs(&utxos, 0, false, 10).unwrap(), Some(1));
    }

    #[test]
    fn test_extends_until_covered() {
        let utxos = vec![utxo(1, "0.00001"), utxo(2, "0.00001"), utxo(3, "0.001")];
        assert_eq!(extend_fee_inputs(&utxos, 0, false, 10).unwrap(), Some(3));
    }

    #[test]
    fn test_insufficient_fee_utxos() {
        let utxos = vec![utxo(1, "0.00000600")];
        assert_eq!(extend_fee_inputs(&utxos, 0, false, 10).unwrap(), None);
    }

    #[test]
    fn test_carrier_value_counts_toward_fee() {
        // carrier brings most of the value; one small fee input suffices
        let utxos = vec![utxo(1, "0.00003")];
        assert_eq!(extend_fee_inputs(&utxos, 100_000, true, 10).unwrap(), Some(1));
    }
}
