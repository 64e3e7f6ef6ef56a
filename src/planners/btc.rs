//! BTC sweep-to-cold and withdrawal planners.

use bitcoin::Network;
use eyre::{eyre, Result};
use sqlx::PgPool;
use tracing::{error, info};

use crate::chains::btc::txbuild::{
    build_signed_tx, estimate_vsize, serialize_hex, tx_vsize, TxInput, TxOutput,
};
use crate::db;
use crate::db::models::{BtcUtxo, NewBtcSend, Withdraw};
use crate::keyvault::KeyVault;
use crate::locks;
use crate::types::{RelatedType, UtxoType, WithdrawStatus, BTC_SYMBOL, MAX_TX_SIZE, SWEEP_MAX_INPUTS};
use crate::units::{btc_to_sats, sats_to_btc};

#[derive(Clone)]
pub struct BtcPlanner {
    db: PgPool,
    vault: KeyVault,
    network: Network,
}

impl BtcPlanner {
    pub fn new(db: PgPool, vault: KeyVault, network: Network) -> Self {
        Self { db, vault, network }
    }

    /// Sweep every spendable tenant-deposit UTXO to the cold wallet, in
    /// chunks of at most `SWEEP_MAX_INPUTS` inputs per transaction.
    pub async fn check_tx_org(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("BtcCheckTxOrg") else {
            return Ok(());
        };
        let mut tx = self.db.begin().await?;

        let utxos = db::utxos_for_sweep_for_update(&mut *tx).await?;
        if utxos.is_empty() {
            return Ok(());
        }
        let cold = db::require_state_str(&mut *tx, "cold_wallet_address_btc").await?;
        let fee_rate = db::require_state_int(&mut *tx, "to_cold_gas_price_btc").await?;

        let mut addresses: Vec<String> = utxos.iter().map(|u| u.address.clone()).collect();
        addresses.sort();
        addresses.dedup();
        let wifs = self.unsealed_keys(&mut tx, &addresses).await?;

        for chunk in utxos.chunks(SWEEP_MAX_INPUTS) {
            let inputs = chunk
                .iter()
                .map(|u| utxo_input(u, &wifs))
                .collect::<Result<Vec<_>>>()?;
            let built = build_signed_tx(self.network, &inputs, &[], fee_rate, &cold)?;
            let txid = built.compute_txid().to_string();
            let swept = sats_to_btc(built.output[0].value.to_sat() as i64);

            for (i, utxo) in chunk.iter().enumerate() {
                let leader = i == 0;
                db::insert_btc_send(
                    &mut *tx,
                    &NewBtcSend {
                        related_type: RelatedType::Tx.as_str().to_string(),
                        related_id: utxo.id,
                        token_id: 0,
                        tx_id: txid.clone(),
                        from_address: utxo.address.clone(),
                        to_address: cold.clone(),
                        balance: if leader { swept.clone() } else { "0".to_string() },
                        gas: if leader { tx_vsize(&built) } else { 0 },
                        gas_price: if leader { fee_rate } else { 0 },
                        hex: if leader { serialize_hex(&built) } else { String::new() },
                    },
                )
                .await?;
                db::mark_utxo_used(&mut *tx, utxo.id, &txid, i as i64).await?;
            }
            info!(
                txid = txid.as_str(),
                inputs = chunk.len(),
                swept = swept.as_str(),
                "Planned BTC sweep"
            );
        }

        tx.commit().await?;
        Ok(())
    }

    /// Pack queued BTC withdrawals into one hot-wallet transaction,
    /// greedily extending the input set until each withdrawal is covered.
    /// A withdrawal the inputs cannot cover stops the packing; later
    /// withdrawals wait for the next tick.
    pub async fn check_withdraw(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("BtcCheckWithdraw") else {
            return Ok(());
        };
        let mut tx = self.db.begin().await?;

        let symbols = vec![BTC_SYMBOL.to_string()];
        let withdraws = db::withdraws_by_status_for_update(&mut *tx, WithdrawStatus::Init.as_str(), &symbols).await?;
        if withdraws.is_empty() {
            return Ok(());
        }
        let fee_rate = db::require_state_int(&mut *tx, "to_user_gas_price_btc").await?;
        let hot = db::require_state_str(&mut *tx, "hot_wallet_address_btc").await?;
        let hot_utxos = db::utxos_by_address_type_for_update(&mut *tx, &hot, UtxoType::Hot.as_str()).await?;
        let wifs = self.unsealed_keys(&mut tx, &[hot.clone()]).await?;

        let (selected_utxos, selected_withdraws) =
            pack_withdrawals(&withdraws, &hot_utxos, fee_rate)?;
        if selected_utxos.is_empty() || selected_withdraws.is_empty() {
            error!("btc hot balance limit");
            return Ok(());
        }

        let inputs = selected_utxos
            .iter()
            .map(|u| utxo_input(u, &wifs))
            .collect::<Result<Vec<_>>>()?;
        let outputs = selected_withdraws
            .iter()
            .map(|w| {
                Ok(TxOutput {
                    address: w.to_address.clone(),
                    value_sat: btc_to_sats(&w.balance)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let built = build_signed_tx(self.network, &inputs, &outputs, fee_rate, &hot)?;
        let txid = built.compute_txid().to_string();

        for (i, w) in selected_withdraws.iter().enumerate() {
            let leader = i == 0;
            db::insert_btc_send(
                &mut *tx,
                &NewBtcSend {
                    related_type: RelatedType::Withdraw.as_str().to_string(),
                    related_id: w.id,
                    token_id: 0,
                    tx_id: txid.clone(),
                    from_address: hot.clone(),
                    to_address: w.to_address.clone(),
                    balance: w.balance.clone(),
                    gas: if leader { tx_vsize(&built) } else { 0 },
                    gas_price: if leader { fee_rate } else { 0 },
                    hex: if leader { serialize_hex(&built) } else { String::new() },
                },
            )
            .await?;
            // co-packed outputs get distinguishable callback hashes
            db::update_withdraw_gen_tx(&mut *tx, w.id, &format!("{txid}_{i}")).await?;
        }
        for (i, utxo) in selected_utxos.iter().enumerate() {
            db::mark_utxo_used(&mut *tx, utxo.id, &txid, i as i64).await?;
        }

        info!(
            txid = txid.as_str(),
            withdraws = selected_withdraws.len(),
            inputs = selected_utxos.len(),
            "Planned BTC withdrawal tx"
        );
        tx.commit().await?;
        Ok(())
    }

    async fn unsealed_keys(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        addresses: &[String],
    ) -> Result<std::collections::HashMap<String, String>> {
        let sealed = db::encrypted_keys_map(&mut **tx, addresses).await?;
        let mut out = std::collections::HashMap::new();
        for address in addresses {
            let Some(blob) = sealed.get(address) else {
                return Err(eyre!("no signing key for address {address}"));
            };
            out.insert(address.clone(), self.vault.decrypt(blob)?);
        }
        Ok(out)
    }
}

fn utxo_input(
    utxo: &BtcUtxo,
    wifs: &std::collections::HashMap<String, String>,
) -> Result<TxInput> {
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

/// Greedy packing: for each withdrawal in queue order, extend the input
/// set one UTXO at a time until it covers outputs + fee; stop at the first
/// withdrawal the remaining inputs cannot fund, or when the transaction
/// would exceed `MAX_TX_SIZE`.
pub(crate) fn pack_withdrawals<'a>(
    withdraws: &'a [Withdraw],
    hot_utxos: &'a [BtcUtxo],
    fee_rate: i64,
) -> Result<(Vec<&'a BtcUtxo>, Vec<&'a Withdraw>)> {
    let mut in_balance: i64 = 0;
    let mut out_balance: i64 = 0;
    let mut utxo_idx = 0usize;
    let mut selected_utxos: Vec<&BtcUtxo> = Vec::new();
    let mut selected_withdraws: Vec<&Withdraw> = Vec::new();

    for w in withdraws {
        let out_sat = btc_to_sats(&w.balance)?;
        let candidate_out = out_balance + out_sat;
        let mut pending: Vec<&BtcUtxo> = Vec::new();
        let mut covered = false;
        loop {
            let num_inputs = (selected_utxos.len() + pending.len()) as i64;
            // outputs: already-packed withdrawals, this one, and change
            let num_outputs = selected_withdraws.len() as i64 + 2;
            let est_size = estimate_vsize(num_inputs, num_outputs, false);
            if in_balance >= candidate_out + est_size * fee_rate {
                covered = true;
                break;
            }
            if est_size >= MAX_TX_SIZE {
                break;
            }
            let Some(utxo) = hot_utxos.get(utxo_idx) else {
                break;
            };
            in_balance += btc_to_sats(&utxo.value)?;
            pending.push(utxo);
            utxo_idx += 1;
        }
        if !covered {
            break;
        }
        out_balance = candidate_out;
        selected_withdraws.push(w);
        selected_utxos.extend(pending);
    }
    Ok((selected_utxos, selected_withdraws))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(id: i64, value: &str) -> BtcUtxo {
        BtcUtxo {
            id,
            utxo_type: "hot".to_string(),
            block_hash: String::new(),
            tx_id: "aa".repeat(32),
            vout_n: id,
            address: "hot".to_string(),
            value: value.to_string(),
            script: String::new(),
            spend_tx_id: String::new(),
            spend_n: 0,
            handle_status: "init".to_string(),
        }
    }

    fn withdraw(id: i64, balance: &str) -> Withdraw {
        Withdraw {
            id,
            product_id: 1,
            out_serial: format!("serial-{id}"),
            symbol: "btc".to_string(),
            to_address: format!("user-{id}"),
            balance: balance.to_string(),
            tx_hash: String::new(),
            handle_status: "init".to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_packs_both_withdrawals_over_two_inputs() {
        let utxos = vec![utxo(1, "0.6"), utxo(2, "0.4")];
        let withdraws = vec![withdraw(1, "0.3"), withdraw(2, "0.5")];
        let (sel_u, sel_w) = pack_withdrawals(&withdraws, &utxos, 10).unwrap();
        assert_eq!(sel_w.len(), 2);
        assert_eq!(sel_u.len(), 2);
    }

    #[test]
    fn test_stops_at_uncovered_withdrawal() {
        let utxos = vec![utxo(1, "0.35")];
        let withdraws = vec![withdraw(1, "0.3"), withdraw(2, "0.5")];
        let (sel_u, sel_w) = pack_withdrawals(&withdraws, &utxos, 10).unwrap();
        // first withdrawal fits, second must wait
        assert_eq!(sel_w.len(), 1);
        assert_eq!(sel_w[0].id, 1);
        assert_eq!(sel_u.len(), 1);
    }

    #[test]
    fn test_nothing_packed_without_funds() {
        let utxos: Vec<BtcUtxo> = vec![];
        let withdraws = vec![withdraw(1, "0.3")];
        let (sel_u, sel_w) = pack_withdrawals(&withdraws, &utxos, 10).unwrap();
        assert!(sel_u.is_empty());
        assert!(sel_w.is_empty());
    }

    #[test]
    fn test_small_withdrawal_reuses_surplus_inputs() {
        // one large input covers both withdrawals; no extra input pulled
        let utxos = vec![utxo(1, "2"), utxo(2, "1")];
        let withdraws = vec![withdraw(1, "0.5"), withdraw(2, "0.5")];
        let (sel_u, sel_w) = pack_withdrawals(&withdraws, &utxos, 10).unwrap();
        assert_eq!(sel_w.len(), 2);
        assert_eq!(sel_u.len(), 1);
    }
}
