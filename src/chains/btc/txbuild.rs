//! BTC transaction assembly and signing for sweeps, withdrawals and OMNI
//! simple sends.
//!
//! All spendable outputs are P2SH-wrapped P2WPKH, so every input is signed
//! with the segwit v0 sighash over the key's P2WPKH script and carries the
//! redeem script in its script_sig.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use eyre::{eyre, Result, WrapErr};
use std::str::FromStr;

use crate::types::MIN_NONDUST_OUTPUT;

/// A UTXO being spent, with its signing key.
#[derive(Debug, Clone)]
pub struct TxInput {
    pub tx_id: String,
    pub vout_n: u32,
    pub value_sat: i64,
    pub wif: String,
}

/// A destination output.
#[derive(Debug, Clone)]
pub struct TxOutput {
    pub address: String,
    pub value_sat: i64,
}

/// Estimated virtual size for a transaction with the given shape.
/// Per-input cost assumes nested-segwit spends; the estimate errs high.
pub fn estimate_vsize(num_inputs: i64, num_outputs: i64, with_op_return: bool) -> i64 {
    let mut vsize = 11 + num_inputs * 92 + num_outputs * 34;
    if with_op_return {
        vsize += 32;
    }
    vsize
}

/// Actual virtual size of a built transaction.
pub fn tx_vsize(tx: &Transaction) -> i64 {
    tx.vsize() as i64
}

/// Consensus serialization as hex, ready for `sendrawtransaction`.
pub fn serialize_hex(tx: &Transaction) -> String {
    hex::encode(bitcoin::consensus::encode::serialize(tx))
}

fn outpoint(input: &TxInput) -> Result<OutPoint> {
    Ok(OutPoint {
        txid: Txid::from_str(&input.tx_id)
            .wrap_err_with(|| format!("bad input txid: {}", input.tx_id))?,
        vout: input.vout_n,
    })
}

fn unsigned_input(input: &TxInput) -> Result<TxIn> {
    Ok(TxIn {
        previous_output: outpoint(input)?,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    })
}

fn out_to(address: &str, value_sat: i64, network: Network) -> Result<TxOut> {
    if value_sat < 0 {
        return Err(eyre!("negative output value {value_sat} for {address}"));
    }
    Ok(TxOut {
        value: Amount::from_sat(value_sat as u64),
        script_pubkey: super::address_script(address, network)?,
    })
}

/// Sign every input as nested P2WPKH.
fn sign_all(unsigned: Transaction, inputs: &[TxInput]) -> Result<Transaction> {
    let secp = Secp256k1::new();
    let mut signed = unsigned.clone();
    let mut cache = SighashCache::new(&unsigned);
    for (i, input) in inputs.iter().enumerate() {
        let (privkey, compressed) = super::keypair_from_wif(&input.wif)?;
        let redeem = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
        if input.value_sat < 0 {
            return Err(eyre!("negative input value on {}", input.tx_id));
        }
        let sighash = cache.p2wpkh_signature_hash(
            i,
            &redeem,
            Amount::from_sat(input.value_sat as u64),
            EcdsaSighashType::All,
        )?;
        let msg = Message::from_digest(sighash.to_byte_array());
        let sig = bitcoin::ecdsa::Signature {
            signature: secp.sign_ecdsa(&msg, &privkey.inner),
            sighash_type: EcdsaSighashType::All,
        };
        signed.input[i].witness = Witness::p2wpkh(&sig, &compressed.0);

        let mut redeem_push = PushBytesBuf::new();
        redeem_push
            .extend_from_slice(redeem.as_bytes())
            .map_err(|_| eyre!("redeem script too long"))?;
        signed.input[i].script_sig = ScriptBuf::builder().push_slice(redeem_push).into_script();
    }
    Ok(signed)
}

/// Build and sign a plain spend: all `inputs`, the given `outputs`, and a
/// change output back to `change_address`. The miner fee is
/// `estimate_vsize × fee_rate`; a change below the dust floor is folded
/// into the fee. With no `outputs` this is a sweep and the change output
/// carries the whole remainder.
pub fn build_signed_tx(
    network: Network,
    inputs: &[TxInput],
    outputs: &[TxOutput],
    fee_rate: i64,
    change_address: &str,
) -> Result<Transaction> {
    if inputs.is_empty() {
        return Err(eyre!("transaction needs at least one input"));
    }
    let in_total: i64 = inputs.iter().map(|i| i.value_sat).sum();
    let out_total: i64 = outputs.iter().map(|o| o.value_sat).sum();

    let mut txouts = Vec::with_capacity(outputs.len() + 1);
    for out in outputs {
        txouts.push(out_to(&out.address, out.value_sat, network)?);
    }

    let fee_with_change =
        estimate_vsize(inputs.len() as i64, outputs.len() as i64 + 1, false) * fee_rate;
    let change = in_total - out_total - fee_with_change;
    if change >= MIN_NONDUST_OUTPUT {
        txouts.push(out_to(change_address, change, network)?);
    } else {
        let fee = estimate_vsize(inputs.len() as i64, outputs.len() as i64, false) * fee_rate;
        if in_total < out_total + fee {
            return Err(eyre!(
                "insufficient inputs: have {in_total} sat, need {} sat",
                out_total + fee
            ));
        }
        if txouts.is_empty() {
            return Err(eyre!("sweep value below dust after fee"));
        }
    }

    let unsigned = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs.iter().map(unsigned_input).collect::<Result<_>>()?,
        output: txouts,
    };
    sign_all(unsigned, inputs)
}

/// OMNI simple-send payload: "omni" | version 0 | type 0 | property | amount.
pub fn omni_simple_send_payload(token_index: i64, amount: i64) -> [u8; 20] {
    let mut payload = [0u8; 20];
    payload[0..4].copy_from_slice(b"omni");
    // bytes 4..6 transaction version, 6..8 transaction type: both zero
    payload[8..12].copy_from_slice(&(token_index as u32).to_be_bytes());
    payload[12..20].copy_from_slice(&(amount as u64).to_be_bytes());
    payload
}

/// Build and sign an OMNI-bearing transfer.
///
/// Structure: `vin = [omni_input, fee_inputs…]`,
/// `vout = [OP_RETURN simple-send, dust reference → to, change → change_address]`.
/// The first input's address is what the OMNI layer debits; the reference
/// output credits `to_address`.
pub fn build_omni_transfer(
    network: Network,
    omni_input: &TxInput,
    fee_inputs: &[TxInput],
    token_index: i64,
    token_amount: i64,
    to_address: &str,
    change_address: &str,
    fee_rate: i64,
) -> Result<Transaction> {
    let mut inputs = Vec::with_capacity(1 + fee_inputs.len());
    inputs.push(omni_input.clone());
    inputs.extend_from_slice(fee_inputs);

    let in_total: i64 = inputs.iter().map(|i| i.value_sat).sum();

    let payload = omni_simple_send_payload(token_index, token_amount);
    let mut payload_push = PushBytesBuf::new();
    payload_push
        .extend_from_slice(&payload)
        .map_err(|_| eyre!("omni payload too long"))?;

    let mut txouts = vec![
        TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(payload_push),
        },
        out_to(to_address, MIN_NONDUST_OUTPUT, network)?,
    ];

    let fee = estimate_vsize(inputs.len() as i64, 2, true) * fee_rate;
    let change = in_total - MIN_NONDUST_OUTPUT - fee;
    if change < 0 {
        return Err(eyre!(
            "insufficient fee inputs for omni transfer: have {in_total} sat, need {} sat",
            MIN_NONDUST_OUTPUT + fee
        ));
    }
    if change >= MIN_NONDUST_OUTPUT {
        txouts.push(out_to(change_address, change, network)?);
    }

    let unsigned = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs.iter().map(unsigned_input).collect::<Result<_>>()?,
        output: txouts,
    };
    sign_all(unsigned, &inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::btc::generate_keypair;

    const DUMMY_TXID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn input(value_sat: i64, wif: &str) -> TxInput {
        TxInput {
            tx_id: DUMMY_TXID.to_string(),
            vout_n: 0,
            value_sat,
            wif: wif.to_string(),
        }
    }

    #[test]
    fn test_withdraw_packing_outputs_and_change() {
        let network = Network::Regtest;
        let (wif, hot) = generate_keypair(network).unwrap();
        let (_, u1) = generate_keypair(network).unwrap();
        let (_, u2) = generate_keypair(network).unwrap();

        let inputs = vec![
            TxInput { vout_n: 0, ..input(60_000_000, &wif) },
            TxInput { vout_n: 1, ..input(40_000_000, &wif) },
        ];
        let outputs = vec![
            TxOutput { address: u1, value_sat: 30_000_000 },
            TxOutput { address: u2, value_sat: 50_000_000 },
        ];
        let tx = build_signed_tx(network, &inputs, &outputs, 10, &hot).unwrap();

        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0].value.to_sat(), 30_000_000);
        assert_eq!(tx.output[1].value.to_sat(), 50_000_000);

        let fee = estimate_vsize(2, 3, false) * 10;
        assert_eq!(tx.output[2].value.to_sat() as i64, 20_000_000 - fee);

        // every input signed: redeem script in script_sig, two witness items
        for txin in &tx.input {
            assert!(!txin.script_sig.is_empty());
            assert_eq!(txin.witness.len(), 2);
        }
        // the estimate must cover the real size
        assert!(tx_vsize(&tx) <= estimate_vsize(2, 3, false));
    }

    #[test]
    fn test_sweep_single_output() {
        let network = Network::Regtest;
        let (wif, _) = generate_keypair(network).unwrap();
        let (_, cold) = generate_keypair(network).unwrap();

        let inputs = vec![input(50_000_000, &wif)];
        let tx = build_signed_tx(network, &inputs, &[], 5, &cold).unwrap();
        assert_eq!(tx.output.len(), 1);
        let fee = estimate_vsize(1, 1, false) * 5;
        assert_eq!(tx.output[0].value.to_sat() as i64, 50_000_000 - fee);
    }

    #[test]
    fn test_insufficient_inputs_rejected() {
        let network = Network::Regtest;
        let (wif, hot) = generate_keypair(network).unwrap();
        let (_, dest) = generate_keypair(network).unwrap();

        let inputs = vec![input(1_000, &wif)];
        let outputs = vec![TxOutput { address: dest, value_sat: 900 }];
        assert!(build_signed_tx(network, &inputs, &outputs, 10, &hot).is_err());
    }

    #[test]
    fn test_omni_payload_layout() {
        let payload = omni_simple_send_payload(31, 10_000_000_000);
        assert_eq!(
            hex::encode(payload),
            "6f6d6e69000000000000001f00000002540be400"
        );
    }

    #[test]
    fn test_omni_transfer_structure() {
        let network = Network::Regtest;
        let (hot_wif, hot) = generate_keypair(network).unwrap();
        let (_, user) = generate_keypair(network).unwrap();

        let omni_in = input(100_000, &hot_wif);
        let fee_in = TxInput { vout_n: 1, ..input(500_000, &hot_wif) };
        let tx = build_omni_transfer(
            network,
            &omni_in,
            &[fee_in],
            31,
            10_000_000_000,
            &user,
            &hot,
            10,
        )
        .unwrap();

        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 3);
        // OP_RETURN marker first
        let script_hex = hex::encode(tx.output[0].script_pubkey.as_bytes());
        assert!(script_hex.starts_with(crate::types::OMNI_RETURN_PREFIX));
        // dust reference output to the credited party
        assert_eq!(tx.output[1].value.to_sat() as i64, MIN_NONDUST_OUTPUT);
        let fee = estimate_vsize(2, 2, true) * 10;
        assert_eq!(
            tx.output[2].value.to_sat() as i64,
            600_000 - MIN_NONDUST_OUTPUT - fee
        );
    }
}
