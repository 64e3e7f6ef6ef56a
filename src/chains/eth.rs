//! ETH keys, legacy EIP-155 signing, and the minimal ERC-20 ABI surface.
//!
//! Addresses are normalized to lowercase hex everywhere; tenant addresses
//! are stored that way and classification compares on the normalized form.

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::network::TxSignerSync;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use eyre::{eyre, Result, WrapErr};

sol! {
    /// ERC-20 surface used by the sweep and withdrawal planners.
    contract Erc20 {
        function transfer(address to, uint256 amount) external returns (bool);
        function balanceOf(address owner) external view returns (uint256);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// Generate a fresh keypair: (0x-hex secret, lowercase 0x address).
pub fn generate_keypair() -> (String, String) {
    let signer = PrivateKeySigner::random();
    let secret = format!("0x{}", hex::encode(signer.to_bytes()));
    (secret, addr_to_lower(signer.address()))
}

/// Rebuild a signer from a stored 0x-hex secret.
pub fn signer_from_hex(secret: &str) -> Result<PrivateKeySigner> {
    secret
        .trim()
        .trim_start_matches("0x")
        .parse::<PrivateKeySigner>()
        .map_err(|e| eyre!("bad ETH private key: {e}"))
}

/// Lowercase 0x form of an address.
pub fn addr_to_lower(address: Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Parse a 0x-hex address string.
pub fn parse_address(address: &str) -> Result<Address> {
    address
        .trim()
        .parse::<Address>()
        .wrap_err_with(|| format!("bad ETH address: {address}"))
}

/// Sign a legacy (EIP-155) transaction. Returns (lowercase tx hash, raw
/// RLP hex without 0x prefix).
pub fn sign_legacy_tx(
    signer: &PrivateKeySigner,
    chain_id: u64,
    nonce: i64,
    gas_price: i64,
    gas_limit: i64,
    to: Address,
    value: U256,
    input: Vec<u8>,
) -> Result<(String, String)> {
    if nonce < 0 || gas_price < 0 || gas_limit < 0 {
        return Err(eyre!("negative transaction field"));
    }
    let mut tx = TxLegacy {
        chain_id: Some(chain_id),
        nonce: nonce as u64,
        gas_price: gas_price as u128,
        gas_limit: gas_limit as u64,
        to: TxKind::Call(to),
        value,
        input: Bytes::from(input),
    };
    let signature = signer
        .sign_transaction_sync(&mut tx)
        .wrap_err("signing failed")?;
    let envelope = TxEnvelope::Legacy(tx.into_signed(signature));

    use alloy::eips::eip2718::Encodable2718;
    let raw = envelope.encoded_2718();
    let tx_hash = format!("0x{}", hex::encode(envelope.tx_hash().as_slice()));
    Ok((tx_hash, hex::encode(raw)))
}

/// ABI-encoded `transfer(to, amount)` calldata.
pub fn transfer_calldata(to: Address, amount: U256) -> Vec<u8> {
    Erc20::transferCall { to, amount }.abi_encode()
}

/// ABI-encoded `balanceOf(holder)` calldata as 0x hex, for `eth_call`.
pub fn balance_of_calldata(holder: &str) -> Result<String> {
    let owner = parse_address(holder)?;
    Ok(format!(
        "0x{}",
        hex::encode(Erc20::balanceOfCall { owner }.abi_encode())
    ))
}

/// topic0 of the ERC-20 `Transfer` event, 0x-hex.
pub fn transfer_topic0() -> String {
    format!("0x{}", hex::encode(Erc20::Transfer::SIGNATURE_HASH))
}

/// Pull the address out of an indexed 32-byte log topic.
pub fn topic_to_address(topic: &str) -> Result<String> {
    let bytes = hex::decode(topic.trim_start_matches("0x"))
        .wrap_err_with(|| format!("bad log topic: {topic}"))?;
    if bytes.len() != 32 {
        return Err(eyre!("log topic must be 32 bytes"));
    }
    Ok(format!("0x{}", hex::encode(&bytes[12..])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_shape() {
        let (secret, address) = generate_keypair();
        assert!(secret.starts_with("0x") && secret.len() == 66);
        assert!(address.starts_with("0x") && address.len() == 42);
        assert_eq!(address, address.to_lowercase());

        let signer = signer_from_hex(&secret).unwrap();
        assert_eq!(addr_to_lower(signer.address()), address);
    }

    #[test]
    fn test_sign_legacy_deterministic() {
        let signer = signer_from_hex(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        let to = parse_address("0x70997970c51812dc3a010c7d01b50e0d17dc79c8").unwrap();
        let (hash_a, raw_a) =
            sign_legacy_tx(&signer, 1, 5, 1_000_000_000, 21_000, to, U256::from(1u64), vec![])
                .unwrap();
        let (hash_b, raw_b) =
            sign_legacy_tx(&signer, 1, 5, 1_000_000_000, 21_000, to, U256::from(1u64), vec![])
                .unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(raw_a, raw_b);
        assert!(hash_a.starts_with("0x") && hash_a.len() == 66);
        assert_eq!(hash_a, hash_a.to_lowercase());
    }

    #[test]
    fn test_transfer_topic0_matches_known_signature() {
        // keccak256("Transfer(address,address,uint256)")
        assert_eq!(
            transfer_topic0(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_transfer_calldata_selector() {
        let to = parse_address("0x70997970c51812dc3a010c7d01b50e0d17dc79c8").unwrap();
        let data = transfer_calldata(to, U256::from(100u64));
        // selector for transfer(address,uint256)
        assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(data.len(), 4 + 32 + 32);
    }

    #[test]
    fn test_topic_to_address() {
        let topic = "0x00000000000000000000000070997970c51812dc3a010c7d01b50e0d17dc79c8";
        assert_eq!(
            topic_to_address(topic).unwrap(),
            "0x70997970c51812dc3a010c7d01b50e0d17dc79c8"
        );
        assert!(topic_to_address("0x1234").is_err());
    }
}
