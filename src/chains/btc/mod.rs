//! BTC keys, addresses and script resolution.
//!
//! Deposit and internal addresses are P2SH-wrapped segwit (P2SH-P2WPKH);
//! keys are kept as WIF strings, sealed by the key vault at rest.

pub mod txbuild;

use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network, PrivateKey, Script};
use eyre::{eyre, Result, WrapErr};
use std::str::FromStr;

/// Parse the configured network name.
pub fn parse_network(name: &str) -> Result<Network> {
    match name {
        "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(eyre!("unknown BTC network: {other}")),
    }
}

/// Generate a fresh keypair: (WIF, P2SH-wrapped-segwit address).
pub fn generate_keypair(network: Network) -> Result<(String, String)> {
    let secp = Secp256k1::new();
    let secret = SecretKey::new(&mut rand::thread_rng());
    let privkey = PrivateKey::new(secret, network);
    let address = address_for_key(&privkey, network)?;
    Ok((privkey.to_wif(), address))
}

/// Derive the P2SH-wrapped-segwit address of a WIF key.
pub fn address_for_wif(wif: &str, network: Network) -> Result<String> {
    let privkey = PrivateKey::from_wif(wif).wrap_err("bad WIF key")?;
    address_for_key(&privkey, network)
}

fn address_for_key(privkey: &PrivateKey, network: Network) -> Result<String> {
    let secp = Secp256k1::new();
    let compressed = CompressedPublicKey::from_private_key(&secp, privkey)
        .map_err(|_| eyre!("uncompressed key in wallet"))?;
    Ok(Address::p2shwpkh(&compressed, network).to_string())
}

/// Parse a WIF key and return it with its compressed public key.
pub fn keypair_from_wif(wif: &str) -> Result<(PrivateKey, CompressedPublicKey)> {
    let privkey = PrivateKey::from_wif(wif).wrap_err("bad WIF key")?;
    let secp = Secp256k1::new();
    let compressed = CompressedPublicKey::from_private_key(&secp, &privkey)
        .map_err(|_| eyre!("uncompressed key in wallet"))?;
    Ok((privkey, compressed))
}

/// Resolve a raw output script to its address, if it has one.
pub fn script_to_address(script: &Script, network: Network) -> Option<String> {
    Address::from_script(script, network).ok().map(|a| a.to_string())
}

/// Parse and network-check an address string into its output script.
pub fn address_script(address: &str, network: Network) -> Result<bitcoin::ScriptBuf> {
    let addr = Address::from_str(address)
        .wrap_err_with(|| format!("bad BTC address: {address}"))?
        .require_network(network)
        .wrap_err_with(|| format!("address {address} is for another network"))?;
    Ok(addr.script_pubkey())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keypair_shape() {
        let (wif, address) = generate_keypair(Network::Bitcoin).unwrap();
        // Mainnet P2SH addresses are base58 and start with '3'.
        assert!(address.starts_with('3'), "unexpected address: {address}");
        assert_eq!(address_for_wif(&wif, Network::Bitcoin).unwrap(), address);
    }

    #[test]
    fn test_address_script_roundtrip() {
        let (_, address) = generate_keypair(Network::Regtest).unwrap();
        let script = address_script(&address, Network::Regtest).unwrap();
        assert_eq!(
            script_to_address(&script, Network::Regtest).as_deref(),
            Some(address.as_str())
        );
    }

    #[test]
    fn test_wrong_network_rejected() {
        let (_, address) = generate_keypair(Network::Bitcoin).unwrap();
        assert!(address_script(&address, Network::Regtest).is_err());
    }

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_network("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("regtest").unwrap(), Network::Regtest);
        assert!(parse_network("lightning").is_err());
    }
}
