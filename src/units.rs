//! Conversions between human decimal amount strings (as stored in NUMERIC
//! columns and tenant callbacks) and chain base units.

use alloy::primitives::U256;
use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, ToPrimitive};
use eyre::{eyre, Result, WrapErr};
use std::str::FromStr;

const BTC_DECIMALS: i64 = 8;
const ETH_DECIMALS: i64 = 18;

fn scale_up(amount: &str, decimals: i64) -> Result<BigInt> {
    let dec = BigDecimal::from_str(amount.trim())
        .wrap_err_with(|| format!("bad decimal amount: {amount}"))?;
    let scaled = dec * BigDecimal::new(BigInt::from(1), -decimals);
    let (_, scale) = scaled.normalized().into_bigint_and_exponent();
    if scale > 0 {
        return Err(eyre!("amount {amount} has more than {decimals} decimal places"));
    }
    let (digits, _) = scaled.with_scale(0).into_bigint_and_exponent();
    Ok(digits)
}

fn scale_down(base_units: &str, decimals: i64) -> Result<String> {
    let digits =
        BigInt::from_str(base_units).wrap_err_with(|| format!("bad base units: {base_units}"))?;
    Ok(BigDecimal::new(digits, decimals).normalized().to_string())
}

/// "0.5" BTC → 50_000_000 sats.
pub fn btc_to_sats(amount: &str) -> Result<i64> {
    scale_up(amount, BTC_DECIMALS)?
        .to_i64()
        .ok_or_else(|| eyre!("BTC amount {amount} out of range"))
}

/// 50_000_000 sats → "0.5".
pub fn sats_to_btc(sats: i64) -> String {
    BigDecimal::new(BigInt::from(sats), BTC_DECIMALS)
        .normalized()
        .to_string()
}

/// Lossless string form of a node-reported BTC float amount (rounds to
/// whole satoshis before formatting).
pub fn btc_float_to_str(value: f64) -> String {
    sats_to_btc((value * 1e8).round() as i64)
}

/// "0.000021" ETH → wei.
pub fn eth_to_wei(amount: &str) -> Result<U256> {
    let units = scale_up(amount, ETH_DECIMALS)?;
    if units.sign() == bigdecimal::num_bigint::Sign::Minus {
        return Err(eyre!("negative ETH amount: {amount}"));
    }
    U256::from_str(&units.to_string()).map_err(|e| eyre!("wei overflow: {e}"))
}

/// Wei → decimal ETH string.
pub fn wei_to_eth(wei: U256) -> String {
    scale_down(&wei.to_string(), ETH_DECIMALS).expect("u256 decimal string always parses")
}

/// Token amount string → base units for the given `decimals`.
pub fn token_to_units(amount: &str, decimals: i64) -> Result<U256> {
    let units = scale_up(amount, decimals)?;
    if units.sign() == bigdecimal::num_bigint::Sign::Minus {
        return Err(eyre!("negative token amount: {amount}"));
    }
    U256::from_str(&units.to_string()).map_err(|e| eyre!("token unit overflow: {e}"))
}

/// Token base units → decimal string for the given `decimals`.
pub fn units_to_token(units: U256, decimals: i64) -> String {
    scale_down(&units.to_string(), decimals).expect("u256 decimal string always parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btc_roundtrip() {
        assert_eq!(btc_to_sats("0.5").unwrap(), 50_000_000);
        assert_eq!(btc_to_sats("0.00000546").unwrap(), 546);
        assert_eq!(sats_to_btc(50_000_000), "0.5");
        assert_eq!(sats_to_btc(546), "0.00000546");
        assert_eq!(sats_to_btc(100_000_000), "1");
    }

    #[test]
    fn test_btc_rejects_subsat_precision() {
        assert!(btc_to_sats("0.000000001").is_err());
    }

    #[test]
    fn test_eth_roundtrip() {
        let wei = eth_to_wei("1.5").unwrap();
        assert_eq!(wei, U256::from(1_500_000_000_000_000_000u128));
        assert_eq!(wei_to_eth(wei), "1.5");
        assert_eq!(
            eth_to_wei("0.000021").unwrap(),
            U256::from(21_000_000_000_000u64)
        );
    }

    #[test]
    fn test_token_units() {
        // 6-decimal token (USDT-style)
        assert_eq!(token_to_units("100", 6).unwrap(), U256::from(100_000_000u64));
        assert_eq!(units_to_token(U256::from(100_000_000u64), 6), "100");
        assert_eq!(units_to_token(U256::from(1u64), 6), "0.000001");
    }

    #[test]
    fn test_negative_rejected() {
        assert!(eth_to_wei("-1").is_err());
        assert!(token_to_units("-5", 6).is_err());
    }
}
