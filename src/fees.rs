//! Fee oracle polling (C9).
//!
//! Reads the external fee endpoints, clamps against the stored ceiling and
//! persists the current to-user (fast) and to-cold (average) prices. When
//! an oracle is unreachable the previous values simply stay in place.

use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::Deserialize;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::db;
use crate::locks;

const ORACLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Bootstrap ceiling when `max_gas_price_btc` is absent, sat/vB.
const DEFAULT_MAX_GAS_PRICE_BTC: i64 = 168;
/// Bootstrap ceiling when `max_gas_price_eth` is absent, wei/gas (80 gwei).
const DEFAULT_MAX_GAS_PRICE_ETH: i64 = 80_000_000_000;

#[derive(Debug, Deserialize)]
struct BtcFeeResponse {
    #[serde(rename = "fastestFee")]
    fastest_fee: i64,
    #[serde(rename = "halfHourFee")]
    half_hour_fee: i64,
}

#[derive(Debug, Deserialize)]
struct EthFeeResponse {
    fast: i64,
    average: i64,
}

#[derive(Clone)]
pub struct FeeOracle {
    db: PgPool,
    http: Client,
    btc_url: String,
    eth_url: String,
}

impl FeeOracle {
    pub fn new(db: PgPool, btc_url: &str, eth_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(ORACLE_TIMEOUT)
            .build()
            .wrap_err("failed to build fee oracle http client")?;
        Ok(Self {
            db,
            http,
            btc_url: btc_url.to_string(),
            eth_url: eth_url.to_string(),
        })
    }

    async fn ceiling(&self, key: &str, default: i64) -> Result<i64> {
        match db::get_state_int(&self.db, key).await? {
            Some(v) if v > 0 => Ok(v),
            _ => {
                db::init_state_int(&self.db, key, default).await?;
                Ok(default)
            }
        }
    }

    /// Poll the BTC fee endpoint and persist clamped sat/vB prices.
    pub async fn check_btc_gas_price(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("BtcCheckGasPrice") else {
            return Ok(());
        };
        let max = self.ceiling("max_gas_price_btc", DEFAULT_MAX_GAS_PRICE_BTC).await?;

        let resp = self
            .http
            .get(&self.btc_url)
            .send()
            .await
            .wrap_err("btc fee oracle request failed")?;
        if !resp.status().is_success() {
            return Err(eyre!("btc fee oracle status {}", resp.status()));
        }
        let fees: BtcFeeResponse = resp.json().await.wrap_err("bad btc fee oracle body")?;

        let to_user = fees.fastest_fee.min(max);
        let to_cold = fees.half_hour_fee.min(max);
        db::set_state_int(&self.db, "to_user_gas_price_btc", to_user).await?;
        db::set_state_int(&self.db, "to_cold_gas_price_btc", to_cold).await?;
        info!(to_user, to_cold, "BTC gas price updated");
        Ok(())
    }

    /// Poll the ETH fee endpoint and persist clamped wei/gas prices. The
    /// endpoint reports tenths of gwei, hence the 1e8 multiplier.
    pub async fn check_eth_gas_price(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("EthCheckGasPrice") else {
            return Ok(());
        };
        let max = self.ceiling("max_gas_price_eth", DEFAULT_MAX_GAS_PRICE_ETH).await?;

        let resp = self
            .http
            .get(&self.eth_url)
            .send()
            .await
            .wrap_err("eth fee oracle request failed")?;
        if !resp.status().is_success() {
            return Err(eyre!("eth fee oracle status {}", resp.status()));
        }
        let fees: EthFeeResponse = resp.json().await.wrap_err("bad eth fee oracle body")?;

        let to_user = (fees.fast * 100_000_000).min(max);
        let to_cold = (fees.average * 100_000_000).min(max);
        db::set_state_int(&self.db, "to_user_gas_price_eth", to_user).await?;
        db::set_state_int(&self.db, "to_cold_gas_price_eth", to_cold).await?;
        info!(to_user, to_cold, "ETH gas price updated");
        Ok(())
    }
}
