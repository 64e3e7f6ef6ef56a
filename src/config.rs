use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;

/// Main configuration for the operator.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub btc: BtcConfig,
    pub eth: EthConfig,
    pub vault: VaultConfig,
    pub intervals: IntervalConfig,
    pub api_port: u16,
}

/// Database configuration.
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// BTC / OMNI node configuration.
#[derive(Clone)]
pub struct BtcConfig {
    pub enable: bool,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_pass: String,
    /// mainnet | testnet | signet | regtest
    pub network: String,
    pub fee_oracle_url: String,
}

impl fmt::Debug for BtcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtcConfig")
            .field("enable", &self.enable)
            .field("rpc_url", &self.rpc_url)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_pass", &"<redacted>")
            .field("network", &self.network)
            .field("fee_oracle_url", &self.fee_oracle_url)
            .finish()
    }
}

/// ETH node configuration.
#[derive(Debug, Clone)]
pub struct EthConfig {
    pub enable: bool,
    pub rpc_url: String,
    pub fee_oracle_url: String,
}

/// Key vault configuration.
#[derive(Clone)]
pub struct VaultConfig {
    /// 32-byte AES key, hex encoded.
    pub aes_key: String,
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("aes_key", &"<redacted>")
            .finish()
    }
}

/// Step cadences, in seconds.
#[derive(Debug, Clone)]
pub struct IntervalConfig {
    pub address_pool_secs: u64,
    pub btc_seek_secs: u64,
    pub btc_hot_fee_seek_secs: u64,
    pub omni_seek_secs: u64,
    pub eth_seek_secs: u64,
    pub erc20_seek_secs: u64,
    pub sweep_secs: u64,
    pub withdraw_secs: u64,
    pub broadcast_secs: u64,
    pub confirm_btc_secs: u64,
    pub confirm_eth_secs: u64,
    pub notify_secs: u64,
    pub fee_btc_secs: u64,
    pub fee_eth_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            address_pool_secs: 60,
            btc_seek_secs: 300,
            btc_hot_fee_seek_secs: 300,
            omni_seek_secs: 300,
            eth_seek_secs: 5,
            erc20_seek_secs: 5,
            sweep_secs: 600,
            withdraw_secs: 180,
            broadcast_secs: 60,
            confirm_btc_secs: 300,
            confirm_eth_secs: 5,
            notify_secs: 5,
            fee_btc_secs: 300,
            fee_eth_secs: 120,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration: `.env` file if present, then the environment.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path.
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let btc = BtcConfig {
            enable: env_flag("BTC_ENABLE"),
            rpc_url: env::var("BTC_RPC_URL").unwrap_or_default(),
            rpc_user: env::var("BTC_RPC_USER").unwrap_or_default(),
            rpc_pass: env::var("BTC_RPC_PASS").unwrap_or_default(),
            network: env::var("BTC_NETWORK").unwrap_or_else(|_| "mainnet".to_string()),
            fee_oracle_url: env::var("BTC_FEE_ORACLE_URL").unwrap_or_else(|_| {
                "https://bitcoinfees.earn.com/api/v1/fees/recommended".to_string()
            }),
        };

        let eth = EthConfig {
            enable: env_flag("ETH_ENABLE"),
            rpc_url: env::var("ETH_RPC_URL").unwrap_or_default(),
            fee_oracle_url: env::var("ETH_FEE_ORACLE_URL")
                .unwrap_or_else(|_| "https://ethgasstation.info/api/ethgasAPI.json".to_string()),
        };

        let vault = VaultConfig {
            aes_key: env::var("AES_KEY")
                .map_err(|_| eyre!("AES_KEY environment variable is required"))?,
        };

        let defaults = IntervalConfig::default();
        let intervals = IntervalConfig {
            address_pool_secs: env_u64("ADDRESS_POOL_SECS", defaults.address_pool_secs),
            btc_seek_secs: env_u64("BTC_SEEK_SECS", defaults.btc_seek_secs),
            btc_hot_fee_seek_secs: env_u64(
                "BTC_HOT_FEE_SEEK_SECS",
                defaults.btc_hot_fee_seek_secs,
            ),
            omni_seek_secs: env_u64("OMNI_SEEK_SECS", defaults.omni_seek_secs),
            eth_seek_secs: env_u64("ETH_SEEK_SECS", defaults.eth_seek_secs),
            erc20_seek_secs: env_u64("ERC20_SEEK_SECS", defaults.erc20_seek_secs),
            sweep_secs: env_u64("SWEEP_SECS", defaults.sweep_secs),
            withdraw_secs: env_u64("WITHDRAW_SECS", defaults.withdraw_secs),
            broadcast_secs: env_u64("BROADCAST_SECS", defaults.broadcast_secs),
            confirm_btc_secs: env_u64("CONFIRM_BTC_SECS", defaults.confirm_btc_secs),
            confirm_eth_secs: env_u64("CONFIRM_ETH_SECS", defaults.confirm_eth_secs),
            notify_secs: env_u64("NOTIFY_SECS", defaults.notify_secs),
            fee_btc_secs: env_u64("FEE_BTC_SECS", defaults.fee_btc_secs),
            fee_eth_secs: env_u64("FEE_ETH_SECS", defaults.fee_eth_secs),
        };

        let api_port = env::var("API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9090);

        let config = Config {
            database,
            btc,
            eth,
            vault,
            intervals,
            api_port,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        let key = self.vault.aes_key.trim();
        if key.len() != 64 || hex::decode(key).is_err() {
            return Err(eyre!("AES_KEY must be 64 hex chars (32 bytes)"));
        }

        if self.btc.enable {
            if self.btc.rpc_url.is_empty() {
                return Err(eyre!("BTC_RPC_URL is required when BTC_ENABLE is set"));
            }
            crate::chains::btc::parse_network(&self.btc.network)?;
        }

        if self.eth.enable {
            if self.eth.rpc_url.is_empty() {
                return Err(eyre!("ETH_RPC_URL is required when ETH_ENABLE is set"));
            }
        }

        if !self.btc.enable && !self.eth.enable {
            return Err(eyre!("at least one of BTC_ENABLE / ETH_ENABLE must be set"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/custody".to_string(),
            },
            btc: BtcConfig {
                enable: true,
                rpc_url: "http://localhost:8332".to_string(),
                rpc_user: "rpc".to_string(),
                rpc_pass: "rpc".to_string(),
                network: "regtest".to_string(),
                fee_oracle_url: "http://localhost/fees".to_string(),
            },
            eth: EthConfig {
                enable: true,
                rpc_url: "http://localhost:8545".to_string(),
                fee_oracle_url: "http://localhost/gas".to_string(),
            },
            vault: VaultConfig {
                aes_key: "ab".repeat(32),
            },
            intervals: IntervalConfig::default(),
            api_port: 9090,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_bad_aes_key_rejected() {
        let mut config = base_config();
        config.vault.aes_key = "abcd".to_string();
        assert!(config.validate().is_err());
        config.vault.aes_key = "zz".repeat(32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_chain_requires_rpc_url() {
        let mut config = base_config();
        config.btc.rpc_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_network_rejected() {
        let mut config = base_config();
        config.btc.network = "lightning".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_all_chains_disabled_rejected() {
        let mut config = base_config();
        config.btc.enable = false;
        config.eth.enable = false;
        assert!(config.validate().is_err());
    }
}
