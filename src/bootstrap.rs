//! One-shot initialization (`custody-operator init`).
//!
//! Seeds the scalar configuration keys, provisions internal hot/fee
//! addresses and pins the seek cursors at the current tips so a fresh
//! deployment does not scan history. Existing keys are never overwritten,
//! so re-running is safe. Cold addresses are deliberately left empty for
//! the operator to fill in.

use eyre::Result;
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::keyvault::KeyVault;
use crate::pool::create_internal_addresses;
use crate::rpc::{BtcRpcClient, EthRpcClient};
use crate::types::{BTC_SYMBOL, ETH_SYMBOL};

/// How many internal addresses to provision per chain.
const INTERNAL_ADDRESSES: i64 = 10;

pub async fn run(config: &Config, db: &PgPool) -> Result<()> {
    let vault = KeyVault::from_hex(&config.vault.aes_key)?;

    db::init_state_int(db, "min_free_address", 1000).await?;
    db::init_state_int(db, "block_confirm_num", 15).await?;
    db::init_state_int(db, "btc_block_confirm_num", 2).await?;
    db::init_state_int(db, "erc20_gas_use", 90_000).await?;

    if config.btc.enable {
        let network = crate::chains::btc::parse_network(&config.btc.network)?;
        let rpc = BtcRpcClient::new(
            &config.btc.rpc_url,
            &config.btc.rpc_user,
            &config.btc.rpc_pass,
        )?;

        let mut internal: Vec<String> = db::internal_addresses(db, BTC_SYMBOL)
            .await?
            .into_iter()
            .map(|r| r.address)
            .collect();
        if internal.len() < 3 {
            internal =
                create_internal_addresses(db, &vault, network, BTC_SYMBOL, INTERNAL_ADDRESSES)
                    .await?;
        }

        db::init_state_str(db, "hot_wallet_address_btc", &internal[0]).await?;
        db::init_state_str(db, "cold_wallet_address_btc", "").await?;

        let tip = rpc.get_block_count().await?;
        db::init_state_int(db, "btc_seek_num", tip).await?;
        db::init_state_int(db, "omni_seek_num", tip).await?;
        db::init_state_int(db, "btc_hot_fee_seek_num", tip).await?;
        info!(tip, hot = internal[0].as_str(), "BTC state initialized");
    }

    if config.eth.enable {
        let rpc = EthRpcClient::new(&config.eth.rpc_url)?;

        let mut internal: Vec<String> = db::internal_addresses(db, ETH_SYMBOL)
            .await?
            .into_iter()
            .map(|r| r.address)
            .collect();
        if internal.len() < 3 {
            // network param is unused for ETH keys
            internal = create_internal_addresses(
                db,
                &vault,
                bitcoin::Network::Bitcoin,
                ETH_SYMBOL,
                INTERNAL_ADDRESSES,
            )
            .await?;
        }

        db::init_state_str(db, "hot_wallet_address_eth", &internal[0]).await?;
        db::init_state_str(db, "cold_wallet_address_eth", "").await?;
        db::init_state_str(db, "fee_wallet_address_erc20", &internal[1]).await?;

        // keep the comma-joined skip list in sync with the fee wallet
        let fee_wallet = db::require_state_str(db, "fee_wallet_address_erc20").await?;
        let list = db::get_state_str(db, "fee_wallet_address_list_erc20")
            .await?
            .unwrap_or_default();
        if !list.split(',').any(|a| a == fee_wallet) {
            let merged = if list.is_empty() {
                fee_wallet
            } else {
                format!("{list},{fee_wallet}")
            };
            db::set_state_str(db, "fee_wallet_address_list_erc20", &merged).await?;
        }

        let tip = rpc.block_number().await?;
        db::init_state_int(db, "eth_seek_num", tip).await?;
        db::init_state_int(db, "erc20_seek_num", tip).await?;
        info!(tip, hot = internal[0].as_str(), "ETH state initialized");
    }

    info!("Initialization complete");
    Ok(())
}
