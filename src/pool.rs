//! Address pool maintenance (C4).
//!
//! Keeps `count(use_tag = 0)` at or above `min_free_address` per asset and
//! provisions internal hot/fee addresses at initialization.

use bitcoin::Network;
use eyre::Result;
use sqlx::PgPool;
use tracing::info;

use crate::chains;
use crate::db;
use crate::keyvault::KeyVault;
use crate::locks;
use crate::types::{BTC_SYMBOL, ETH_SYMBOL, USE_TAG_FREE, USE_TAG_INTERNAL};

/// Generate one keypair for `symbol` and seal the secret.
fn generate_sealed(symbol: &str, network: Network, vault: &KeyVault) -> Result<(String, String)> {
    let (secret, address) = if symbol == BTC_SYMBOL {
        chains::btc::generate_keypair(network)?
    } else {
        chains::eth::generate_keypair()
    };
    Ok((address, vault.encrypt(&secret)?))
}

/// Top up the free-address pool for one symbol.
async fn top_up(db: &PgPool, vault: &KeyVault, network: Network, symbol: &str) -> Result<()> {
    let min_free = db::require_state_int(db, "min_free_address").await?;
    let free = db::count_free_addresses(db, symbol).await?;
    if free >= min_free {
        return Ok(());
    }
    let shortfall = min_free - free;
    for _ in 0..shortfall {
        let (address, sealed) = generate_sealed(symbol, network, vault)?;
        db::insert_address(db, symbol, &address, &sealed, USE_TAG_FREE).await?;
    }
    info!(symbol, shortfall, "Topped up free address pool");
    Ok(())
}

/// Provision `num` internal (hot/fee) addresses in one batch. Used by
/// first-run initialization; returns the new addresses in order.
pub async fn create_internal_addresses(
    db: &PgPool,
    vault: &KeyVault,
    network: Network,
    symbol: &str,
    num: i64,
) -> Result<Vec<String>> {
    let mut addresses = Vec::with_capacity(num as usize);
    for _ in 0..num {
        let (address, sealed) = generate_sealed(symbol, network, vault)?;
        db::insert_address(db, symbol, &address, &sealed, USE_TAG_INTERNAL).await?;
        addresses.push(address);
    }
    Ok(addresses)
}

/// Periodic step: keep the BTC deposit-address pool stocked.
pub async fn check_btc_address_free(db: &PgPool, vault: &KeyVault, network: Network) -> Result<()> {
    let Some(_guard) = locks::try_acquire("BtcCheckAddressFree") else {
        return Ok(());
    };
    top_up(db, vault, network, BTC_SYMBOL).await
}

/// Periodic step: keep the ETH deposit-address pool stocked.
pub async fn check_eth_address_free(db: &PgPool, vault: &KeyVault) -> Result<()> {
    let Some(_guard) = locks::try_acquire("EthCheckAddressFree") else {
        return Ok(());
    };
    // network param unused for ETH keygen
    top_up(db, vault, Network::Bitcoin, ETH_SYMBOL).await
}
