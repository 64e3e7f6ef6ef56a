//! Block seekers, address pool and fee oracles, one poll loop each.

use bitcoin::Network;
use eyre::Result;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

pub mod btc;
pub mod btc_hot_fee;
pub mod erc20;
pub mod eth;
pub mod omni;

pub use btc::BtcDepositSeeker;
pub use btc_hot_fee::BtcHotFeeSeeker;
pub use erc20::Erc20DepositSeeker;
pub use eth::EthDepositSeeker;
pub use omni::OmniDepositSeeker;

use crate::config::{Config, IntervalConfig};
use crate::fees::FeeOracle;
use crate::keyvault::KeyVault;
use crate::pool;
use crate::rpc::{BtcRpcClient, EthRpcClient};

struct BtcWatcherSet {
    deposit: BtcDepositSeeker,
    hot_fee: BtcHotFeeSeeker,
    omni: OmniDepositSeeker,
    network: Network,
}

struct EthWatcherSet {
    deposit: EthDepositSeeker,
    erc20: Erc20DepositSeeker,
}

/// Owns every ingest-side poll loop: the five block seekers, the address
/// pools and the fee oracles.
pub struct WatcherManager {
    db: PgPool,
    vault: KeyVault,
    intervals: IntervalConfig,
    oracle: FeeOracle,
    btc: Option<BtcWatcherSet>,
    eth: Option<EthWatcherSet>,
}

impl WatcherManager {
    pub fn new(config: &Config, db: PgPool) -> Result<Self> {
        let vault = KeyVault::from_hex(&config.vault.aes_key)?;
        let oracle = FeeOracle::new(
            db.clone(),
            &config.btc.fee_oracle_url,
            &config.eth.fee_oracle_url,
        )?;

        let btc = if config.btc.enable {
            let rpc = BtcRpcClient::new(
                &config.btc.rpc_url,
                &config.btc.rpc_user,
                &config.btc.rpc_pass,
            )?;
            let network = crate::chains::btc::parse_network(&config.btc.network)?;
            Some(BtcWatcherSet {
                deposit: BtcDepositSeeker::new(db.clone(), rpc.clone()),
                hot_fee: BtcHotFeeSeeker::new(db.clone(), rpc.clone()),
                omni: OmniDepositSeeker::new(db.clone(), rpc),
                network,
            })
        } else {
            None
        };

        let eth = if config.eth.enable {
            let rpc = EthRpcClient::new(&config.eth.rpc_url)?;
            Some(EthWatcherSet {
                deposit: EthDepositSeeker::new(db.clone(), rpc.clone()),
                erc20: Erc20DepositSeeker::new(db.clone(), rpc),
            })
        } else {
            None
        };

        Ok(Self {
            db,
            vault,
            intervals: config.intervals.clone(),
            oracle,
            btc,
            eth,
        })
    }

    /// Run all watcher loops until shutdown. Any loop exiting is a bug.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();
        let intervals = self.intervals;

        if let Some(set) = self.btc {
            let BtcWatcherSet { deposit, hot_fee, omni, network } = set;

            spawn_loop(&mut join_set, "BtcBlockSeek", intervals.btc_seek_secs, move || {
                let s = deposit.clone();
                async move { s.step().await }
            });
            spawn_loop(
                &mut join_set,
                "BtcHotFeeSeek",
                intervals.btc_hot_fee_seek_secs,
                move || {
                    let s = hot_fee.clone();
                    async move { s.step().await }
                },
            );
            spawn_loop(&mut join_set, "OmniBlockSeek", intervals.omni_seek_secs, move || {
                let s = omni.clone();
                async move { s.step().await }
            });

            let db = self.db.clone();
            let vault = self.vault.clone();
            spawn_loop(
                &mut join_set,
                "BtcAddressPool",
                intervals.address_pool_secs,
                move || {
                    let db = db.clone();
                    let vault = vault.clone();
                    async move { pool::check_btc_address_free(&db, &vault, network).await }
                },
            );

            let oracle = self.oracle.clone();
            spawn_loop(&mut join_set, "BtcGasPrice", intervals.fee_btc_secs, move || {
                let o = oracle.clone();
                async move { o.check_btc_gas_price().await }
            });
        }

        if let Some(set) = self.eth {
            let EthWatcherSet { deposit, erc20 } = set;

            spawn_loop(&mut join_set, "EthBlockSeek", intervals.eth_seek_secs, move || {
                let s = deposit.clone();
                async move { s.step().await }
            });
            spawn_loop(&mut join_set, "Erc20BlockSeek", intervals.erc20_seek_secs, move || {
                let s = erc20.clone();
                async move { s.step().await }
            });

            let db = self.db.clone();
            let vault = self.vault.clone();
            spawn_loop(
                &mut join_set,
                "EthAddressPool",
                intervals.address_pool_secs,
                move || {
                    let db = db.clone();
                    let vault = vault.clone();
                    async move { pool::check_eth_address_free(&db, &vault).await }
                },
            );

            let oracle = self.oracle.clone();
            spawn_loop(&mut join_set, "EthGasPrice", intervals.fee_eth_secs, move || {
                let o = oracle.clone();
                async move { o.check_eth_gas_price().await }
            });
        }

        info!(loops = join_set.len(), "Watcher manager started");

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping watchers");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Err(e)) => {
                        error!(error = %e, "A watcher task panicked");
                        Err(eyre::eyre!("watcher task panicked: {e}"))
                    }
                    _ => {
                        error!("A watcher loop exited unexpectedly");
                        Err(eyre::eyre!("watcher loop exited unexpectedly"))
                    }
                }
            }
        }
    }
}

/// Spawn an endless step loop: run, log failures, sleep, repeat. Shared by
/// all three managers.
pub(crate) fn spawn_loop<F, Fut>(
    join_set: &mut tokio::task::JoinSet<()>,
    name: &'static str,
    secs: u64,
    step: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    join_set.spawn(async move {
        loop {
            if let Err(e) = step().await {
                crate::metrics::record_error(name);
                error!(step = name, error = %e, "step failed");
            }
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
    });
}
