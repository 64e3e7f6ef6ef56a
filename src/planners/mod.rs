//! Sweep and withdrawal planners (C6), one poll loop per step.
//!
//! Every planner step opens its own database transaction and row-locks the
//! records it consumes, so a concurrent instance cannot double-spend even
//! if the process-local step locks are bypassed.

use eyre::Result;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info};

pub mod btc;
pub mod erc20;
pub mod eth;
pub mod omni;

pub use btc::BtcPlanner;
pub use erc20::Erc20Planner;
pub use eth::EthPlanner;
pub use omni::OmniPlanner;

use crate::config::{Config, IntervalConfig};
use crate::keyvault::KeyVault;
use crate::rpc::{BtcRpcClient, EthRpcClient};
use crate::watchers::spawn_loop;

/// Owns the sweep/withdrawal planning loops.
pub struct PlannerManager {
    intervals: IntervalConfig,
    btc: Option<(BtcPlanner, OmniPlanner)>,
    eth: Option<(EthPlanner, Erc20Planner)>,
}

impl PlannerManager {
    pub fn new(config: &Config, db: PgPool) -> Result<Self> {
        let vault = KeyVault::from_hex(&config.vault.aes_key)?;

        let btc = if config.btc.enable {
            let rpc = BtcRpcClient::new(
                &config.btc.rpc_url,
                &config.btc.rpc_user,
                &config.btc.rpc_pass,
            )?;
            let network = crate::chains::btc::parse_network(&config.btc.network)?;
            Some((
                BtcPlanner::new(db.clone(), vault.clone(), network),
                OmniPlanner::new(db.clone(), rpc, vault.clone(), network),
            ))
        } else {
            None
        };

        let eth = if config.eth.enable {
            let rpc = EthRpcClient::new(&config.eth.rpc_url)?;
            Some((
                EthPlanner::new(db.clone(), rpc.clone(), vault.clone()),
                Erc20Planner::new(db, rpc, vault),
            ))
        } else {
            None
        };

        Ok(Self {
            intervals: config.intervals.clone(),
            btc,
            eth,
        })
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();
        let intervals = self.intervals;

        if let Some((btc, omni)) = self.btc {
            let p = btc.clone();
            spawn_loop(&mut join_set, "BtcTxOrg", intervals.sweep_secs, move || {
                let p = p.clone();
                async move { p.check_tx_org().await }
            });
            let p = btc;
            spawn_loop(&mut join_set, "BtcWithdraw", intervals.withdraw_secs, move || {
                let p = p.clone();
                async move { p.check_withdraw().await }
            });
            let p = omni.clone();
            spawn_loop(&mut join_set, "OmniTxOrg", intervals.sweep_secs, move || {
                let p = p.clone();
                async move { p.check_tx_org().await }
            });
            let p = omni;
            spawn_loop(&mut join_set, "OmniWithdraw", intervals.withdraw_secs, move || {
                let p = p.clone();
                async move { p.check_withdraw().await }
            });
        }

        if let Some((eth, erc20)) = self.eth {
            let p = eth.clone();
            spawn_loop(&mut join_set, "EthAddressOrg", intervals.sweep_secs, move || {
                let p = p.clone();
                async move { p.check_address_org().await }
            });
            let p = eth;
            spawn_loop(&mut join_set, "EthWithdraw", intervals.withdraw_secs, move || {
                let p = p.clone();
                async move { p.check_withdraw().await }
            });
            let p = erc20.clone();
            spawn_loop(&mut join_set, "Erc20TxOrg", intervals.sweep_secs, move || {
                let p = p.clone();
                async move { p.check_tx_org().await }
            });
            let p = erc20;
            spawn_loop(&mut join_set, "Erc20Withdraw", intervals.withdraw_secs, move || {
                let p = p.clone();
                async move { p.check_withdraw().await }
            });
        }

        info!(loops = join_set.len(), "Planner manager started");

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping planners");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Err(e)) => {
                        error!(error = %e, "A planner task panicked");
                        Err(eyre::eyre!("planner task panicked: {e}"))
                    }
                    _ => {
                        error!("A planner loop exited unexpectedly");
                        Err(eyre::eyre!("planner loop exited unexpectedly"))
                    }
                }
            }
        }
    }
}
