//! Broadcast/confirm loops (C7) plus the deposit notification producers.

use eyre::Result;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, info};

pub mod btc;
pub mod eth;

pub use btc::BtcConfirmer;
pub use eth::EthConfirmer;

use crate::config::{Config, IntervalConfig};
use crate::notify;
use crate::rpc::{BtcRpcClient, EthRpcClient};
use crate::watchers::spawn_loop;

/// Owns the broadcast, confirmation and notification-producer loops.
pub struct ConfirmationTracker {
    db: PgPool,
    intervals: IntervalConfig,
    btc: Option<BtcConfirmer>,
    eth: Option<EthConfirmer>,
}

impl ConfirmationTracker {
    pub fn new(config: &Config, db: PgPool) -> Result<Self> {
        let btc = if config.btc.enable {
            let rpc = BtcRpcClient::new(
                &config.btc.rpc_url,
                &config.btc.rpc_user,
                &config.btc.rpc_pass,
            )?;
            let network = crate::chains::btc::parse_network(&config.btc.network)?;
            Some(BtcConfirmer::new(db.clone(), rpc, network))
        } else {
            None
        };
        let eth = if config.eth.enable {
            let rpc = EthRpcClient::new(&config.eth.rpc_url)?;
            Some(EthConfirmer::new(db.clone(), rpc))
        } else {
            None
        };
        Ok(Self {
            db,
            intervals: config.intervals.clone(),
            btc,
            eth,
        })
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let mut join_set = tokio::task::JoinSet::new();
        let intervals = self.intervals;

        let btc_enabled = self.btc.is_some();
        let eth_enabled = self.eth.is_some();

        if let Some(confirmer) = self.btc {
            let c = confirmer.clone();
            spawn_loop(&mut join_set, "BtcRawTxSend", intervals.broadcast_secs, move || {
                let c = c.clone();
                async move { c.check_raw_tx_send().await }
            });
            spawn_loop(
                &mut join_set,
                "BtcRawTxConfirm",
                intervals.confirm_btc_secs,
                move || {
                    let c = confirmer.clone();
                    async move { c.check_raw_tx_confirm().await }
                },
            );
        }

        if let Some(confirmer) = self.eth {
            let c = confirmer.clone();
            spawn_loop(&mut join_set, "EthRawTxSend", intervals.broadcast_secs, move || {
                let c = c.clone();
                async move { c.check_raw_tx_send().await }
            });
            spawn_loop(
                &mut join_set,
                "EthRawTxConfirm",
                intervals.confirm_eth_secs,
                move || {
                    let c = confirmer.clone();
                    async move { c.check_raw_tx_confirm().await }
                },
            );
        }

        let db = self.db.clone();
        spawn_loop(&mut join_set, "TxNotify", intervals.notify_secs, move || {
            let db = db.clone();
            async move {
                if btc_enabled {
                    notify::check_btc_tx_notify(&db).await?;
                    notify::check_omni_tx_notify(&db).await?;
                }
                if eth_enabled {
                    notify::check_eth_tx_notify(&db).await?;
                    notify::check_erc20_tx_notify(&db).await?;
                }
                Ok(())
            }
        });

        info!(loops = join_set.len(), "Confirmation tracker started");

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received, stopping confirmation tracker");
                join_set.abort_all();
                Ok(())
            }
            maybe_done = join_set.join_next() => {
                match maybe_done {
                    Some(Err(e)) => {
                        error!(error = %e, "A confirmation task panicked");
                        Err(eyre::eyre!("confirmation task panicked: {e}"))
                    }
                    _ => {
                        error!("A confirmation loop exited unexpectedly");
                        Err(eyre::eyre!("confirmation loop exited unexpectedly"))
                    }
                }
            }
        }
    }
}
