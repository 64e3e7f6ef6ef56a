//! ETH broadcast and confirmation loops.

use eyre::Result;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

use crate::db;
use crate::db::models::EthSend;
use crate::locks;
use crate::notify;
use crate::rpc::EthRpcClient;
use crate::types::{NotifyType, OrgStatus, RelatedType, SendStatus, WithdrawStatus};

fn is_duplicate_broadcast(message: &str) -> bool {
    message.contains("known transaction")
        || message.contains("already known")
        || message.contains("transaction already imported")
}

/// Per-kind related-id collections transitioned together after a pass.
#[derive(Default)]
struct RelatedIds {
    send_ids: Vec<i64>,
    withdraw_ids: Vec<i64>,
    eth_org_ids: Vec<i64>,
    erc20_org_ids: Vec<i64>,
    erc20_fee_ids: Vec<i64>,
}

impl RelatedIds {
    fn push(&mut self, row: &EthSend) -> bool {
        self.send_ids.push(row.id);
        let (list, id) = match RelatedType::parse(&row.related_type) {
            Some(RelatedType::Tx) => (&mut self.eth_org_ids, row.related_id),
            Some(RelatedType::Withdraw) => (&mut self.withdraw_ids, row.related_id),
            Some(RelatedType::TxErc20) => (&mut self.erc20_org_ids, row.related_id),
            Some(RelatedType::TxErc20Fee) => (&mut self.erc20_fee_ids, row.related_id),
            _ => return false,
        };
        if list.contains(&id) {
            return false;
        }
        list.push(id);
        matches!(
            RelatedType::parse(&row.related_type),
            Some(RelatedType::Withdraw)
        )
    }
}

#[derive(Clone)]
pub struct EthConfirmer {
    db: PgPool,
    rpc: EthRpcClient,
}

impl EthConfirmer {
    pub fn new(db: PgPool, rpc: EthRpcClient) -> Self {
        Self { db, rpc }
    }

    /// Broadcast queued transactions and transition their records.
    pub async fn check_raw_tx_send(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("EthCheckRawTxSend") else {
            return Ok(());
        };
        let send_rows = db::eth_sends_by_status(&self.db, SendStatus::Init.as_str()).await?;
        if send_rows.is_empty() {
            return Ok(());
        }
        let (withdraws, products) = self.withdraw_context(&send_rows).await?;

        let mut sent_txids: HashSet<String> = HashSet::new();
        for row in send_rows.iter().filter(|r| !r.hex.is_empty()) {
            match self.rpc.send_raw_transaction(&row.hex).await {
                Ok(_) => {}
                Err(e) if is_duplicate_broadcast(&e.to_string()) => {
                    info!(tx = row.tx_id.as_str(), "transaction already known to the network");
                }
                Err(e) => {
                    crate::metrics::record_broadcast("eth", false);
                    error!(tx = row.tx_id.as_str(), error = %e, "broadcast failed");
                    continue;
                }
            }
            crate::metrics::record_broadcast("eth", true);
            sent_txids.insert(row.tx_id.clone());
        }

        let mut related = RelatedIds::default();
        for row in &send_rows {
            if !sent_txids.contains(&row.tx_id) {
                continue;
            }
            if related.push(row) {
                self.queue_withdraw_notification(
                    &withdraws,
                    &products,
                    row.related_id,
                    NotifyType::WithdrawSend,
                )
                .await?;
            }
        }

        db::update_withdraws_status(&self.db, &related.withdraw_ids, WithdrawStatus::Send.as_str()).await?;
        db::update_eth_deposits_org_status(&self.db, &related.eth_org_ids, OrgStatus::Send.as_str()).await?;
        db::update_erc20_deposits_org_status(&self.db, &related.erc20_org_ids, OrgStatus::Send.as_str()).await?;
        db::update_erc20_deposits_org_status(&self.db, &related.erc20_fee_ids, OrgStatus::FeeSend.as_str())
            .await?;
        db::update_eth_sends_status(&self.db, &related.send_ids, SendStatus::Send.as_str()).await?;
        Ok(())
    }

    /// Promote mined transactions and their dependents.
    pub async fn check_raw_tx_confirm(&self) -> Result<()> {
        let Some(_guard) = locks::try_acquire("EthCheckRawTxConfirm") else {
            return Ok(());
        };
        let send_rows = db::eth_sends_by_status(&self.db, SendStatus::Send.as_str()).await?;
        if send_rows.is_empty() {
            return Ok(());
        }
        let (withdraws, products) = self.withdraw_context(&send_rows).await?;

        let mut checked: HashMap<String, bool> = HashMap::new();
        let mut related = RelatedIds::default();
        for row in &send_rows {
            let mined = match checked.get(&row.tx_id) {
                Some(&m) => m,
                None => {
                    let m = match self.rpc.transaction_by_hash(&row.tx_id).await {
                        Ok(tx) => tx.is_some(),
                        Err(e) => {
                            warn!(tx = row.tx_id.as_str(), error = %e, "confirm lookup failed");
                            false
                        }
                    };
                    checked.insert(row.tx_id.clone(), m);
                    m
                }
            };
            if !mined {
                continue;
            }
            if related.push(row) {
                self.queue_withdraw_notification(
                    &withdraws,
                    &products,
                    row.related_id,
                    NotifyType::WithdrawConfirm,
                )
                .await?;
            }
        }

        db::update_withdraws_status(&self.db, &related.withdraw_ids, WithdrawStatus::Confirm.as_str()).await?;
        db::update_eth_deposits_org_status(&self.db, &related.eth_org_ids, OrgStatus::Confirm.as_str()).await?;
        db::update_erc20_deposits_org_status(&self.db, &related.erc20_org_ids, OrgStatus::Confirm.as_str())
            .await?;
        db::update_erc20_deposits_org_status(&self.db, &related.erc20_fee_ids, OrgStatus::FeeConfirm.as_str())
            .await?;
        db::update_eth_sends_status(&self.db, &related.send_ids, SendStatus::Confirm.as_str()).await?;
        Ok(())
    }

    async fn withdraw_context(
        &self,
        send_rows: &[EthSend],
    ) -> Result<(
        HashMap<i64, db::models::Withdraw>,
        HashMap<i64, db::models::Product>,
    )> {
        let mut withdraw_ids: Vec<i64> = send_rows
            .iter()
            .filter(|r| r.related_type == RelatedType::Withdraw.as_str())
            .map(|r| r.related_id)
            .collect();
        withdraw_ids.sort();
        withdraw_ids.dedup();
        let withdraws = db::withdraw_map(&self.db, &withdraw_ids).await?;
        let mut product_ids: Vec<i64> = withdraws.values().map(|w| w.product_id).collect();
        product_ids.sort();
        product_ids.dedup();
        let products = db::product_map(&self.db, &product_ids).await?;
        Ok((withdraws, products))
    }

    async fn queue_withdraw_notification(
        &self,
        withdraws: &HashMap<i64, db::models::Withdraw>,
        products: &HashMap<i64, db::models::Product>,
        withdraw_id: i64,
        notify_type: NotifyType,
    ) -> Result<()> {
        let Some(withdraw) = withdraws.get(&withdraw_id) else {
            error!(withdraw = withdraw_id, "no withdraw row for send");
            return Ok(());
        };
        let Some(product) = products.get(&withdraw.product_id) else {
            error!(product = withdraw.product_id, "no product row for withdraw");
            return Ok(());
        };
        let row = notify::withdraw_notification(withdraw, product, notify_type);
        db::insert_notification(&self.db, &row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(id: i64, related_type: &str, related_id: i64) -> EthSend {
        EthSend {
            id,
            related_type: related_type.to_string(),
            related_id,
            token_id: 0,
            tx_id: "0xabc".to_string(),
            from_address: "0xfrom".to_string(),
            to_address: "0xto".to_string(),
            balance: "0".to_string(),
            gas: 0,
            gas_price: 0,
            nonce: -1,
            hex: String::new(),
            handle_status: "init".to_string(),
        }
    }

    #[test]
    fn test_related_ids_grouping() {
        let mut related = RelatedIds::default();
        // leader + placeholder for the same ETH sweep deposit group
        assert!(!related.push(&send(1, "tx", 10)));
        assert!(!related.push(&send(2, "tx", 11)));
        assert!(!related.push(&send(3, "tx_erc20_fee", 20)));
        assert!(related.push(&send(4, "withdraw", 30)));
        // duplicate withdraw rows only notify once
        assert!(!related.push(&send(5, "withdraw", 30)));

        assert_eq!(related.send_ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(related.eth_org_ids, vec![10, 11]);
        assert_eq!(related.erc20_fee_ids, vec![20]);
        assert_eq!(related.withdraw_ids, vec![30]);
    }

    #[test]
    fn test_duplicate_broadcast_detection() {
        assert!(is_duplicate_broadcast("known transaction: 0xdead"));
        assert!(is_duplicate_broadcast("already known"));
        assert!(!is_duplicate_broadcast("nonce too low"));
    }
}
