//! Notification producer (C8).
//!
//! Emits callback rows for deposit and withdrawal lifecycle events. The
//! body is a flat JSON object signed with the tenant's app secret: keys
//! sorted, empty values skipped, `key=<secret>` appended, MD5 uppercased.
//! Delivery of the rows is an external sender's job.

use eyre::Result;
use sqlx::PgPool;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::db;
use crate::db::models::{NewNotification, Product, Withdraw};
use crate::locks;
use crate::types::{DepositStatus, NotifyType, RelatedType, BTC_SYMBOL, ETH_SYMBOL};

/// Deterministic signature over the body fields.
pub fn callback_sign(app_sk: &str, fields: &BTreeMap<String, String>) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(fields.len());
    for (k, v) in fields {
        if k == "sign" || v.is_empty() {
            continue;
        }
        parts.push(format!("{k}={v}"));
    }
    let payload = format!("{}&key={}", parts.join("&"), app_sk);
    hex::encode(md5::compute(payload.as_bytes()).0).to_uppercase()
}

/// Serialize the signed body: fields plus the computed `sign`.
pub fn signed_callback_body(app_sk: &str, mut fields: BTreeMap<String, String>) -> String {
    let sign = callback_sign(app_sk, &fields);
    fields.insert("sign".to_string(), sign);
    serde_json::to_string(&fields).expect("string map always serializes")
}

fn deposit_fields(
    tx_hash: &str,
    app_name: &str,
    address: &str,
    balance: &str,
    symbol: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("tx_hash".to_string(), tx_hash.to_string()),
        ("app_name".to_string(), app_name.to_string()),
        ("address".to_string(), address.to_string()),
        ("balance".to_string(), balance.to_string()),
        ("symbol".to_string(), symbol.to_string()),
        ("notify_type".to_string(), NotifyType::Tx.as_str().to_string()),
    ])
}

/// Build a withdraw lifecycle notification row.
pub fn withdraw_notification(
    withdraw: &Withdraw,
    product: &Product,
    notify_type: NotifyType,
) -> NewNotification {
    let fields = BTreeMap::from([
        ("tx_hash".to_string(), withdraw.tx_hash.clone()),
        ("balance".to_string(), withdraw.balance.clone()),
        ("app_name".to_string(), product.app_name.clone()),
        ("out_serial".to_string(), withdraw.out_serial.clone()),
        ("address".to_string(), withdraw.to_address.clone()),
        ("symbol".to_string(), withdraw.symbol.clone()),
        ("notify_type".to_string(), notify_type.as_str().to_string()),
    ]);
    NewNotification {
        nonce: Uuid::new_v4().simple().to_string(),
        product_id: withdraw.product_id,
        item_type: RelatedType::Withdraw.as_str().to_string(),
        item_id: withdraw.id,
        notify_type: notify_type.as_str().to_string(),
        token_symbol: withdraw.symbol.clone(),
        url: product.cb_url.clone(),
        msg: signed_callback_body(&product.app_sk, fields),
    }
}

fn deposit_notification(
    product: &Product,
    item_id: i64,
    token_symbol: &str,
    fields: BTreeMap<String, String>,
) -> NewNotification {
    NewNotification {
        nonce: Uuid::new_v4().simple().to_string(),
        product_id: product.id,
        item_type: RelatedType::Tx.as_str().to_string(),
        item_id,
        notify_type: NotifyType::Tx.as_str().to_string(),
        token_symbol: token_symbol.to_string(),
        url: product.cb_url.clone(),
        msg: signed_callback_body(&product.app_sk, fields),
    }
}

/// Queue callbacks for freshly observed BTC deposits. A deposit whose
/// product row is gone is drained without a callback so the queue never
/// blocks on reconciliation.
pub async fn check_btc_tx_notify(db: &PgPool) -> Result<()> {
    let Some(_guard) = locks::try_acquire("BtcCheckTxNotify") else {
        return Ok(());
    };
    let rows = db::btc_deposits_by_status(db, DepositStatus::Init.as_str()).await?;
    if rows.is_empty() {
        return Ok(());
    }
    let product_ids: Vec<i64> = dedup_ids(rows.iter().map(|r| r.product_id));
    let products = db::product_map(db, &product_ids).await?;

    let mut handled = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(product) = products.get(&row.product_id) else {
            warn!(product = row.product_id, deposit = row.id, "no product row, draining deposit");
            handled.push(row.id);
            continue;
        };
        let fields = deposit_fields(
            &format!("{}_{}", row.tx_id, row.vout_n),
            &product.app_name,
            &row.address,
            &row.value,
            BTC_SYMBOL,
        );
        db::insert_notification(db, &deposit_notification(product, row.id, BTC_SYMBOL, fields))
            .await?;
        handled.push(row.id);
    }
    db::update_btc_deposits_status(db, &handled, DepositStatus::Notify.as_str()).await?;
    Ok(())
}

/// Queue callbacks for freshly observed OMNI deposits.
pub async fn check_omni_tx_notify(db: &PgPool) -> Result<()> {
    let Some(_guard) = locks::try_acquire("OmniCheckTxNotify") else {
        return Ok(());
    };
    let rows = db::omni_deposits_by_handle_status(db, DepositStatus::Init.as_str()).await?;
    if rows.is_empty() {
        return Ok(());
    }
    let product_ids: Vec<i64> = dedup_ids(rows.iter().map(|r| r.product_id));
    let products = db::product_map(db, &product_ids).await?;

    let mut handled = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(product) = products.get(&row.product_id) else {
            warn!(product = row.product_id, deposit = row.id, "no product row, draining deposit");
            handled.push(row.id);
            continue;
        };
        let fields = deposit_fields(
            &row.tx_id,
            &product.app_name,
            &row.to_address,
            &row.value,
            &row.token_symbol,
        );
        db::insert_notification(
            db,
            &deposit_notification(product, row.id, &row.token_symbol, fields),
        )
        .await?;
        handled.push(row.id);
    }
    db::update_omni_deposits_handle_status(db, &handled, DepositStatus::Notify.as_str()).await?;
    Ok(())
}

/// Queue callbacks for freshly observed ETH deposits.
pub async fn check_eth_tx_notify(db: &PgPool) -> Result<()> {
    let Some(_guard) = locks::try_acquire("EthCheckTxNotify") else {
        return Ok(());
    };
    let rows = db::eth_deposits_by_handle_status(db, DepositStatus::Init.as_str()).await?;
    if rows.is_empty() {
        return Ok(());
    }
    let product_ids: Vec<i64> = dedup_ids(rows.iter().map(|r| r.product_id));
    let products = db::product_map(db, &product_ids).await?;

    let mut handled = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(product) = products.get(&row.product_id) else {
            warn!(product = row.product_id, deposit = row.id, "no product row, draining deposit");
            handled.push(row.id);
            continue;
        };
        let fields = deposit_fields(
            &row.tx_id,
            &product.app_name,
            &row.to_address,
            &row.value,
            ETH_SYMBOL,
        );
        db::insert_notification(db, &deposit_notification(product, row.id, ETH_SYMBOL, fields))
            .await?;
        handled.push(row.id);
    }
    db::update_eth_deposits_handle_status(db, &handled, DepositStatus::Notify.as_str()).await?;
    Ok(())
}

/// Queue callbacks for freshly observed ERC-20 deposits.
pub async fn check_erc20_tx_notify(db: &PgPool) -> Result<()> {
    let Some(_guard) = locks::try_acquire("Erc20CheckTxNotify") else {
        return Ok(());
    };
    let rows = db::erc20_deposits_by_handle_status(db, DepositStatus::Init.as_str()).await?;
    if rows.is_empty() {
        return Ok(());
    }
    let product_ids: Vec<i64> = dedup_ids(rows.iter().map(|r| r.product_id));
    let token_ids: Vec<i64> = dedup_ids(rows.iter().map(|r| r.token_id));
    let products = db::product_map(db, &product_ids).await?;
    let tokens: std::collections::HashMap<i64, _> = db::erc20_tokens_by_ids(db, &token_ids)
        .await?
        .into_iter()
        .map(|t| (t.id, t))
        .collect();

    let mut handled = Vec::with_capacity(rows.len());
    for row in &rows {
        let Some(product) = products.get(&row.product_id) else {
            warn!(product = row.product_id, deposit = row.id, "no product row, draining deposit");
            handled.push(row.id);
            continue;
        };
        let Some(token) = tokens.get(&row.token_id) else {
            warn!(token = row.token_id, deposit = row.id, "no token row, draining deposit");
            handled.push(row.id);
            continue;
        };
        let fields = deposit_fields(
            &row.tx_id,
            &product.app_name,
            &row.to_address,
            &row.value,
            &token.token_symbol,
        );
        db::insert_notification(
            db,
            &deposit_notification(product, row.id, &token.token_symbol, fields),
        )
        .await?;
        handled.push(row.id);
    }
    db::update_erc20_deposits_handle_status(db, &handled, DepositStatus::Notify.as_str()).await?;
    Ok(())
}

fn dedup_ids(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut v: Vec<i64> = ids.collect();
    v.sort();
    v.dedup();
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("tx_hash".to_string(), "abc_0".to_string()),
            ("app_name".to_string(), "wallet-app".to_string()),
            ("address".to_string(), "3FooBar".to_string()),
            ("balance".to_string(), "0.5".to_string()),
            ("symbol".to_string(), "btc".to_string()),
            ("notify_type".to_string(), "tx".to_string()),
        ])
    }

    #[test]
    fn test_sign_is_deterministic() {
        let a = callback_sign("secret", &fields());
        let b = callback_sign("secret", &fields());
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_eq!(a, a.to_uppercase());
    }

    #[test]
    fn test_sign_depends_on_secret_and_fields() {
        let base = callback_sign("secret", &fields());
        assert_ne!(base, callback_sign("other", &fields()));
        let mut changed = fields();
        changed.insert("balance".to_string(), "0.6".to_string());
        assert_ne!(base, callback_sign("secret", &changed));
    }

    #[test]
    fn test_empty_values_excluded_from_signature() {
        let base = callback_sign("secret", &fields());
        let mut with_empty = fields();
        with_empty.insert("memo".to_string(), String::new());
        assert_eq!(base, callback_sign("secret", &with_empty));
    }

    #[test]
    fn test_known_digest() {
        // md5("a=1&b=2&key=sk") uppercased
        let fields = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let expected = hex::encode(md5::compute(b"a=1&b=2&key=sk").0).to_uppercase();
        assert_eq!(callback_sign("sk", &fields), expected);
    }

    #[test]
    fn test_signed_body_contains_sign_and_sorted_keys() {
        let body = signed_callback_body("secret", fields());
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(parsed.get("sign").is_some());
        assert_eq!(parsed["symbol"], "btc");
        // signature of the body (minus sign) must verify
        let mut roundtrip: BTreeMap<String, String> =
            serde_json::from_str(&body).unwrap();
        let sign = roundtrip.remove("sign").unwrap();
        assert_eq!(sign, callback_sign("secret", &roundtrip));
    }
}
