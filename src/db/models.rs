#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

// Amount columns are NUMERIC in the database and String in the code. Inserts
// cast the text value ($n::NUMERIC); selects cast back (value::TEXT).

/// An issued address with its sealed signing key.
#[derive(Debug, Clone, FromRow)]
pub struct AddressRow {
    pub id: i64,
    pub symbol: String,
    pub address: String,
    pub encrypted_key: String,
    pub use_tag: i64,
}

/// Tenant record consumed by the notification producer.
#[derive(Debug, Clone, FromRow)]
pub struct Product {
    pub id: i64,
    pub app_name: String,
    pub cb_url: String,
    pub app_sk: String,
}

/// One confirmed vout paying a tenant-owned BTC address.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BtcDeposit {
    pub id: i64,
    pub product_id: i64,
    pub block_hash: String,
    pub tx_id: String,
    pub vout_n: i64,
    pub address: String,
    pub value: String,
    pub handle_status: String,
}

#[derive(Debug, Clone)]
pub struct NewBtcDeposit {
    pub product_id: i64,
    pub block_hash: String,
    pub tx_id: String,
    pub vout_n: i64,
    pub address: String,
    pub value: String,
}

/// A tracked output at one of our addresses.
#[derive(Debug, Clone, FromRow)]
pub struct BtcUtxo {
    pub id: i64,
    pub utxo_type: String,
    pub block_hash: String,
    pub tx_id: String,
    pub vout_n: i64,
    pub address: String,
    pub value: String,
    pub script: String,
    pub spend_tx_id: String,
    pub spend_n: i64,
    pub handle_status: String,
}

#[derive(Debug, Clone)]
pub struct NewBtcUtxo {
    pub utxo_type: String,
    pub block_hash: String,
    pub tx_id: String,
    pub vout_n: i64,
    pub address: String,
    pub value: String,
    pub script: String,
}

/// One valid OMNI simple send crediting a tenant-owned address.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OmniDeposit {
    pub id: i64,
    pub product_id: i64,
    pub token_index: i64,
    pub token_symbol: String,
    pub block_hash: String,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub handle_status: String,
    pub org_status: String,
}

#[derive(Debug, Clone)]
pub struct NewOmniDeposit {
    pub product_id: i64,
    pub token_index: i64,
    pub token_symbol: String,
    pub block_hash: String,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
}

/// A plain ETH value transfer to a tenant-owned address.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EthDeposit {
    pub id: i64,
    pub product_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub handle_status: String,
    pub org_status: String,
}

#[derive(Debug, Clone)]
pub struct NewEthDeposit {
    pub product_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
}

/// A verified ERC-20 transfer to a tenant-owned address.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Erc20Deposit {
    pub id: i64,
    pub token_id: i64,
    pub product_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub handle_status: String,
    pub org_status: String,
}

#[derive(Debug, Clone)]
pub struct NewErc20Deposit {
    pub token_id: i64,
    pub product_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
}

/// A tenant withdrawal request.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Withdraw {
    pub id: i64,
    pub product_id: i64,
    pub out_serial: String,
    pub symbol: String,
    pub to_address: String,
    pub balance: String,
    pub tx_hash: String,
    pub handle_status: String,
    pub created_at: DateTime<Utc>,
}

/// Queued BTC transaction. One signed tx may fan out into several rows
/// sharing `tx_id`; the leader carries the hex.
#[derive(Debug, Clone, FromRow)]
pub struct BtcSend {
    pub id: i64,
    pub related_type: String,
    pub related_id: i64,
    pub token_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub balance: String,
    pub gas: i64,
    pub gas_price: i64,
    pub hex: String,
    pub handle_status: String,
}

#[derive(Debug, Clone)]
pub struct NewBtcSend {
    pub related_type: String,
    pub related_id: i64,
    pub token_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub balance: String,
    pub gas: i64,
    pub gas_price: i64,
    pub hex: String,
}

/// Queued ETH transaction; placeholders carry `nonce = -1` and empty hex.
#[derive(Debug, Clone, FromRow)]
pub struct EthSend {
    pub id: i64,
    pub related_type: String,
    pub related_id: i64,
    pub token_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub balance: String,
    pub gas: i64,
    pub gas_price: i64,
    pub nonce: i64,
    pub hex: String,
    pub handle_status: String,
}

#[derive(Debug, Clone)]
pub struct NewEthSend {
    pub related_type: String,
    pub related_id: i64,
    pub token_id: i64,
    pub tx_id: String,
    pub from_address: String,
    pub to_address: String,
    pub balance: String,
    pub gas: i64,
    pub gas_price: i64,
    pub nonce: i64,
    pub hex: String,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub nonce: String,
    pub product_id: i64,
    pub item_type: String,
    pub item_id: i64,
    pub notify_type: String,
    pub token_symbol: String,
    pub url: String,
    pub msg: String,
}

/// ERC-20 token configuration.
#[derive(Debug, Clone, FromRow)]
pub struct Erc20Token {
    pub id: i64,
    pub token_address: String,
    pub token_decimals: i64,
    pub token_symbol: String,
    pub cold_address: String,
    pub hot_address: String,
    pub org_min_balance: String,
}

/// OMNI token configuration.
#[derive(Debug, Clone, FromRow)]
pub struct OmniToken {
    pub id: i64,
    pub token_index: i64,
    pub token_symbol: String,
    pub cold_address: String,
    pub hot_address: String,
    pub fee_address: String,
    pub tx_org_min_balance: String,
}

/// Row returned when matching block inputs against tracked UTXOs.
#[derive(Debug, Clone, FromRow)]
pub struct UtxoKeyRow {
    pub id: i64,
    pub tx_id: String,
    pub vout_n: i64,
}
