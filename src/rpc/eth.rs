//! JSON-RPC client for a geth-compatible node.
//!
//! Same transport pattern as the BTC client, minus basic auth. Quantities
//! travel as 0x-hex strings and are decoded at the edge.

#![allow(dead_code)]

use alloy::primitives::U256;
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::RpcResponse;

const RPC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct EthRpcClient {
    client: Client,
    url: String,
    chain_id: Arc<OnceLock<u64>>,
}

/// Transaction object from `eth_getBlockByNumber(.., true)` /
/// `eth_getTransactionByHash`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTx {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: String,
    pub input: String,
    #[serde(default)]
    pub block_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthBlock {
    pub number: String,
    pub transactions: Vec<EthTx>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthReceipt {
    pub status: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(default)]
    pub removed: bool,
    pub transaction_hash: String,
}

/// Decode a 0x-prefixed hex quantity into u64.
pub fn hex_to_u64(quantity: &str) -> Result<u64> {
    u64::from_str_radix(quantity.trim_start_matches("0x"), 16)
        .wrap_err_with(|| format!("bad hex quantity: {quantity}"))
}

/// Decode a 0x-prefixed hex quantity into U256.
pub fn hex_to_u256(quantity: &str) -> Result<U256> {
    let digits = quantity.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).wrap_err_with(|| format!("bad hex quantity: {quantity}"))
}

impl EthRpcClient {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .wrap_err("failed to build ETH RPC http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            chain_id: Arc::new(OnceLock::new()),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("eth rpc {method} request failed"))?
            .json::<RpcResponse<T>>()
            .await
            .wrap_err_with(|| format!("eth rpc {method} returned malformed json"))?;

        if let Some(err) = resp.error {
            return Err(err.into());
        }
        resp.result
            .ok_or_else(|| eyre!("eth rpc {method} returned null result"))
    }

    /// Like `call`, but a null result is a legitimate answer
    /// (unknown tx hash / receipt).
    async fn call_nullable<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("eth rpc {method} request failed"))?
            .json::<RpcResponse<T>>()
            .await
            .wrap_err_with(|| format!("eth rpc {method} returned malformed json"))?;

        if let Some(err) = resp.error {
            return Err(err.into());
        }
        Ok(resp.result)
    }

    /// `eth_blockNumber`
    pub async fn block_number(&self) -> Result<i64> {
        let hex: String = self.call("eth_blockNumber", serde_json::json!([])).await?;
        Ok(hex_to_u64(&hex)? as i64)
    }

    /// `eth_getBlockByNumber <height> true`
    pub async fn block_by_number(&self, height: i64) -> Result<EthBlock> {
        self.call(
            "eth_getBlockByNumber",
            serde_json::json!([format!("0x{height:x}"), true]),
        )
        .await
    }

    /// `eth_getTransactionByHash`; `None` when unknown, `Some` only once
    /// the transaction is in a block (pending transactions report no
    /// block number and are treated as absent).
    pub async fn transaction_by_hash(&self, tx_hash: &str) -> Result<Option<EthTx>> {
        let tx: Option<EthTx> = self
            .call_nullable("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await?;
        Ok(tx.filter(|t| t.block_number.is_some()))
    }

    /// `eth_getTransactionReceipt`
    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<EthReceipt>> {
        self.call_nullable("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await
    }

    /// `eth_sendRawTransaction`
    pub async fn send_raw_transaction(&self, raw_hex: &str) -> Result<String> {
        let raw = if raw_hex.starts_with("0x") {
            raw_hex.to_string()
        } else {
            format!("0x{raw_hex}")
        };
        self.call("eth_sendRawTransaction", serde_json::json!([raw]))
            .await
    }

    /// `eth_getBalance <address> latest`
    pub async fn balance_at(&self, address: &str) -> Result<U256> {
        let hex: String = self
            .call("eth_getBalance", serde_json::json!([address, "latest"]))
            .await?;
        hex_to_u256(&hex)
    }

    /// `eth_getTransactionCount <address> latest`
    pub async fn nonce_at(&self, address: &str) -> Result<i64> {
        let hex: String = self
            .call(
                "eth_getTransactionCount",
                serde_json::json!([address, "latest"]),
            )
            .await?;
        Ok(hex_to_u64(&hex)? as i64)
    }

    /// `eth_getLogs` over `[from, to]` for one topic0 across the given
    /// contract addresses.
    pub async fn filter_logs(
        &self,
        from: i64,
        to: i64,
        addresses: &[String],
        topic0: &str,
    ) -> Result<Vec<EthLog>> {
        self.call(
            "eth_getLogs",
            serde_json::json!([{
                "fromBlock": format!("0x{from:x}"),
                "toBlock": format!("0x{to:x}"),
                "address": addresses,
                "topics": [topic0],
            }]),
        )
        .await
    }

    /// `net_version`, cached after the first successful fetch.
    pub async fn chain_id(&self) -> Result<u64> {
        if let Some(id) = self.chain_id.get() {
            return Ok(*id);
        }
        let version: String = self.call("net_version", serde_json::json!([])).await?;
        let id: u64 = version
            .parse()
            .wrap_err_with(|| format!("bad net_version: {version}"))?;
        let _ = self.chain_id.set(id);
        Ok(id)
    }

    /// ERC-20 `balanceOf(holder)` via `eth_call`.
    pub async fn token_balance(&self, token_address: &str, holder: &str) -> Result<U256> {
        let data = crate::chains::eth::balance_of_calldata(holder)?;
        let hex: String = self
            .call(
                "eth_call",
                serde_json::json!([{ "to": token_address, "data": data }, "latest"]),
            )
            .await?;
        hex_to_u256(&hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_quantity_decoding() {
        assert_eq!(hex_to_u64("0x10").unwrap(), 16);
        assert_eq!(hex_to_u64("0x0").unwrap(), 0);
        assert!(hex_to_u256("0xzz").is_err());
        assert_eq!(
            hex_to_u256("0xde0b6b3a7640000").unwrap(),
            U256::from(1_000_000_000_000_000_000u128)
        );
        assert_eq!(hex_to_u256("0x").unwrap(), U256::ZERO);
    }
}
