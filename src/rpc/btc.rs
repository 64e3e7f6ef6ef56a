//! JSON-RPC client for a bitcoind/omnicored node.
//!
//! Plain reqwest POSTs with HTTP basic auth; every call carries the node's
//! error object back into the `Result` so callers can match on messages
//! like "already in block chain".

#![allow(dead_code)]

use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use super::RpcResponse;

/// Chain RPC calls are slow on verbose blocks; allow minutes.
const RPC_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct BtcRpcClient {
    client: Client,
    url: String,
    user: String,
    pass: String,
}

impl std::fmt::Debug for BtcRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtcRpcClient")
            .field("url", &self.url)
            .field("auth", &"<redacted>")
            .finish()
    }
}

/// Input of a verbose transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct TxVin {
    #[serde(default)]
    pub coinbase: Option<String>,
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vout: i64,
}

/// `scriptPubKey` object of a verbose output. Older nodes report an
/// `addresses` array, newer ones a single `address`; `addresses()` merges
/// the two.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub hex: String,
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    #[serde(default)]
    pub address: Option<String>,
}

impl ScriptPubKey {
    pub fn addresses(&self) -> Vec<String> {
        if let Some(ref list) = self.addresses {
            return list.clone();
        }
        self.address.clone().into_iter().collect()
    }
}

/// Output of a verbose transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct TxVout {
    pub value: f64,
    pub n: i64,
    #[serde(rename = "scriptPubKey", default)]
    pub script_pub_key: ScriptPubKey,
}

/// `getrawtransaction … 1` / `getblock … 2` transaction object.
#[derive(Debug, Clone, Deserialize)]
pub struct TxResult {
    pub txid: String,
    #[serde(default)]
    pub vsize: i64,
    #[serde(default)]
    pub vin: Vec<TxVin>,
    #[serde(default)]
    pub vout: Vec<TxVout>,
    #[serde(default)]
    pub blockhash: Option<String>,
    #[serde(default)]
    pub confirmations: i64,
}

/// `getblock <hash> 2` result.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockResult {
    pub hash: String,
    pub height: i64,
    pub tx: Vec<TxResult>,
}

/// `omni_gettransaction` result.
#[derive(Debug, Clone, Deserialize)]
pub struct OmniTx {
    pub txid: String,
    #[serde(default)]
    pub sendingaddress: String,
    #[serde(default)]
    pub referenceaddress: String,
    #[serde(rename = "type_int", default)]
    pub type_int: i64,
    #[serde(default)]
    pub propertyid: i64,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub blockhash: String,
    #[serde(default)]
    pub blocktime: i64,
    #[serde(default)]
    pub confirmations: i64,
}

/// `omni_getbalance` result.
#[derive(Debug, Clone, Deserialize)]
pub struct OmniBalance {
    pub balance: String,
    #[serde(default)]
    pub reserved: String,
    #[serde(default)]
    pub frozen: String,
}

impl BtcRpcClient {
    pub fn new(url: &str, user: &str, pass: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .wrap_err("failed to build BTC RPC http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            user: user.to_string(),
            pass: pass.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("btc rpc {method} request failed"))?
            .json::<RpcResponse<T>>()
            .await
            .wrap_err_with(|| format!("btc rpc {method} returned malformed json"))?;

        if let Some(err) = resp.error {
            return Err(err.into());
        }
        resp.result
            .ok_or_else(|| eyre!("btc rpc {method} returned null result"))
    }

    /// `getblockcount`
    pub async fn get_block_count(&self) -> Result<i64> {
        self.call("getblockcount", serde_json::json!([])).await
    }

    /// `getblockhash <height>`
    pub async fn get_block_hash(&self, height: i64) -> Result<String> {
        self.call("getblockhash", serde_json::json!([height])).await
    }

    /// `getblock <hash> 2` — block with full transaction objects.
    pub async fn get_block_verbose(&self, hash: &str) -> Result<BlockResult> {
        self.call("getblock", serde_json::json!([hash, 2])).await
    }

    /// `getrawtransaction <txid> 1`
    pub async fn get_raw_transaction_verbose(&self, txid: &str) -> Result<TxResult> {
        self.call("getrawtransaction", serde_json::json!([txid, 1]))
            .await
    }

    /// `sendrawtransaction <hex>`
    pub async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String> {
        self.call("sendrawtransaction", serde_json::json!([tx_hex]))
            .await
    }

    /// `omni_gettransaction <txid>`
    pub async fn omni_get_transaction(&self, txid: &str) -> Result<OmniTx> {
        self.call("omni_gettransaction", serde_json::json!([txid]))
            .await
    }

    /// `omni_getbalance <address> <property>`
    pub async fn omni_get_balance(&self, address: &str, token_index: i64) -> Result<OmniBalance> {
        self.call("omni_getbalance", serde_json::json!([address, token_index]))
            .await
    }

    /// Resolve the address funded by `(txid, vout)` — the previous output
    /// of some input being classified. Returns `None` for coinbase inputs
    /// and outputs without a decodable address.
    pub async fn prev_output_address(&self, txid: &str, vout: i64) -> Result<Option<String>> {
        if txid.is_empty() {
            return Ok(None);
        }
        let tx = self.get_raw_transaction_verbose(txid).await?;
        let out = tx.vout.into_iter().find(|o| o.n == vout);
        Ok(out.and_then(|o| o.script_pub_key.addresses().into_iter().next()))
    }
}
