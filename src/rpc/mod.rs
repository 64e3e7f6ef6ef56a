//! Typed JSON-RPC clients for the chain nodes.

pub mod btc;
pub mod eth;

pub use btc::BtcRpcClient;
pub use eth::EthRpcClient;

use serde::Deserialize;

/// JSON-RPC error object returned by a node.
#[derive(Debug, Clone, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct NodeError {
    pub code: i64,
    pub message: String,
}

/// JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
pub struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<NodeError>,
}
