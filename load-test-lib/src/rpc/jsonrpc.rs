//! Minimal JSON-RPC 2.0 envelope as spoken by the CometBFT RPC endpoint.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub(super) struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: TxParams,
}

#[derive(Debug, Serialize)]
pub(super) struct TxParams {
    /// base64 encoded transaction bytes
    pub tx: String,
}

impl<'a> RpcRequest<'a> {
    pub(super) fn broadcast_tx(id: u64, method: &'a str, tx: &[u8]) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params: TxParams {
                tx: STANDARD.encode(tx),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub(super) fn describe(&self) -> String {
        match &self.data {
            Some(Value::String(data)) if !data.is_empty() => format!("{}: {data}", self.message),
            Some(Value::Null) | None => self.message.clone(),
            Some(other) => format!("{}: {other}", self.message),
        }
    }
}

/// ABCI result as embedded in `broadcast_tx_sync` and `broadcast_tx_commit` results.
#[derive(Debug, Default, Deserialize)]
pub(super) struct AbciResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub log: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct CommitResult {
    #[serde(default)]
    pub check_tx: AbciResult,
    /// `deliver_tx` on CometBFT releases before v0.38
    #[serde(default, alias = "deliver_tx")]
    pub tx_result: AbciResult,
}

#[derive(Debug, Deserialize)]
pub(super) struct NetInfoResult {
    /// CometBFT encodes integers as strings
    pub n_peers: String,
}
