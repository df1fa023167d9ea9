//! Chain client used by the dispatch workers

use crate::error::TransferError;
use async_trait::async_trait;
use faucet_common::{Address, Coin};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One output of a batched transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub destination: Address,
    pub amount: Coin,
}

/// Submits a multi-output transfer signed by a single funding account.
///
/// Implementations must accept any number of outputs and return the hash of
/// the transaction that carries all of them.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn transfer(
        &self,
        from: &Address,
        requests: &[TransferRequest],
    ) -> Result<String, TransferError>;
}

/// JSON-RPC client for a signing node that owns the funding keys
pub struct RpcTransferClient {
    rpc_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct MultiSendOutput<'a> {
    to: &'a Address,
    denom: &'a str,
    amount: String,
}

#[derive(Debug, Serialize)]
struct MultiSendParams<'a> {
    from: &'a Address,
    outputs: Vec<MultiSendOutput<'a>>,
}

impl RpcTransferClient {
    pub fn new(rpc_url: String) -> Self {
        Self {
            rpc_url,
            client: reqwest::Client::new(),
        }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransferError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransferError::Rpc(format!("Request failed: {}", e)))?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransferError::Rpc(format!("Invalid response: {}", e)))?;

        parse_rpc_response(json)
    }
}

/// Split a JSON-RPC envelope into its result or a node-side rejection.
fn parse_rpc_response(json: serde_json::Value) -> Result<serde_json::Value, TransferError> {
    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(TransferError::Rejected(message));
    }

    Ok(json
        .get("result")
        .cloned()
        .unwrap_or(serde_json::Value::Null))
}

#[async_trait]
impl TransferClient for RpcTransferClient {
    async fn transfer(
        &self,
        from: &Address,
        requests: &[TransferRequest],
    ) -> Result<String, TransferError> {
        let destinations: Vec<String> = requests.iter().map(|r| r.destination.to_string()).collect();
        info!(from_address = %from, to_addresses = ?destinations, "Sending tokens");

        let params = MultiSendParams {
            from,
            outputs: requests
                .iter()
                .map(|r| MultiSendOutput {
                    to: &r.destination,
                    denom: &r.amount.denom,
                    amount: r.amount.amount.to_string(),
                })
                .collect(),
        };
        let params = serde_json::to_value([params])
            .map_err(|e| TransferError::Rpc(format!("Encoding params failed: {}", e)))?;

        let result = self.call("bank_multiSend", params).await?;
        let tx_hash = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TransferError::Rpc(format!("Unexpected result: {}", result)))?;

        info!(from_address = %from, tx_hash = %tx_hash, "Tokens sent");
        Ok(tx_hash)
    }
}
