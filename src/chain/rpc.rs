//! JSON-RPC client for an EVM chain endpoint.

use super::{parse_quantity, to_quantity, LogFilter, LogSource, RawLog, RpcError};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::time::Duration;
use tracing::{debug, warn};

/// Log source backed by a JSON-RPC endpoint (`eth_getLogs` and friends).
#[derive(Debug, Clone)]
pub struct JsonRpcLogSource {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Box<RawValue>>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct BlockHeader {
    timestamp: String,
}

#[derive(Deserialize)]
struct Receipt {
    #[serde(default)]
    logs: Vec<Box<RawValue>>,
}

impl JsonRpcLogSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    /// One JSON-RPC round trip. `Ok(None)` means the call returned `null`.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<Box<RawValue>>, RpcError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| RpcError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Network(e.to_string()))?;

        if status == 429 {
            // Some providers put the hint in the body even on 429.
            return Err(match RpcError::classify(429, &body) {
                err @ RpcError::RateLimited { .. } => err,
                _ => RpcError::RateLimited { retry_after: None },
            });
        }
        if !status.is_success() {
            let message: String = body.chars().take(200).collect();
            if let err @ RpcError::RangeTooLarge(_) = RpcError::classify(0, &message) {
                return Err(err);
            }
            return Err(RpcError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: RpcResponse = serde_json::from_str(&body)
            .map_err(|e| RpcError::Parse(format!("invalid JSON-RPC response: {}", e)))?;
        if let Some(err) = parsed.error {
            return Err(RpcError::classify(err.code, &err.message));
        }
        Ok(parsed.result.filter(|raw| raw.get() != "null"))
    }

    /// `call` with exponential backoff on transient failures.
    async fn call_with_retry(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<Box<RawValue>>, RpcError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            self.call(method, params.clone()).await.map_err(|e| {
                if e.is_transient() {
                    warn!("{} failed, retrying: {}", method, e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }
}

fn parse_log_array(raw: &RawValue) -> Result<Vec<RawLog>, RpcError> {
    let entries: Vec<Box<RawValue>> = serde_json::from_str(raw.get())
        .map_err(|e| RpcError::Parse(format!("expected log array: {}", e)))?;
    let mut logs = Vec::with_capacity(entries.len());
    for entry in &entries {
        if let Some(log) = RawLog::from_raw_json(entry)? {
            logs.push(log);
        }
    }
    Ok(logs)
}

#[async_trait]
impl LogSource for JsonRpcLogSource {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        debug!(
            "eth_getLogs from_block={}, to_block={}, addresses={}",
            filter.from_block,
            filter.to_block,
            filter.addresses.len()
        );

        let addresses: Vec<&str> = filter.addresses.iter().map(|a| a.as_str()).collect();
        let params = serde_json::json!([{
            "fromBlock": to_quantity(filter.from_block),
            "toBlock": to_quantity(filter.to_block),
            "address": addresses,
            "topics": [filter.topic0],
        }]);

        match self.call("eth_getLogs", params).await? {
            Some(raw) => parse_log_array(&raw),
            None => Ok(Vec::new()),
        }
    }

    async fn block_timestamp(&self, block: u64) -> Result<Option<i64>, RpcError> {
        let params = serde_json::json!([to_quantity(block), false]);
        let Some(raw) = self.call("eth_getBlockByNumber", params).await? else {
            return Ok(None);
        };
        let header: BlockHeader = serde_json::from_str(raw.get())
            .map_err(|e| RpcError::Parse(format!("invalid block header: {}", e)))?;
        let ts = parse_quantity(&header.timestamp)?;
        i64::try_from(ts)
            .map(Some)
            .map_err(|_| RpcError::Parse(format!("timestamp out of range: {}", ts)))
    }

    async fn latest_block(&self) -> Result<u64, RpcError> {
        let raw = self
            .call_with_retry("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| RpcError::Parse("eth_blockNumber returned null".to_string()))?;
        let quantity: String = serde_json::from_str(raw.get())
            .map_err(|e| RpcError::Parse(format!("invalid block number: {}", e)))?;
        parse_quantity(&quantity)
    }

    async fn transaction_logs(&self, tx_hash: &str) -> Result<Vec<RawLog>, RpcError> {
        let params = serde_json::json!([tx_hash]);
        let Some(raw) = self
            .call_with_retry("eth_getTransactionReceipt", params)
            .await?
        else {
            return Ok(Vec::new());
        };
        let receipt: Receipt = serde_json::from_str(raw.get())
            .map_err(|e| RpcError::Parse(format!("invalid receipt: {}", e)))?;
        let mut logs = Vec::with_capacity(receipt.logs.len());
        for entry in &receipt.logs {
            if let Some(log) = RawLog::from_raw_json(entry)? {
                logs.push(log);
            }
        }
        Ok(logs)
    }
}
