//! Chain access: raw logs, the log source abstraction, chunked fetching and
//! `OrderFilled` decoding.

use crate::domain::Address;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::value::RawValue;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod decoder;
pub mod fetcher;
pub mod mock;
pub mod rpc;

pub use decoder::{order_filled_topic, DecodeSkipped, EventDecoder, SkipReason};
pub use fetcher::{with_retry, BlockRange, FetchError, FetchPolicy, LogBatch, LogFetcher, Throttle};
pub use mock::MockLogSource;
pub use rpc::JsonRpcLogSource;

/// CTF exchange and neg-risk CTF exchange on Polygon.
pub const DEFAULT_EXCHANGE_ADDRESSES: [&str; 2] = [
    "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e",
    "0xc5d563a36ae78145c45a50134d48a1215220f80a",
];

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    /// The entry exactly as the endpoint sent it.
    pub raw_json: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
    block_number: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl RawLog {
    /// Parse one log entry, keeping its original bytes.
    ///
    /// Returns `Ok(None)` for logs flagged `removed` by a reorg.
    pub fn from_raw_json(raw: &RawValue) -> Result<Option<RawLog>, RpcError> {
        let wire: WireLog = serde_json::from_str(raw.get())
            .map_err(|e| RpcError::Parse(format!("invalid log entry: {}", e)))?;
        if wire.removed {
            return Ok(None);
        }

        let block_number = wire
            .block_number
            .as_deref()
            .ok_or_else(|| RpcError::Parse("log missing blockNumber".to_string()))
            .and_then(parse_quantity)?;
        let log_index = wire
            .log_index
            .as_deref()
            .ok_or_else(|| RpcError::Parse("log missing logIndex".to_string()))
            .and_then(parse_quantity)?;
        let transaction_hash = wire
            .transaction_hash
            .ok_or_else(|| RpcError::Parse("log missing transactionHash".to_string()))?
            .to_ascii_lowercase();

        Ok(Some(RawLog {
            address: Address::new(wire.address),
            topics: wire
                .topics
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            data: wire.data.to_ascii_lowercase(),
            block_number,
            transaction_hash,
            log_index,
            raw_json: raw.get().to_string(),
        }))
    }
}

/// Range query for `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    pub topic0: String,
}

/// Source of chain logs and block headers.
///
/// Implementations perform a single attempt per call; retry policy lives in
/// the [`LogFetcher`].
#[async_trait]
pub trait LogSource: Send + Sync + fmt::Debug {
    /// Logs matching the filter, in (block_number, log_index) order.
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError>;

    /// Block timestamp in Unix seconds, None if the block is unknown.
    async fn block_timestamp(&self, block: u64) -> Result<Option<i64>, RpcError>;

    /// Current chain head.
    async fn latest_block(&self) -> Result<u64, RpcError>;

    /// All logs emitted by a transaction, from its receipt.
    async fn transaction_logs(&self, tx_hash: &str) -> Result<Vec<RawLog>, RpcError>;
}

/// Error type for chain RPC operations.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Connection, DNS or timeout failure.
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    /// Provider refused the block range or result size.
    #[error("Range too large: {0}")]
    RangeTooLarge(String),
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// JSON-RPC error object not matching any known class.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

const RANGE_TOO_LARGE_PHRASES: [&str; 6] = [
    "block range is too large",
    "range too large",
    "too many results",
    "response size exceeded",
    "limit exceeded",
    "query returned more than",
];

const RATE_LIMIT_PHRASES: [&str; 2] = ["rate limit", "too many requests"];

impl RpcError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Network(_) | RpcError::RateLimited { .. } | RpcError::Rpc { .. } => true,
            RpcError::Http { status, .. } => *status >= 500,
            RpcError::RangeTooLarge(_) | RpcError::Parse(_) => false,
        }
    }

    /// Classify a JSON-RPC error object by its message.
    pub fn classify(code: i64, message: &str) -> RpcError {
        let lower = message.to_ascii_lowercase();
        if RANGE_TOO_LARGE_PHRASES.iter().any(|p| lower.contains(p)) {
            return RpcError::RangeTooLarge(message.to_string());
        }
        if RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p)) {
            return RpcError::RateLimited {
                retry_after: parse_retry_hint(&lower),
            };
        }
        RpcError::Rpc {
            code,
            message: message.to_string(),
        }
    }
}

/// Extract a "retry in Ns" hint from a provider message.
fn parse_retry_hint(message: &str) -> Option<Duration> {
    let rest = &message[message.find("retry in ")? + "retry in ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || !rest[digits.len()..].starts_with('s') {
        return None;
    }
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

/// Parse a JSON-RPC hex quantity such as `0x1a`.
pub fn parse_quantity(value: &str) -> Result<u64, RpcError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| RpcError::Parse(format!("quantity without 0x prefix: {}", value)))?;
    if digits.is_empty() {
        return Err(RpcError::Parse("empty quantity".to_string()));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Parse(format!("invalid quantity {}: {}", value, e)))
}

/// Encode a block number as a JSON-RPC hex quantity.
pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}
