//! Mock log source for testing without network calls.

use super::{LogFilter, LogSource, RawLog, RpcError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Mock log source that serves predefined logs and scripted failures.
#[derive(Debug, Default)]
pub struct MockLogSource {
    logs: Vec<RawLog>,
    timestamps: HashMap<u64, i64>,
    latest: u64,
    /// Ranges wider than this many blocks fail with RangeTooLarge.
    max_range: Option<u64>,
    /// Any range covering this block fails with RangeTooLarge, even at width 1.
    oversized_block: Option<u64>,
    /// Any range covering this block fails with a transient network error.
    broken_block: Option<u64>,
    transient_failures: Mutex<u32>,
    /// Pending get_logs rate-limit refusals and the hint they carry.
    rate_limits: Mutex<(u32, Option<Duration>)>,
    timestamp_failures: Mutex<u32>,
    calls: Mutex<Vec<LogFilter>>,
    /// When each get_logs or block_timestamp request arrived.
    requests: Mutex<Vec<Instant>>,
}

impl MockLogSource {
    /// Create a new mock log source with no logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a log. The chain head grows to cover it.
    pub fn with_log(mut self, log: RawLog) -> Self {
        self.latest = self.latest.max(log.block_number);
        self.logs.push(log);
        self
    }

    pub fn with_logs(self, logs: Vec<RawLog>) -> Self {
        logs.into_iter().fold(self, |source, log| source.with_log(log))
    }

    pub fn with_timestamp(mut self, block: u64, ts: i64) -> Self {
        self.timestamps.insert(block, ts);
        self
    }

    pub fn with_latest_block(mut self, block: u64) -> Self {
        self.latest = block;
        self
    }

    pub fn with_max_range(mut self, blocks: u64) -> Self {
        self.max_range = Some(blocks);
        self
    }

    pub fn with_oversized_block(mut self, block: u64) -> Self {
        self.oversized_block = Some(block);
        self
    }

    pub fn with_broken_block(mut self, block: u64) -> Self {
        self.broken_block = Some(block);
        self
    }

    /// Fail the next `count` get_logs calls with a transient error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        if let Ok(mut remaining) = self.transient_failures.lock() {
            *remaining = count;
        }
        self
    }

    /// Refuse the next `count` get_logs calls as rate limited, with an
    /// optional `retry after` hint.
    pub fn with_rate_limits(self, count: u32, retry_after: Option<Duration>) -> Self {
        if let Ok(mut pending) = self.rate_limits.lock() {
            *pending = (count, retry_after);
        }
        self
    }

    /// Refuse the next `count` block_timestamp calls as rate limited.
    pub fn with_timestamp_failures(self, count: u32) -> Self {
        if let Ok(mut remaining) = self.timestamp_failures.lock() {
            *remaining = count;
        }
        self
    }

    /// Arrival time of every get_logs and block_timestamp request.
    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record_request(&self) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(Instant::now());
        }
    }

    fn take_one(counter: &Mutex<u32>) -> bool {
        match counter.lock() {
            Ok(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Every get_logs filter received so far.
    pub fn calls(&self) -> Vec<LogFilter> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn covers(filter: &LogFilter, block: Option<u64>) -> bool {
        block.is_some_and(|b| filter.from_block <= b && b <= filter.to_block)
    }
}

#[async_trait]
impl LogSource for MockLogSource {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(filter.clone());
        }
        self.record_request();

        if Self::take_one(&self.transient_failures) {
            return Err(RpcError::Network("connection reset".to_string()));
        }
        if let Ok(mut pending) = self.rate_limits.lock() {
            if pending.0 > 0 {
                pending.0 -= 1;
                return Err(RpcError::RateLimited {
                    retry_after: pending.1,
                });
            }
        }
        if Self::covers(filter, self.broken_block) {
            return Err(RpcError::Http {
                status: 503,
                message: "Service unavailable".to_string(),
            });
        }
        let width = filter.to_block.saturating_sub(filter.from_block) + 1;
        if self.max_range.is_some_and(|max| width > max)
            || Self::covers(filter, self.oversized_block)
        {
            return Err(RpcError::RangeTooLarge(
                "query returned more than 10000 results".to_string(),
            ));
        }

        let topic0 = filter.topic0.to_ascii_lowercase();
        let mut logs: Vec<RawLog> = self
            .logs
            .iter()
            .filter(|log| {
                log.block_number >= filter.from_block
                    && log.block_number <= filter.to_block
                    && (filter.addresses.is_empty() || filter.addresses.contains(&log.address))
                    && log.topics.first().is_some_and(|t| *t == topic0)
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn block_timestamp(&self, block: u64) -> Result<Option<i64>, RpcError> {
        self.record_request();
        if Self::take_one(&self.timestamp_failures) {
            return Err(RpcError::RateLimited { retry_after: None });
        }
        Ok(self.timestamps.get(&block).copied())
    }

    async fn latest_block(&self) -> Result<u64, RpcError> {
        Ok(self.latest)
    }

    async fn transaction_logs(&self, tx_hash: &str) -> Result<Vec<RawLog>, RpcError> {
        let tx_hash = tx_hash.to_ascii_lowercase();
        let mut logs: Vec<RawLog> = self
            .logs
            .iter()
            .filter(|log| log.transaction_hash == tx_hash)
            .cloned()
            .collect();
        logs.sort_by_key(|log| log.log_index);
        Ok(logs)
    }
}
