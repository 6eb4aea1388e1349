//! Chunked, resumable log retrieval with retry, range halving and throttling.

use super::{LogFilter, LogSource, RawLog, RpcError};
use crate::domain::Address;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tunables for chunked log retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Maximum number of blocks per range query.
    pub chunk_size: u64,
    /// Responses larger than this shrink the chunk ceiling for later chunks.
    pub max_logs_per_chunk: usize,
    /// Attempts per chunk before giving up, counting the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Minimum spacing between consecutive requests. Zero disables.
    pub min_request_interval: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        FetchPolicy {
            chunk_size: 500,
            max_logs_per_chunk: 10_000,
            max_attempts: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            min_request_interval: Duration::ZERO,
        }
    }
}

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn width(&self) -> u64 {
        self.to.saturating_sub(self.from) + 1
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Logs for one fully fetched block range.
#[derive(Debug, Clone)]
pub struct LogBatch {
    pub range: BlockRange,
    pub logs: Vec<RawLog>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The chunk could not be fetched; nothing at or after `range.from` was
    /// delivered.
    #[error("fetch failed for blocks {range} after {attempts} attempt(s): {source}")]
    FetchFailed {
        range: BlockRange,
        attempts: u32,
        source: RpcError,
    },
}

impl FetchError {
    pub fn range(&self) -> BlockRange {
        match self {
            FetchError::FetchFailed { range, .. } => *range,
        }
    }
}

/// Minimum spacing between requests to one endpoint.
///
/// Share one instance (behind an `Arc`) between every caller that talks to
/// the same endpoint; each `wait` reserves the next slot.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Lazy, finite sequence of log batches over `[from_block, to_block]`.
///
/// Batches are contiguous and delivered in block order. After a
/// `FetchFailed` the fetcher is exhausted; a new fetcher started at the
/// failed range's `from` resumes exactly where this one stopped.
#[derive(Debug)]
pub struct LogFetcher {
    source: Arc<dyn LogSource>,
    policy: FetchPolicy,
    addresses: Vec<Address>,
    topic0: String,
    next_block: u64,
    to_block: u64,
    window: u64,
    ceiling: u64,
    throttle: Arc<Throttle>,
    exhausted: bool,
}

impl LogFetcher {
    pub fn new(
        source: Arc<dyn LogSource>,
        policy: FetchPolicy,
        addresses: Vec<Address>,
        topic0: String,
        from_block: u64,
        to_block: u64,
    ) -> Self {
        let chunk = policy.chunk_size.max(1);
        let throttle = Arc::new(Throttle::new(policy.min_request_interval));
        Self {
            source,
            policy,
            addresses,
            topic0,
            next_block: from_block,
            to_block,
            window: chunk,
            ceiling: chunk,
            throttle,
            exhausted: from_block > to_block,
        }
    }

    /// Pace requests with a throttle shared with other callers of the same source.
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Current chunk ceiling, after any shrinking from oversized responses.
    pub fn chunk_ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Fetch the next chunk. `None` once the range is covered or after an error.
    pub async fn next_batch(&mut self) -> Option<Result<LogBatch, FetchError>> {
        if self.exhausted {
            return None;
        }

        loop {
            let span = self.window.min(self.ceiling).max(1);
            let to = self
                .next_block
                .saturating_add(span - 1)
                .min(self.to_block);
            let range = BlockRange {
                from: self.next_block,
                to,
            };

            match self.fetch_with_retry(range).await {
                Ok(logs) => {
                    debug!(
                        from_block = range.from,
                        to_block = range.to,
                        logs = logs.len(),
                        "fetched chunk"
                    );
                    if range.to >= self.to_block {
                        self.exhausted = true;
                    } else {
                        self.next_block = range.to + 1;
                    }
                    if logs.len() > self.policy.max_logs_per_chunk && self.ceiling > 1 {
                        self.ceiling = (self.ceiling / 2).max(1);
                        info!(
                            "{} logs in {}, lowering chunk ceiling to {}",
                            logs.len(),
                            range,
                            self.ceiling
                        );
                    }
                    self.window = self.window.saturating_mul(2).min(self.ceiling);
                    return Some(Ok(LogBatch { range, logs }));
                }
                Err((RpcError::RangeTooLarge(message), attempts)) if range.width() > 1 => {
                    self.window = (range.width() / 2).max(1);
                    warn!(
                        "range {} too large ({}), retrying with {} block(s) after {} attempt(s)",
                        range, message, self.window, attempts
                    );
                }
                Err((source, attempts)) => {
                    self.exhausted = true;
                    return Some(Err(FetchError::FetchFailed {
                        range,
                        attempts,
                        source,
                    }));
                }
            }
        }
    }

    /// One chunk with bounded exponential backoff on transient errors.
    ///
    /// Returns the error together with the number of attempts made.
    async fn fetch_with_retry(&self, range: BlockRange) -> Result<Vec<RawLog>, (RpcError, u32)> {
        let filter = LogFilter {
            from_block: range.from,
            to_block: range.to,
            addresses: self.addresses.clone(),
            topic0: self.topic0.clone(),
        };
        let filter = &filter;
        let what = format!("get_logs {}", range);
        with_retry(&self.policy, &self.throttle, &what, move || self.source.get_logs(filter)).await
    }
}

/// Run one RPC call under `policy`: throttled, retried with bounded
/// exponential backoff while the error is transient, honoring a provider's
/// `retry after` hint.
///
/// On failure returns the last error and the number of attempts made.
pub async fn with_retry<T, F, Fut>(
    policy: &FetchPolicy,
    throttle: &Throttle,
    what: &str,
    mut call: F,
) -> Result<T, (RpcError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let backoff = ExponentialBackoff {
        current_interval: policy.initial_backoff,
        initial_interval: policy.initial_backoff,
        max_interval: policy.max_backoff,
        max_elapsed_time: None,
        ..Default::default()
    };
    let attempts = AtomicU32::new(0);
    let max_attempts = policy.max_attempts.max(1);

    let result = retry(backoff, || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = call();
        async move {
            throttle.wait().await;
            match pending.await {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        what, attempt, max_attempts, e
                    );
                    match e {
                        RpcError::RateLimited {
                            retry_after: Some(wait),
                        } => Err(backoff::Error::retry_after(e, wait)),
                        e => Err(backoff::Error::transient(e)),
                    }
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await;

    result.map_err(|e| (e, attempts.load(Ordering::SeqCst)))
}
