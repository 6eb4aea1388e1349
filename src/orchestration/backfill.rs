//! Fetch → decode → store pipeline.
//!
//! A spawned producer pulls chunks from the [`LogFetcher`] while this task
//! decodes and commits the previous one. The channel holds a single batch, so
//! commits happen in block order and the producer runs at most two chunks
//! ahead of the commit (one queued, one being fetched).
//!
//! Log and timestamp requests share one [`Throttle`] and the same bounded
//! retry policy.

use crate::chain::{
    with_retry, EventDecoder, FetchError, FetchPolicy, LogBatch, LogFetcher, LogSource,
    SkipReason, Throttle,
};
use crate::db::Repository;
use crate::domain::{Address, Trade};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Concurrent `eth_getBlockByNumber` requests per chunk.
const TIMESTAMP_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRequest {
    pub from_block: u64,
    pub to_block: u64,
    /// Stop once this many new trades were inserted.
    pub stop_after: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    TargetReached,
    Cancelled,
}

/// Progress of one backfill run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub chunks_processed: u64,
    pub logs_seen: u64,
    pub trades_inserted: u64,
    pub trades_already_present: u64,
    pub skipped: BTreeMap<SkipReason, u64>,
    /// Upper bound of the last chunk this run committed.
    pub last_committed_block: Option<u64>,
    pub stopped: StopReason,
}

impl BackfillReport {
    fn new() -> Self {
        BackfillReport {
            chunks_processed: 0,
            logs_seen: 0,
            trades_inserted: 0,
            trades_already_present: 0,
            skipped: BTreeMap::new(),
            last_committed_block: None,
            stopped: StopReason::Completed,
        }
    }

    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }

    /// First block a follow-up run should fetch, if this run committed anything.
    pub fn resume_from(&self) -> Option<u64> {
        self.last_committed_block.map(|b| b + 1)
    }
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("backfill stopped: {source}")]
    Fetch {
        source: FetchError,
        report: BackfillReport,
    },
    #[error("backfill stopped, storage error: {source}")]
    Db {
        source: sqlx::Error,
        report: BackfillReport,
    },
}

impl BackfillError {
    /// Progress made before the failure.
    pub fn report(&self) -> &BackfillReport {
        match self {
            BackfillError::Fetch { report, .. } | BackfillError::Db { report, .. } => report,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backfiller {
    source: Arc<dyn LogSource>,
    repo: Arc<Repository>,
    policy: FetchPolicy,
    addresses: Vec<Address>,
    decoder: EventDecoder,
}

impl Backfiller {
    pub fn new(
        source: Arc<dyn LogSource>,
        repo: Arc<Repository>,
        policy: FetchPolicy,
        addresses: Vec<Address>,
    ) -> Self {
        Self {
            source,
            repo,
            policy,
            addresses,
            decoder: EventDecoder::new(),
        }
    }

    /// Start block for a resumed run: one past the stored checkpoint, but never
    /// before `from_block`.
    pub async fn resume_from(&self, from_block: u64) -> Result<u64, sqlx::Error> {
        let start = match self.repo.last_committed_block().await? {
            Some(committed) => from_block.max(committed + 1),
            None => from_block,
        };
        if start > from_block {
            info!(
                "Resuming after checkpoint: requested from {} but starting at {}",
                from_block, start
            );
        }
        Ok(start)
    }

    /// Run the pipeline over `request`, observing `shutdown` between chunks.
    ///
    /// Every chunk is committed together with its checkpoint, so on any
    /// return the store holds a prefix of the range ending at
    /// `last_committed_block`.
    pub async fn run(
        &self,
        request: BackfillRequest,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<BackfillReport, BackfillError> {
        let mut report = BackfillReport::new();
        info!(
            from_block = request.from_block,
            to_block = request.to_block,
            chunk_size = self.policy.chunk_size,
            "Starting backfill"
        );

        let throttle = Arc::new(Throttle::new(self.policy.min_request_interval));
        let mut fetcher = LogFetcher::new(
            self.source.clone(),
            self.policy.clone(),
            self.addresses.clone(),
            self.decoder.topic0().to_string(),
            request.from_block,
            request.to_block,
        )
        .with_throttle(throttle.clone());
        let (tx, mut rx) = mpsc::channel::<Result<LogBatch, FetchError>>(1);
        let producer = tokio::spawn(async move {
            while let Some(item) = fetcher.next_batch().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let mut timestamps: HashMap<u64, Option<i64>> = HashMap::new();
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => {
                    report.stopped = StopReason::Cancelled;
                    info!("Backfill cancelled at chunk boundary");
                    break Ok(());
                }
                next = rx.recv() => next,
            };

            let batch = match next {
                None => break Ok(()),
                Some(Ok(batch)) => batch,
                Some(Err(source)) => {
                    warn!("Backfill halted at {}: {}", source.range(), source);
                    break Err(Failure::Fetch(source));
                }
            };

            let trades = self
                .decode_batch(&batch, &throttle, &mut timestamps, &mut report)
                .await;
            let chunk = match self.repo.upsert_chunk(&trades, batch.range.to).await {
                Ok(chunk) => chunk,
                Err(source) => break Err(Failure::Db(source)),
            };

            report.chunks_processed += 1;
            report.trades_inserted += chunk.inserted;
            report.trades_already_present += chunk.already_present;
            report.last_committed_block = Some(batch.range.to);
            // later batches start above this range
            timestamps.retain(|&block, _| block > batch.range.to);
            info!(
                from_block = batch.range.from,
                to_block = batch.range.to,
                logs = batch.logs.len(),
                inserted = chunk.inserted,
                already_present = chunk.already_present,
                "Committed chunk"
            );

            if request
                .stop_after
                .is_some_and(|target| report.trades_inserted >= target)
            {
                report.stopped = StopReason::TargetReached;
                info!("Trade target reached after block {}", batch.range.to);
                break Ok(());
            }
        };

        drop(rx);
        producer.abort();

        match outcome {
            Ok(()) => {
                info!(
                    chunks = report.chunks_processed,
                    inserted = report.trades_inserted,
                    already_present = report.trades_already_present,
                    skipped = report.skipped_total(),
                    "Backfill finished ({:?})",
                    report.stopped
                );
                Ok(report)
            }
            Err(Failure::Fetch(source)) => Err(BackfillError::Fetch { source, report }),
            Err(Failure::Db(source)) => Err(BackfillError::Db { source, report }),
        }
    }

    async fn decode_batch(
        &self,
        batch: &LogBatch,
        throttle: &Throttle,
        timestamps: &mut HashMap<u64, Option<i64>>,
        report: &mut BackfillReport,
    ) -> Vec<Trade> {
        self.load_timestamps(batch, throttle, timestamps).await;

        let mut trades = Vec::with_capacity(batch.logs.len());
        for log in &batch.logs {
            report.logs_seen += 1;
            let ts = timestamps.get(&log.block_number).copied().flatten();
            match self.decoder.decode(log, ts) {
                Ok(trade) => trades.push(trade),
                Err(skipped) => {
                    debug!(
                        "Skipping log {}:{}: {}",
                        log.transaction_hash, log.log_index, skipped
                    );
                    *report.skipped.entry(skipped.reason).or_insert(0) += 1;
                }
            }
        }
        trades
    }

    /// Fill the timestamp cache for every block in the batch.
    ///
    /// Each lookup is throttled and retried like a log request. A block whose
    /// lookup still fails is cached as None; its trades are stored without a
    /// timestamp and a later run over the same range fills it in.
    async fn load_timestamps(
        &self,
        batch: &LogBatch,
        throttle: &Throttle,
        cache: &mut HashMap<u64, Option<i64>>,
    ) {
        let missing: BTreeSet<u64> = batch
            .logs
            .iter()
            .map(|log| log.block_number)
            .filter(|block| !cache.contains_key(block))
            .collect();

        let fetched: Vec<(u64, Option<i64>)> = stream::iter(missing)
            .map(|block| async move {
                let what = format!("block_timestamp {}", block);
                let source = &self.source;
                match with_retry(&self.policy, throttle, &what, move || {
                    source.block_timestamp(block)
                })
                .await
                {
                    Ok(ts) => (block, ts),
                    Err((e, attempts)) => {
                        warn!(
                            "No timestamp for block {} after {} attempt(s): {}",
                            block, attempts, e
                        );
                        (block, None)
                    }
                }
            })
            .buffered(TIMESTAMP_CONCURRENCY)
            .collect()
            .await;
        cache.extend(fetched);
    }
}

enum Failure {
    Fetch(FetchError),
    Db(sqlx::Error),
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
