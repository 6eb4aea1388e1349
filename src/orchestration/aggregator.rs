//! Full rebuild of the derived tables from stored trades and market metadata.

use crate::db::{DerivedCounts, Repository};
use crate::engine::{aggregate, resolve_markets, AggregationInconsistent, AggregationSettings};
use crate::metadata::{MarketMetadata, MetadataError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Outcome of one `recompute`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationReport {
    pub markets_resolved: u64,
    pub markets_unresolved: u64,
    /// Mapped markets the provider does not know.
    pub markets_missing: u64,
    /// Resolved markets skipped because their metadata contradicts itself.
    pub flagged: Vec<AggregationInconsistent>,
    pub fills_considered: u64,
    pub counts: DerivedCounts,
    /// SHA-256 of the derived tables after the rewrite.
    pub digest: String,
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Single-flight recomputation of realized PnL, rollups and tags.
#[derive(Debug)]
pub struct Aggregator {
    repo: Arc<Repository>,
    metadata: Arc<dyn MarketMetadata>,
    settings: AggregationSettings,
    lock: Mutex<()>,
}

impl Aggregator {
    pub fn new(
        repo: Arc<Repository>,
        metadata: Arc<dyn MarketMetadata>,
        settings: AggregationSettings,
    ) -> Self {
        Self {
            repo,
            metadata,
            settings,
            lock: Mutex::new(()),
        }
    }

    /// Recompute every derived table and swap the new version in atomically.
    ///
    /// Concurrent callers are serialized. With unchanged trades and metadata
    /// the resulting tables, and so the digest, are identical.
    pub async fn recompute(&self) -> Result<AggregationReport, AggregationError> {
        let _guard = self.lock.lock().await;

        let token_map = self.metadata.token_map().await?;
        let markets = self.metadata.markets_for(&token_map).await?;
        let resolution = resolve_markets(&token_map, &markets, &self.settings);
        for flagged in &resolution.flagged {
            warn!(
                "Skipping market {}: {}",
                flagged.market_id, flagged.reason
            );
        }

        let fills = self
            .repo
            .settlement_fills_for_tokens(&resolution.settleable_tokens)
            .await?;
        let output = aggregate(&fills, &token_map, &resolution, &self.settings);

        let counts = self
            .repo
            .replace_derived_tables(&output.pnl, &output.stats, &output.tags)
            .await?;
        let digest = self.repo.derived_digest().await?;

        info!(
            resolved = resolution.winners.len(),
            unresolved = resolution.unresolved,
            missing = resolution.missing,
            flagged = resolution.flagged.len(),
            fills = output.fills_considered,
            users = counts.user_stats,
            "Aggregation finished"
        );

        Ok(AggregationReport {
            markets_resolved: resolution.winners.len() as u64,
            markets_unresolved: resolution.unresolved,
            markets_missing: resolution.missing,
            flagged: resolution.flagged,
            fills_considered: output.fills_considered,
            counts,
            digest,
        })
    }
}
