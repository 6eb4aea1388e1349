//! Market metadata: which market each outcome token belongs to, and how
//! each market resolved.
//!
//! The indexer only consumes this mapping. It is produced by an external
//! sync job.

use crate::domain::{Market, MarketId, TokenMap};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod mock;
pub mod sqlite;

pub use mock::MockMarketMetadata;
pub use sqlite::SqliteMarketMetadata;

/// Source of token → market mappings and market resolutions.
#[async_trait]
pub trait MarketMetadata: Send + Sync + fmt::Debug {
    /// Every known token and the market it belongs to.
    async fn token_map(&self) -> Result<TokenMap, MetadataError>;

    /// One market, or None if the provider does not know it.
    async fn market(&self, id: &MarketId) -> Result<Option<Market>, MetadataError>;

    /// Markets referenced by `token_map`, keyed by id. Unknown ids are absent.
    async fn markets_for(
        &self,
        token_map: &TokenMap,
    ) -> Result<BTreeMap<MarketId, Market>, MetadataError> {
        let mut markets = BTreeMap::new();
        for mapping in token_map.values() {
            if markets.contains_key(&mapping.market_id) {
                continue;
            }
            if let Some(market) = self.market(&mapping.market_id).await? {
                markets.insert(mapping.market_id.clone(), market);
            }
        }
        Ok(markets)
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Metadata storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("Metadata unavailable: {0}")]
    Unavailable(String),
}
