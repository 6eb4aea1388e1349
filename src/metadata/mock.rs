//! In-memory metadata provider for tests.

use super::{MarketMetadata, MetadataError};
use crate::domain::{Market, MarketId, TokenId, TokenMap, TokenMapping};
use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct MockMarketMetadata {
    tokens: TokenMap,
    markets: BTreeMap<MarketId, Market>,
    unavailable: bool,
}

impl MockMarketMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a market together with its outcome tokens, in outcome order.
    pub fn with_market(mut self, market: Market, tokens: &[&str]) -> Self {
        for (index, token) in tokens.iter().enumerate() {
            let token_id = TokenId::new(*token);
            let mut mapping = TokenMapping::new(token_id.clone(), market.id.clone());
            mapping.outcome_index = Some(index as i64);
            self.tokens.insert(token_id, mapping);
        }
        self.markets.insert(market.id.clone(), market);
        self
    }

    /// Map a token to a market the provider knows nothing else about.
    pub fn with_orphan_token(mut self, token: &str, market_id: &str) -> Self {
        let token_id = TokenId::new(token);
        self.tokens.insert(
            token_id.clone(),
            TokenMapping::new(token_id, MarketId::new(market_id)),
        );
        self
    }

    /// Every call fails.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    fn check(&self) -> Result<(), MetadataError> {
        if self.unavailable {
            return Err(MetadataError::Unavailable("mock provider offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketMetadata for MockMarketMetadata {
    async fn token_map(&self) -> Result<TokenMap, MetadataError> {
        self.check()?;
        Ok(self.tokens.clone())
    }

    async fn market(&self, id: &MarketId) -> Result<Option<Market>, MetadataError> {
        self.check()?;
        Ok(self.markets.get(id).cloned())
    }
}
