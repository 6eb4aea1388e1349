use super::{MarketMetadata, MetadataError};
use crate::db::Repository;
use crate::domain::{Market, MarketId, TokenMap};
use async_trait::async_trait;
use std::sync::Arc;

/// Reads the `markets` and `token_map` tables maintained by the sync job.
#[derive(Debug, Clone)]
pub struct SqliteMarketMetadata {
    repo: Arc<Repository>,
}

impl SqliteMarketMetadata {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl MarketMetadata for SqliteMarketMetadata {
    async fn token_map(&self) -> Result<TokenMap, MetadataError> {
        Ok(self.repo.load_token_map().await?)
    }

    async fn market(&self, id: &MarketId) -> Result<Option<Market>, MetadataError> {
        Ok(self.repo.load_market(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::{TokenId, TokenMapping};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_what_sync_job_wrote() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db").to_string_lossy().to_string();
        let repo = Arc::new(Repository::new(init_db(&db_path).await.unwrap()));

        let market = Market::resolved(MarketId::new("m1"), TokenId::new("7"))
            .with_question("Will it rain?");
        repo.upsert_market(&market).await.unwrap();
        repo.upsert_token_mapping(&TokenMapping::new(TokenId::new("7"), MarketId::new("m1")))
            .await
            .unwrap();
        repo.upsert_token_mapping(&TokenMapping::new(TokenId::new("8"), MarketId::new("m2")))
            .await
            .unwrap();

        let provider = SqliteMarketMetadata::new(repo);
        let map = provider.token_map().await.unwrap();
        assert_eq!(map.len(), 2);

        let markets = provider.markets_for(&map).await.unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[&MarketId::new("m1")], market);
        assert!(provider.market(&MarketId::new("m2")).await.unwrap().is_none());
    }
}
