//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `trades.rs` - Trade persistence and chain-ordered reads
//! - `markets.rs` - Market and token-map rows written by the sync job
//! - `derived.rs` - Aggregation output tables and their digest

mod derived;
mod markets;
mod trades;

pub use derived::DerivedCounts;
pub use trades::{ChunkOutcome, UpsertOutcome};

use sqlx::sqlite::{SqliteExecutor, SqlitePool};
use sqlx::Row;

/// index_state key for the upper bound of the last committed backfill chunk.
pub const LAST_COMMITTED_BLOCK: &str = "last_committed_block";

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Highest block whose chunk was fully committed by a backfill.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn last_committed_block(&self) -> Result<Option<u64>, sqlx::Error> {
        let row = sqlx::query("SELECT value FROM index_state WHERE key = ?")
            .bind(LAST_COMMITTED_BLOCK)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("value") as u64))
    }
}

/// Raise a checkpoint. Never moves it backwards, so an overlapping rerun of an
/// older range cannot rewind a later resume point.
pub(crate) async fn advance_checkpoint<'e, E>(
    executor: E,
    key: &str,
    value: u64,
) -> Result<(), sqlx::Error>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO index_state (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = MAX(value, excluded.value),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value as i64)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(executor)
    .await?;
    Ok(())
}

/// Decode error for a stored column that no longer parses.
pub(crate) fn bad_column(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("invalid {} value: {}", column, value).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db").to_string_lossy().to_string();
        let pool = init_db(&db_path).await.unwrap();
        (temp_dir, Repository::new(pool))
    }

    #[tokio::test]
    async fn test_checkpoint_only_moves_forward() {
        let (_dir, repo) = setup().await;
        assert_eq!(repo.last_committed_block().await.unwrap(), None);

        advance_checkpoint(repo.pool(), LAST_COMMITTED_BLOCK, 200)
            .await
            .unwrap();
        advance_checkpoint(repo.pool(), LAST_COMMITTED_BLOCK, 150)
            .await
            .unwrap();
        assert_eq!(repo.last_committed_block().await.unwrap(), Some(200));

        advance_checkpoint(repo.pool(), LAST_COMMITTED_BLOCK, 201)
            .await
            .unwrap();
        assert_eq!(repo.last_committed_block().await.unwrap(), Some(201));
    }
}
