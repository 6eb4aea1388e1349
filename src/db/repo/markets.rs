//! Market metadata operations for the repository.
//!
//! These tables are owned by the external market sync job; the indexer only
//! reads them during aggregation.

use crate::domain::{Market, MarketId, ResolutionStatus, TokenId, TokenMap, TokenMapping, WinnerConfidence};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

use super::{bad_column, Repository};

fn market_from_row(row: &SqliteRow) -> Result<Market, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let confidence: String = row.try_get("winner_confidence")?;
    Ok(Market {
        id: MarketId::new(row.try_get::<String, _>("market_id")?),
        question: row.try_get("question")?,
        slug: row.try_get("slug")?,
        status: ResolutionStatus::from_str(&status).map_err(|_| bad_column("status", &status))?,
        winning_token_id: row
            .try_get::<Option<String>, _>("winning_token_id")?
            .map(TokenId::new),
        winner_confidence: WinnerConfidence::from_str(&confidence)
            .map_err(|_| bad_column("winner_confidence", &confidence))?,
    })
}

impl Repository {
    /// Insert or replace a market row.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn upsert_market(&self, market: &Market) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO markets (
                market_id, question, slug, status, winning_token_id,
                winner_confidence, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(market_id) DO UPDATE SET
                question = excluded.question,
                slug = excluded.slug,
                status = excluded.status,
                winning_token_id = excluded.winning_token_id,
                winner_confidence = excluded.winner_confidence,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(market.id.as_str())
        .bind(market.question.as_deref())
        .bind(market.slug.as_deref())
        .bind(market.status.as_str())
        .bind(market.winning_token_id.as_ref().map(|t| t.as_str()))
        .bind(market.winner_confidence.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert or replace a token → market mapping.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn upsert_token_mapping(&self, mapping: &TokenMapping) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO token_map (token_id, market_id, outcome_index, outcome_label)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(token_id) DO UPDATE SET
                market_id = excluded.market_id,
                outcome_index = excluded.outcome_index,
                outcome_label = excluded.outcome_label
            "#,
        )
        .bind(mapping.token_id.as_str())
        .bind(mapping.market_id.as_str())
        .bind(mapping.outcome_index)
        .bind(mapping.outcome_label.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The full token map.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn load_token_map(&self) -> Result<TokenMap, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT token_id, market_id, outcome_index, outcome_label
            FROM token_map
            ORDER BY token_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map = TokenMap::new();
        for row in rows {
            let token_id = TokenId::new(row.try_get::<String, _>("token_id")?);
            map.insert(
                token_id.clone(),
                TokenMapping {
                    token_id,
                    market_id: MarketId::new(row.try_get::<String, _>("market_id")?),
                    outcome_index: row.try_get("outcome_index")?,
                    outcome_label: row.try_get("outcome_label")?,
                },
            );
        }
        Ok(map)
    }

    /// One market by id.
    ///
    /// # Errors
    /// Returns an error if the query fails or the row does not decode.
    pub async fn load_market(&self, id: &MarketId) -> Result<Option<Market>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT market_id, question, slug, status, winning_token_id, winner_confidence
            FROM markets
            WHERE market_id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(market_from_row).transpose()
    }

    /// Number of markets by status, as (unresolved, resolved).
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn market_counts(&self) -> Result<(u64, u64), sqlx::Error> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM markets GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = (0u64, 0u64);
        for row in rows {
            let status: String = row.try_get("status")?;
            let n = row.try_get::<i64, _>("n")? as u64;
            match status.as_str() {
                "resolved" => counts.1 = n,
                _ => counts.0 += n,
            }
        }
        Ok(counts)
    }
}
