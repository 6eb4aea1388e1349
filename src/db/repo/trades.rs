//! Trade operations for the repository.

use crate::domain::{
    Address, BlockNumber, Decimal, FillProof, Side, TokenId, Trade, AMOUNT_DECIMALS,
};
use crate::engine::SettlementFill;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

use super::{advance_checkpoint, bad_column, Repository, LAST_COMMITTED_BLOCK};

/// Bound parameters per `IN (...)` list; SQLite caps host parameters.
const IN_BATCH: usize = 500;

/// Result of inserting one trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Result of committing one backfill chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub inserted: u64,
    pub already_present: u64,
}

const INSERT_TRADE: &str = r#"
    INSERT INTO trades (
        tx_hash, log_index, block_number, block_timestamp, contract_address,
        maker, taker, token_id, side, price, filled_size, counter_amount, fee,
        usd_notional, proof_json, raw_log_json, created_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(tx_hash, log_index) DO NOTHING
"#;

/// The one column a stored trade may still gain: a timestamp that was
/// unavailable when it was first indexed.
const FILL_MISSING_TIMESTAMP: &str = r#"
    UPDATE trades SET block_timestamp = ?
    WHERE tx_hash = ? AND log_index = ? AND block_timestamp IS NULL
"#;

const TRADE_COLUMNS: &str = r#"
    tx_hash, log_index, block_number, block_timestamp, contract_address,
    maker, taker, token_id, side, price, filled_size, counter_amount, fee,
    usd_notional, proof_json, raw_log_json
"#;

async fn insert_trade(
    conn: &mut SqliteConnection,
    trade: &Trade,
    created_at: i64,
) -> Result<UpsertOutcome, sqlx::Error> {
    let proof_json = trade
        .proof_json()
        .map_err(|e| sqlx::Error::Protocol(format!("proof serialization failed: {}", e)))?;

    let result = sqlx::query(INSERT_TRADE)
        .bind(trade.tx_hash.as_str())
        .bind(trade.log_index as i64)
        .bind(trade.block_number.as_i64())
        .bind(trade.block_timestamp)
        .bind(trade.contract_address.as_str())
        .bind(trade.maker.as_str())
        .bind(trade.taker.as_str())
        .bind(trade.token_id.as_str())
        .bind(trade.side.as_str())
        .bind(trade.price.to_canonical_string())
        .bind(trade.filled_size.to_string())
        .bind(trade.counter_amount.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.usd_notional.to_canonical_string())
        .bind(proof_json)
        .bind(trade.raw_log_json.as_str())
        .bind(created_at)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() > 0 {
        return Ok(UpsertOutcome::Inserted);
    }
    if let Some(ts) = trade.block_timestamp {
        sqlx::query(FILL_MISSING_TIMESTAMP)
            .bind(ts)
            .bind(trade.tx_hash.as_str())
            .bind(trade.log_index as i64)
            .execute(&mut *conn)
            .await?;
    }
    Ok(UpsertOutcome::AlreadyPresent)
}

fn parse_decimal(row: &SqliteRow, column: &str) -> Result<Decimal, sqlx::Error> {
    let value: String = row.try_get(column)?;
    Decimal::from_str(&value).map_err(|_| bad_column(column, &value))
}

fn parse_u128(row: &SqliteRow, column: &str) -> Result<u128, sqlx::Error> {
    let value: String = row.try_get(column)?;
    value.parse::<u128>().map_err(|_| bad_column(column, &value))
}

fn parse_side(row: &SqliteRow) -> Result<Side, sqlx::Error> {
    let value: String = row.try_get("side")?;
    Side::from_str(&value).map_err(|_| bad_column("side", &value))
}

fn trade_from_row(row: &SqliteRow) -> Result<Trade, sqlx::Error> {
    let proof_json: String = row.try_get("proof_json")?;
    let proof: FillProof = serde_json::from_str(&proof_json)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Trade {
        tx_hash: row.try_get("tx_hash")?,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        block_number: BlockNumber::new(row.try_get::<i64, _>("block_number")? as u64),
        block_timestamp: row.try_get("block_timestamp")?,
        contract_address: Address::new(row.try_get::<String, _>("contract_address")?),
        maker: Address::new(row.try_get::<String, _>("maker")?),
        taker: Address::new(row.try_get::<String, _>("taker")?),
        token_id: TokenId::new(row.try_get::<String, _>("token_id")?),
        side: parse_side(row)?,
        price: parse_decimal(row, "price")?,
        filled_size: parse_u128(row, "filled_size")?,
        counter_amount: parse_u128(row, "counter_amount")?,
        fee: parse_u128(row, "fee")?,
        usd_notional: parse_decimal(row, "usd_notional")?,
        proof,
        raw_log_json: row.try_get("raw_log_json")?,
    })
}

fn settlement_fill_from_row(row: &SqliteRow) -> Result<SettlementFill, sqlx::Error> {
    let filled_size = parse_u128(row, "filled_size")?;
    let size = Decimal::from_base_units(filled_size, AMOUNT_DECIMALS)
        .ok_or_else(|| bad_column("filled_size", &filled_size.to_string()))?;

    Ok(SettlementFill {
        tx_hash: row.try_get("tx_hash")?,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_timestamp: row.try_get("block_timestamp")?,
        maker: Address::new(row.try_get::<String, _>("maker")?),
        taker: Address::new(row.try_get::<String, _>("taker")?),
        token_id: TokenId::new(row.try_get::<String, _>("token_id")?),
        side: parse_side(row)?,
        price: parse_decimal(row, "price")?,
        size,
        usd_notional: parse_decimal(row, "usd_notional")?,
    })
}

impl Repository {
    /// Insert a trade idempotently on `(tx_hash, log_index)`.
    ///
    /// A trade already present keeps its stored fields, except that a missing
    /// block timestamp is filled in from `trade`.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn upsert_trade(&self, trade: &Trade) -> Result<UpsertOutcome, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        insert_trade(&mut *conn, trade, chrono::Utc::now().timestamp_millis()).await
    }

    /// Commit a chunk's trades and raise the backfill checkpoint to
    /// `committed_through` in one transaction.
    ///
    /// # Errors
    /// Returns an error if the transaction fails; nothing is committed then.
    pub async fn upsert_chunk(
        &self,
        trades: &[Trade],
        committed_through: u64,
    ) -> Result<ChunkOutcome, sqlx::Error> {
        let created_at = chrono::Utc::now().timestamp_millis();
        let mut outcome = ChunkOutcome::default();
        let mut tx = self.pool.begin().await?;

        for trade in trades {
            match insert_trade(&mut *tx, trade, created_at).await? {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::AlreadyPresent => outcome.already_present += 1,
            }
        }
        advance_checkpoint(&mut *tx, LAST_COMMITTED_BLOCK, committed_through).await?;

        tx.commit().await?;
        Ok(outcome)
    }

    /// Number of stored trades.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_trades(&self) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Highest block number among stored trades.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn max_known_block(&self) -> Result<Option<u64>, sqlx::Error> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(block_number) FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(|b| b as u64))
    }

    /// Stored trades of one transaction, by log index.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row does not decode.
    pub async fn trades_for_tx(&self, tx_hash: &str) -> Result<Vec<Trade>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM trades WHERE tx_hash = ? ORDER BY log_index ASC",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tx_hash.to_ascii_lowercase())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trade_from_row).collect()
    }

    /// Stored trades within a block range in chain order.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row does not decode.
    pub async fn trades_in_range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Trade>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM trades WHERE block_number >= ? AND block_number <= ? \
             ORDER BY block_number ASC, log_index ASC",
            TRADE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(from_block as i64)
            .bind(to_block.min(i64::MAX as u64) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(trade_from_row).collect()
    }

    /// Slim fill rows for the given outcome tokens, in chain order.
    ///
    /// # Errors
    /// Returns an error if a query fails or a row does not decode.
    pub async fn settlement_fills_for_tokens(
        &self,
        token_ids: &[TokenId],
    ) -> Result<Vec<SettlementFill>, sqlx::Error> {
        let mut fills = Vec::new();

        for batch in token_ids.chunks(IN_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                r#"
                SELECT tx_hash, log_index, block_number, block_timestamp, maker, taker,
                       token_id, side, price, filled_size, usd_notional
                FROM trades
                WHERE token_id IN ({})
                "#,
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for token in batch {
                query = query.bind(token.as_str());
            }
            let rows = query.fetch_all(&self.pool).await?;
            for row in &rows {
                fills.push(settlement_fill_from_row(row)?);
            }
        }

        crate::domain::sort_chain_order(&mut fills);
        Ok(fills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::decoder::test_support::order_filled_log;
    use crate::chain::EventDecoder;
    use crate::db::init_db;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db").to_string_lossy().to_string();
        let pool = init_db(&db_path).await.unwrap();
        (temp_dir, Repository::new(pool))
    }

    fn trade(block: u64, log_index: u64, token: u128) -> Trade {
        let log = order_filled_log(block, log_index, 0, token, 4_000_000, 10_000_000);
        EventDecoder::new().decode(&log, Some(1_700_000_000)).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (_dir, repo) = setup().await;
        let t = trade(10, 0, 42);
        assert_eq!(repo.upsert_trade(&t).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(
            repo.upsert_trade(&t).await.unwrap(),
            UpsertOutcome::AlreadyPresent
        );
        assert_eq!(repo.count_trades().await.unwrap(), 1);
        assert_eq!(repo.max_known_block().await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_trade_round_trips_through_storage() {
        let (_dir, repo) = setup().await;
        let t = trade(10, 3, 42);
        repo.upsert_trade(&t).await.unwrap();
        let stored = repo.trades_for_tx(&t.tx_hash).await.unwrap();
        assert_eq!(stored, vec![t]);
    }

    #[tokio::test]
    async fn test_upsert_chunk_counts_and_checkpoints() {
        let (_dir, repo) = setup().await;
        let first = vec![trade(10, 0, 42), trade(11, 0, 42)];
        let outcome = repo.upsert_chunk(&first, 19).await.unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(repo.last_committed_block().await.unwrap(), Some(19));

        let overlap = vec![trade(11, 0, 42), trade(12, 1, 42)];
        let outcome = repo.upsert_chunk(&overlap, 29).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.already_present, 1);
        assert_eq!(repo.count_trades().await.unwrap(), 3);
        assert_eq!(repo.last_committed_block().await.unwrap(), Some(29));
    }

    #[tokio::test]
    async fn test_settlement_fills_in_chain_order() {
        let (_dir, repo) = setup().await;
        for t in [trade(12, 0, 42), trade(10, 5, 7), trade(10, 1, 42), trade(11, 0, 99)] {
            repo.upsert_trade(&t).await.unwrap();
        }
        let fills = repo
            .settlement_fills_for_tokens(&[TokenId::new("42"), TokenId::new("7")])
            .await
            .unwrap();
        let order: Vec<(u64, u64)> = fills.iter().map(|f| (f.block_number, f.log_index)).collect();
        assert_eq!(order, vec![(10, 1), (10, 5), (12, 0)]);
        assert_eq!(fills[0].size.to_canonical_string(), "10");
        assert_eq!(fills[0].price.to_canonical_string(), "0.4");
    }

    #[tokio::test]
    async fn test_trades_in_range() {
        let (_dir, repo) = setup().await;
        for t in [trade(5, 0, 42), trade(6, 0, 42), trade(7, 0, 42)] {
            repo.upsert_trade(&t).await.unwrap();
        }
        let in_range = repo.trades_in_range(6, 7).await.unwrap();
        assert_eq!(in_range.len(), 2);
        assert_eq!(in_range[0].block_number, BlockNumber::new(6));
    }

    #[tokio::test]
    async fn test_reinsert_fills_missing_timestamp_only() {
        let (_dir, repo) = setup().await;
        let log = order_filled_log(10, 0, 0, 42, 4_000_000, 10_000_000);
        let decoder = EventDecoder::new();
        let untimed = decoder.decode(&log, None).unwrap();
        let timed = decoder.decode(&log, Some(1_700_000_010)).unwrap();

        repo.upsert_trade(&untimed).await.unwrap();
        assert_eq!(
            repo.upsert_trade(&timed).await.unwrap(),
            UpsertOutcome::AlreadyPresent
        );
        let stored = repo.trades_for_tx(&timed.tx_hash).await.unwrap();
        assert_eq!(stored, vec![timed.clone()]);

        // a known timestamp is never overwritten
        let other = decoder.decode(&log, Some(1)).unwrap();
        repo.upsert_trade(&other).await.unwrap();
        let stored = repo.trades_for_tx(&timed.tx_hash).await.unwrap();
        assert_eq!(stored[0].block_timestamp, Some(1_700_000_010));
    }
}
