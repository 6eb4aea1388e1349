//! Derived table operations: the aggregation output.

use crate::domain::{Address, Decimal, MarketId, Tag, UserMarketPnl, UserStats, UserTag};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

use super::{bad_column, Repository};

/// Row counts of the derived tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivedCounts {
    pub user_market_pnl: u64,
    pub user_stats: u64,
    pub user_tags: u64,
}

fn decimal(row: &SqliteRow, column: &str) -> Result<Decimal, sqlx::Error> {
    let value: String = row.try_get(column)?;
    Decimal::from_str(&value).map_err(|_| bad_column(column, &value))
}

fn opt_decimal(row: &SqliteRow, column: &str) -> Result<Option<Decimal>, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    value
        .map(|v| Decimal::from_str(&v).map_err(|_| bad_column(column, &v)))
        .transpose()
}

fn pnl_from_row(row: &SqliteRow) -> Result<UserMarketPnl, sqlx::Error> {
    Ok(UserMarketPnl {
        user: Address::new(row.try_get::<String, _>("user")?),
        market_id: MarketId::new(row.try_get::<String, _>("market_id")?),
        realized_pnl: decimal(row, "realized_pnl")?,
        cost: decimal(row, "cost")?,
        proceeds: decimal(row, "proceeds")?,
        settlement: decimal(row, "settlement")?,
        volume: decimal(row, "volume")?,
        trade_count: row.try_get::<i64, _>("trade_count")? as u64,
        roi: opt_decimal(row, "roi")?,
        win: row.try_get::<i64, _>("win")? != 0,
    })
}

fn stats_from_row(row: &SqliteRow) -> Result<UserStats, sqlx::Error> {
    Ok(UserStats {
        user: Address::new(row.try_get::<String, _>("user")?),
        markets_traded: row.try_get::<i64, _>("markets_traded")? as u64,
        wins: row.try_get::<i64, _>("wins")? as u64,
        losses: row.try_get::<i64, _>("losses")? as u64,
        win_rate: opt_decimal(row, "win_rate")?,
        total_realized_pnl: decimal(row, "total_realized_pnl")?,
        total_cost: decimal(row, "total_cost")?,
        roi: opt_decimal(row, "roi")?,
        total_volume: decimal(row, "total_volume")?,
        trade_count: row.try_get::<i64, _>("trade_count")? as u64,
        max_trade_usd: decimal(row, "max_trade_usd")?,
        first_seen_block: row
            .try_get::<Option<i64>, _>("first_seen_block")?
            .map(|b| b as u64),
        last_seen_block: row
            .try_get::<Option<i64>, _>("last_seen_block")?
            .map(|b| b as u64),
        first_seen_ts: row.try_get("first_seen_ts")?,
        last_seen_ts: row.try_get("last_seen_ts")?,
    })
}

fn canonical(d: &Decimal) -> String {
    d.to_canonical_string()
}

fn canonical_opt(d: &Option<Decimal>) -> Option<String> {
    d.as_ref().map(canonical)
}

impl Repository {
    /// Replace all derived tables with a new version in one transaction.
    ///
    /// Readers see either the previous version or this one, never a mix.
    ///
    /// # Errors
    /// Returns an error if the transaction fails; the previous version stays.
    pub async fn replace_derived_tables(
        &self,
        pnl: &[UserMarketPnl],
        stats: &[UserStats],
        tags: &[UserTag],
    ) -> Result<DerivedCounts, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM user_market_pnl")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_stats").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM user_tags").execute(&mut *tx).await?;

        for row in pnl {
            sqlx::query(
                r#"
                INSERT INTO user_market_pnl (
                    user, market_id, realized_pnl, cost, proceeds, settlement,
                    volume, trade_count, roi, win
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.user.as_str())
            .bind(row.market_id.as_str())
            .bind(canonical(&row.realized_pnl))
            .bind(canonical(&row.cost))
            .bind(canonical(&row.proceeds))
            .bind(canonical(&row.settlement))
            .bind(canonical(&row.volume))
            .bind(row.trade_count as i64)
            .bind(canonical_opt(&row.roi))
            .bind(row.win as i64)
            .execute(&mut *tx)
            .await?;
        }

        for row in stats {
            sqlx::query(
                r#"
                INSERT INTO user_stats (
                    user, markets_traded, wins, losses, win_rate, total_realized_pnl,
                    total_cost, roi, total_volume, trade_count, max_trade_usd,
                    first_seen_block, last_seen_block, first_seen_ts, last_seen_ts
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.user.as_str())
            .bind(row.markets_traded as i64)
            .bind(row.wins as i64)
            .bind(row.losses as i64)
            .bind(canonical_opt(&row.win_rate))
            .bind(canonical(&row.total_realized_pnl))
            .bind(canonical(&row.total_cost))
            .bind(canonical_opt(&row.roi))
            .bind(canonical(&row.total_volume))
            .bind(row.trade_count as i64)
            .bind(canonical(&row.max_trade_usd))
            .bind(row.first_seen_block.map(|b| b as i64))
            .bind(row.last_seen_block.map(|b| b as i64))
            .bind(row.first_seen_ts)
            .bind(row.last_seen_ts)
            .execute(&mut *tx)
            .await?;
        }

        for row in tags {
            sqlx::query("INSERT INTO user_tags (user, tag) VALUES (?, ?)")
                .bind(row.user.as_str())
                .bind(row.tag.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(DerivedCounts {
            user_market_pnl: pnl.len() as u64,
            user_stats: stats.len() as u64,
            user_tags: tags.len() as u64,
        })
    }

    /// All per-market PnL rows, ordered by (user, market).
    ///
    /// # Errors
    /// Returns an error if the query fails or a row does not decode.
    pub async fn query_user_market_pnl(&self) -> Result<Vec<UserMarketPnl>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT user, market_id, realized_pnl, cost, proceeds, settlement,
                   volume, trade_count, roi, win
            FROM user_market_pnl
            ORDER BY user ASC, market_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pnl_from_row).collect()
    }

    /// Per-market PnL rows for one user.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row does not decode.
    pub async fn query_user_markets(
        &self,
        user: &Address,
    ) -> Result<Vec<UserMarketPnl>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT user, market_id, realized_pnl, cost, proceeds, settlement,
                   volume, trade_count, roi, win
            FROM user_market_pnl
            WHERE user = ?
            ORDER BY market_id ASC
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pnl_from_row).collect()
    }

    /// All user stats, ordered by user.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row does not decode.
    pub async fn query_user_stats(&self) -> Result<Vec<UserStats>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT user, markets_traded, wins, losses, win_rate, total_realized_pnl,
                   total_cost, roi, total_volume, trade_count, max_trade_usd,
                   first_seen_block, last_seen_block, first_seen_ts, last_seen_ts
            FROM user_stats
            ORDER BY user ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(stats_from_row).collect()
    }

    /// Stats for a single user.
    ///
    /// # Errors
    /// Returns an error if the query fails or the row does not decode.
    pub async fn get_user_stats(&self, user: &Address) -> Result<Option<UserStats>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT user, markets_traded, wins, losses, win_rate, total_realized_pnl,
                   total_cost, roi, total_volume, trade_count, max_trade_usd,
                   first_seen_block, last_seen_block, first_seen_ts, last_seen_ts
            FROM user_stats
            WHERE user = ?
            "#,
        )
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stats_from_row).transpose()
    }

    /// All tags, ordered by (user, tag).
    ///
    /// # Errors
    /// Returns an error if the query fails or a tag is unknown.
    pub async fn query_user_tags(&self) -> Result<Vec<UserTag>, sqlx::Error> {
        let rows = sqlx::query("SELECT user, tag FROM user_tags ORDER BY user ASC, tag ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let tag: String = row.try_get("tag")?;
                Ok(UserTag {
                    user: Address::new(row.try_get::<String, _>("user")?),
                    tag: Tag::from_str(&tag).map_err(|_| bad_column("tag", &tag))?,
                })
            })
            .collect()
    }

    /// Current derived-table row counts.
    ///
    /// # Errors
    /// Returns an error if a query fails.
    pub async fn derived_counts(&self) -> Result<DerivedCounts, sqlx::Error> {
        Ok(DerivedCounts {
            user_market_pnl: self.count_rows("user_market_pnl").await?,
            user_stats: self.count_rows("user_stats").await?,
            user_tags: self.count_rows("user_tags").await?,
        })
    }

    async fn count_rows(&self, table: &str) -> Result<u64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", table);
        let n: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(n as u64)
    }

    /// SHA-256 over the canonical contents of all derived tables.
    ///
    /// Equal digests mean byte-identical derived tables.
    ///
    /// # Errors
    /// Returns an error if a query fails.
    pub async fn derived_digest(&self) -> Result<String, sqlx::Error> {
        let mut hasher = Sha256::new();

        hasher.update(b"user_market_pnl\n");
        for row in self.query_user_market_pnl().await? {
            hasher.update(
                format!(
                    "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
                    row.user,
                    row.market_id,
                    canonical(&row.realized_pnl),
                    canonical(&row.cost),
                    canonical(&row.proceeds),
                    canonical(&row.settlement),
                    canonical(&row.volume),
                    row.trade_count,
                    canonical_opt(&row.roi).unwrap_or_default(),
                    row.win
                )
                .as_bytes(),
            );
        }

        hasher.update(b"user_stats\n");
        for row in self.query_user_stats().await? {
            hasher.update(
                format!(
                    "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{:?}|{:?}|{:?}|{:?}\n",
                    row.user,
                    row.markets_traded,
                    row.wins,
                    row.losses,
                    canonical_opt(&row.win_rate).unwrap_or_default(),
                    canonical(&row.total_realized_pnl),
                    canonical(&row.total_cost),
                    canonical_opt(&row.roi).unwrap_or_default(),
                    canonical(&row.total_volume),
                    row.trade_count,
                    canonical(&row.max_trade_usd),
                    row.first_seen_block,
                    row.last_seen_block,
                    row.first_seen_ts,
                    row.last_seen_ts
                )
                .as_bytes(),
            );
        }

        hasher.update(b"user_tags\n");
        for row in self.query_user_tags().await? {
            hasher.update(format!("{}|{}\n", row.user, row.tag).as_bytes());
        }

        Ok(hex::encode(hasher.finalize()))
    }
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

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn pnl_row(user: &str, market: &str, pnl: &str) -> UserMarketPnl {
        UserMarketPnl {
            user: Address::new(user),
            market_id: MarketId::new(market),
            realized_pnl: d(pnl),
            cost: d("4"),
            proceeds: d("0"),
            settlement: d("10"),
            volume: d("4"),
            trade_count: 1,
            roi: Some(d("1.5")),
            win: true,
        }
    }

    #[tokio::test]
    async fn test_replace_swaps_whole_tables() {
        let (_dir, repo) = setup().await;
        let first = vec![pnl_row("0xa", "m1", "6"), pnl_row("0xb", "m1", "6")];
        let tags = vec![UserTag {
            user: Address::new("0xa"),
            tag: Tag::Whale,
        }];
        repo.replace_derived_tables(&first, &[], &tags).await.unwrap();
        assert_eq!(repo.derived_counts().await.unwrap().user_market_pnl, 2);

        let second = vec![pnl_row("0xc", "m2", "1")];
        repo.replace_derived_tables(&second, &[], &[]).await.unwrap();
        let rows = repo.query_user_market_pnl().await.unwrap();
        assert_eq!(rows, second);
        assert!(repo.query_user_tags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_digest_tracks_contents() {
        let (_dir, repo) = setup().await;
        let rows = vec![pnl_row("0xa", "m1", "6")];
        repo.replace_derived_tables(&rows, &[], &[]).await.unwrap();
        let first = repo.derived_digest().await.unwrap();
        repo.replace_derived_tables(&rows, &[], &[]).await.unwrap();
        assert_eq!(repo.derived_digest().await.unwrap(), first);

        let changed = vec![pnl_row("0xa", "m1", "6.5")];
        repo.replace_derived_tables(&changed, &[], &[]).await.unwrap();
        assert_ne!(repo.derived_digest().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_stats_round_trip() {
        let (_dir, repo) = setup().await;
        let mut stats = UserStats::empty(Address::new("0xa"));
        stats.markets_traded = 2;
        stats.wins = 1;
        stats.losses = 1;
        stats.win_rate = Some(d("0.5"));
        stats.total_realized_pnl = d("-1.25");
        stats.first_seen_block = Some(10);
        stats.last_seen_ts = Some(1_700_000_000);
        repo.replace_derived_tables(&[], std::slice::from_ref(&stats), &[])
            .await
            .unwrap();
        assert_eq!(
            repo.get_user_stats(&Address::new("0xa")).await.unwrap(),
            Some(stats)
        );
    }
}
