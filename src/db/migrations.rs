//! Opening the index database and bringing its schema up to date.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("schema.sql");
const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) the SQLite database at `db_path` and apply the schema.
pub async fn init_db(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    let applied = apply_schema(&pool).await?;
    info!(path = db_path, statements = applied, "index database ready");
    Ok(pool)
}

/// Run every statement of schema.sql in one transaction.
///
/// Statements are `IF NOT EXISTS`, so applying to an existing database
/// changes nothing. Returns the number of statements executed.
async fn apply_schema(pool: &SqlitePool) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut applied = 0;
    for statement in schema_statements() {
        sqlx::query(statement).execute(&mut *tx).await?;
        applied += 1;
    }
    tx.commit().await?;
    debug!(applied, "schema applied");
    Ok(applied)
}

fn schema_statements() -> impl Iterator<Item = &'static str> {
    SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty())
}
