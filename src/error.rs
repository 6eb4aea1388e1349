use crate::chain::RpcError;
use crate::config::ConfigError;
use crate::orchestration::{AggregationError, BackfillError};
use thiserror::Error;

/// Top-level error for the command-line entry points.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Backfill(#[from] BackfillError),
    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::BadRequest(_) => 2,
            _ => 1,
        }
    }
}
