pub mod chain;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod orchestration;

pub use chain::{EventDecoder, JsonRpcLogSource, LogFetcher, LogSource, MockLogSource};
pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{Address, Decimal, Market, MarketId, Side, Tag, TokenId, Trade};
pub use error::AppError;
pub use metadata::{MarketMetadata, MockMarketMetadata, SqliteMarketMetadata};
pub use orchestration::{Aggregator, Backfiller};
