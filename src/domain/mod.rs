//! Domain types and determinism layer for the fill indexer.
//!
//! This module provides:
//! - Lossless numeric handling via the Decimal wrapper
//! - Primitives: BlockNumber, Address, TokenId, MarketId, Side
//! - Trade, market metadata and derived statistics types
//! - Stable chain ordering helper for deterministic processing

pub mod decimal;
pub mod market;
pub mod ordering;
pub mod primitives;
pub mod stats;
pub mod trade;

pub use decimal::Decimal;
pub use market::{Market, ResolutionStatus, TokenMap, TokenMapping, WinnerConfidence};
pub use ordering::{sort_chain_order, ChainOrderKey, ChainOrdered};
pub use primitives::{Address, BlockNumber, MarketId, Side, TokenId};
pub use stats::{Tag, UserMarketPnl, UserStats, UserTag, RATIO_DP};
pub use trade::{FillProof, InferredFields, Trade, TradeKey, AMOUNT_DECIMALS};
