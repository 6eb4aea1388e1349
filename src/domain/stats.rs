//! Derived per-user results: market PnL rows, aggregate stats, tags.

use crate::domain::{Address, Decimal, MarketId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Decimal places kept on ratios so stored values are stable.
pub const RATIO_DP: u32 = 12;

/// Realized result of one user in one resolved market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMarketPnl {
    pub user: Address,
    pub market_id: MarketId,
    /// cash flows + settlement value.
    pub realized_pnl: Decimal,
    /// Collateral spent buying.
    pub cost: Decimal,
    /// Collateral received selling.
    pub proceeds: Decimal,
    /// Value of the winning-token position at settlement.
    pub settlement: Decimal,
    /// Collateral traded in either direction.
    pub volume: Decimal,
    pub trade_count: u64,
    /// realized_pnl / cost, None when nothing was spent.
    pub roi: Option<Decimal>,
    pub win: bool,
}

/// Aggregate statistics for one user across resolved markets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub user: Address,
    pub markets_traded: u64,
    pub wins: u64,
    pub losses: u64,
    /// wins / markets_traded, None for zero markets.
    pub win_rate: Option<Decimal>,
    pub total_realized_pnl: Decimal,
    pub total_cost: Decimal,
    /// total_realized_pnl / total_cost, None when nothing was spent.
    pub roi: Option<Decimal>,
    pub total_volume: Decimal,
    pub trade_count: u64,
    pub max_trade_usd: Decimal,
    pub first_seen_block: Option<u64>,
    pub last_seen_block: Option<u64>,
    pub first_seen_ts: Option<i64>,
    pub last_seen_ts: Option<i64>,
}

impl UserStats {
    pub fn empty(user: Address) -> Self {
        UserStats {
            user,
            markets_traded: 0,
            wins: 0,
            losses: 0,
            win_rate: None,
            total_realized_pnl: Decimal::zero(),
            total_cost: Decimal::zero(),
            roi: None,
            total_volume: Decimal::zero(),
            trade_count: 0,
            max_trade_usd: Decimal::zero(),
            first_seen_block: None,
            last_seen_block: None,
            first_seen_ts: None,
            last_seen_ts: None,
        }
    }
}

/// Behavioral tag attached to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tag {
    HighVolume,
    Whale,
    SmartMoney,
    DiamondHands,
    Contra,
    Directional,
}

impl Tag {
    /// Rule evaluation order.
    pub const ALL: [Tag; 6] = [
        Tag::HighVolume,
        Tag::Whale,
        Tag::SmartMoney,
        Tag::DiamondHands,
        Tag::Contra,
        Tag::Directional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::HighVolume => "high-volume",
            Tag::Whale => "whale",
            Tag::SmartMoney => "smart-money",
            Tag::DiamondHands => "diamond-hands",
            Tag::Contra => "contra",
            Tag::Directional => "directional",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Tag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tag::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown tag: {}", s))
    }
}

/// A tag assigned to a user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserTag {
    pub user: Address,
    pub tag: Tag,
}
