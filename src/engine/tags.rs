//! Threshold rules that turn per-user statistics into behavioral tags.

use crate::domain::{Decimal, Tag, UserMarketPnl, UserStats};
use rust_decimal::Decimal as RustDecimal;

/// Tag thresholds. Each rule is evaluated independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRules {
    /// high-volume: trade_count >= this ...
    pub high_volume_min_trades: u64,
    /// ... and markets_traded >= this.
    pub high_volume_min_markets: u64,
    /// whale: largest single fill >= this many USD.
    pub whale_min_trade_usd: Decimal,
    /// smart-money: win_rate > this ...
    pub smart_money_min_win_rate: Decimal,
    /// ... and markets_traded > this.
    pub smart_money_min_markets: u64,
    /// contra: roi < this.
    pub contra_max_roi: Decimal,
    /// directional: markets_traded >= this, one side per market.
    pub directional_min_markets: u64,
}

impl Default for TagRules {
    fn default() -> Self {
        TagRules {
            high_volume_min_trades: 50,
            high_volume_min_markets: 10,
            whale_min_trade_usd: Decimal::from(1000u64),
            smart_money_min_win_rate: Decimal::new(RustDecimal::new(60, 2)),
            smart_money_min_markets: 10,
            contra_max_roi: Decimal::new(RustDecimal::new(-50, 2)),
            directional_min_markets: 3,
        }
    }
}

/// Everything the rules look at for one user.
#[derive(Debug, Clone, Copy)]
pub struct UserProfile<'a> {
    pub stats: &'a UserStats,
    pub markets: &'a [UserMarketPnl],
    /// The user only bought or only sold within every market.
    pub one_sided_everywhere: bool,
}

impl TagRules {
    /// Tags for one user, in `Tag::ALL` order.
    pub fn evaluate(&self, profile: &UserProfile<'_>) -> Vec<Tag> {
        Tag::ALL
            .iter()
            .copied()
            .filter(|tag| self.matches(*tag, profile))
            .collect()
    }

    fn matches(&self, tag: Tag, p: &UserProfile<'_>) -> bool {
        let s = p.stats;
        match tag {
            Tag::HighVolume => {
                s.trade_count >= self.high_volume_min_trades
                    && s.markets_traded >= self.high_volume_min_markets
            }
            Tag::Whale => s.max_trade_usd >= self.whale_min_trade_usd,
            Tag::SmartMoney => {
                s.win_rate
                    .is_some_and(|rate| rate > self.smart_money_min_win_rate)
                    && s.markets_traded > self.smart_money_min_markets
            }
            Tag::DiamondHands => p.markets.iter().any(|m| {
                m.cost.is_positive() && m.proceeds.is_zero() && m.settlement.is_positive()
            }),
            Tag::Contra => s.roi.is_some_and(|roi| roi < self.contra_max_roi),
            Tag::Directional => {
                s.markets_traded >= self.directional_min_markets && p.one_sided_everywhere
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, MarketId};

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn market(cost: &str, proceeds: &str, settlement: &str) -> UserMarketPnl {
        UserMarketPnl {
            user: Address::new("0xa"),
            market_id: MarketId::new("m"),
            realized_pnl: d(settlement) + d(proceeds) - d(cost),
            cost: d(cost),
            proceeds: d(proceeds),
            settlement: d(settlement),
            volume: d(cost) + d(proceeds),
            trade_count: 1,
            roi: None,
            win: true,
        }
    }

    fn eval(stats: &UserStats, markets: &[UserMarketPnl], one_sided: bool) -> Vec<Tag> {
        TagRules::default().evaluate(&UserProfile {
            stats,
            markets,
            one_sided_everywhere: one_sided,
        })
    }

    #[test]
    fn test_no_tags_for_quiet_user() {
        let stats = UserStats::empty(Address::new("0xa"));
        assert!(eval(&stats, &[], true).is_empty());
    }

    #[test]
    fn test_whale_boundary_is_inclusive() {
        let mut stats = UserStats::empty(Address::new("0xa"));
        stats.max_trade_usd = d("999.999999");
        assert!(!eval(&stats, &[], false).contains(&Tag::Whale));
        stats.max_trade_usd = d("1000");
        assert_eq!(eval(&stats, &[], false), vec![Tag::Whale]);
    }

    #[test]
    fn test_smart_money_needs_more_than_ten_markets() {
        let mut stats = UserStats::empty(Address::new("0xa"));
        stats.win_rate = Some(d("0.7"));
        stats.markets_traded = 10;
        assert!(!eval(&stats, &[], false).contains(&Tag::SmartMoney));
        stats.markets_traded = 11;
        assert!(eval(&stats, &[], false).contains(&Tag::SmartMoney));
        stats.win_rate = Some(d("0.6"));
        assert!(!eval(&stats, &[], false).contains(&Tag::SmartMoney));
    }

    #[test]
    fn test_diamond_hands_and_contra() {
        let mut stats = UserStats::empty(Address::new("0xa"));
        stats.roi = Some(d("-0.75"));
        let held = vec![market("4", "0", "10")];
        let tags = eval(&stats, &held, false);
        assert_eq!(tags, vec![Tag::DiamondHands, Tag::Contra]);

        let traded_out = vec![market("4", "5", "0")];
        assert!(!eval(&stats, &traded_out, false).contains(&Tag::DiamondHands));
    }

    #[test]
    fn test_high_volume_and_directional() {
        let mut stats = UserStats::empty(Address::new("0xa"));
        stats.trade_count = 50;
        stats.markets_traded = 10;
        let tags = eval(&stats, &[], true);
        assert_eq!(tags, vec![Tag::HighVolume, Tag::Directional]);

        stats.markets_traded = 2;
        assert!(eval(&stats, &[], true).is_empty());
    }
}
