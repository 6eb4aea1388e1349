use crate::domain::{Decimal, Side, TokenId, AMOUNT_DECIMALS};
use std::collections::BTreeMap;

use super::SettlementFill;

/// Position in the chain of a fill as seen by one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeenAt {
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: Option<i64>,
}

impl SeenAt {
    fn of(fill: &SettlementFill) -> Self {
        SeenAt {
            block_number: fill.block_number,
            log_index: fill.log_index,
            block_timestamp: fill.block_timestamp,
        }
    }
}

/// Value of a ledger at market resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Winning-token position valued at 1.0.
    pub settlement: Decimal,
    /// cash + settlement.
    pub realized_pnl: Decimal,
}

/// Cash and token positions of one user in one market.
///
/// Fills must be applied in chain order. Open size is carried to
/// resolution; there is no lot matching.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarketLedger {
    /// Signed collateral flow: BUY subtracts, SELL adds.
    pub cash: Decimal,
    /// Net token position per outcome token.
    pub positions: BTreeMap<TokenId, Decimal>,
    pub cost: Decimal,
    pub proceeds: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
    pub max_trade_usd: Decimal,
    pub bought: bool,
    pub sold: bool,
    pub first_seen: Option<SeenAt>,
    pub last_seen: Option<SeenAt>,
}

impl MarketLedger {
    /// Apply one fill leg from this user's perspective.
    pub fn apply(&mut self, side: Side, fill: &SettlementFill) {
        let notional = (fill.price * fill.size).round_dp(AMOUNT_DECIMALS);
        let position = self.positions.entry(fill.token_id.clone()).or_default();

        match side {
            Side::Buy => {
                self.cash -= notional;
                self.cost += notional;
                *position += fill.size;
                self.bought = true;
            }
            Side::Sell => {
                self.cash += notional;
                self.proceeds += notional;
                *position -= fill.size;
                self.sold = true;
            }
        }

        self.volume += notional;
        self.trade_count += 1;
        if fill.usd_notional > self.max_trade_usd {
            self.max_trade_usd = fill.usd_notional;
        }

        let seen = SeenAt::of(fill);
        if self.first_seen.is_none() {
            self.first_seen = Some(seen);
        }
        self.last_seen = Some(seen);
    }

    /// Net position in one token.
    pub fn position(&self, token: &TokenId) -> Decimal {
        self.positions.get(token).copied().unwrap_or_default()
    }

    /// Value the ledger with `winner` at 1.0 and every other token at 0.0.
    pub fn settle(&self, winner: &TokenId) -> Settlement {
        let settlement = self.position(winner);
        Settlement {
            settlement,
            realized_pnl: self.cash + settlement,
        }
    }

    /// Only bought or only sold in this market.
    pub fn is_one_sided(&self) -> bool {
        !(self.bought && self.sold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Address;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn fill(block: u64, token: &str, side: Side, price: &str, size: &str) -> SettlementFill {
        SettlementFill {
            tx_hash: format!("0x{:x}", block),
            log_index: 0,
            block_number: block,
            block_timestamp: None,
            maker: Address::new("0xmaker"),
            taker: Address::new("0xtaker"),
            token_id: TokenId::new(token),
            side,
            price: d(price),
            size: d(size),
            usd_notional: d(price) * d(size),
        }
    }

    #[test]
    fn test_buy_and_hold_winner() {
        let mut ledger = MarketLedger::default();
        let f = fill(1, "yes", Side::Buy, "0.40", "10");
        ledger.apply(Side::Buy, &f);
        let s = ledger.settle(&TokenId::new("yes"));
        assert_eq!(s.realized_pnl, d("6"));
        assert_eq!(s.settlement, d("10"));
        assert_eq!(ledger.cost, d("4"));
    }

    #[test]
    fn test_buy_loser() {
        let mut ledger = MarketLedger::default();
        ledger.apply(Side::Buy, &fill(1, "no", Side::Buy, "0.30", "10"));
        let s = ledger.settle(&TokenId::new("yes"));
        assert_eq!(s.realized_pnl, d("-3"));
        assert!(s.settlement.is_zero());
    }

    #[test]
    fn test_round_trip_before_resolution() {
        let mut ledger = MarketLedger::default();
        ledger.apply(Side::Buy, &fill(1, "yes", Side::Buy, "0.40", "10"));
        ledger.apply(Side::Sell, &fill(2, "yes", Side::Sell, "0.55", "10"));
        let s = ledger.settle(&TokenId::new("no"));
        assert_eq!(s.realized_pnl, d("1.5"));
        assert!(!ledger.is_one_sided());
        assert_eq!(ledger.trade_count, 2);
        assert_eq!(ledger.first_seen.map(|s| s.block_number), Some(1));
        assert_eq!(ledger.last_seen.map(|s| s.block_number), Some(2));
    }

    #[test]
    fn test_short_winner_loses() {
        let mut ledger = MarketLedger::default();
        ledger.apply(Side::Sell, &fill(1, "yes", Side::Buy, "0.40", "10"));
        let s = ledger.settle(&TokenId::new("yes"));
        assert_eq!(s.realized_pnl, d("-6"));
        assert_eq!(ledger.proceeds, d("4"));
    }
}
