//! Pure computation engine for realized PnL, rollups and tags.
//!
//! Nothing here performs I/O. Given the same fills, token map and markets,
//! `aggregate` returns identical output.

use crate::domain::{
    Address, ChainOrderKey, ChainOrdered, Decimal, Market, MarketId, Side, TokenId, TokenMap,
    UserMarketPnl, UserStats, UserTag, RATIO_DP,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub mod ledger;
pub mod tags;

pub use ledger::{MarketLedger, SeenAt, Settlement};
pub use tags::{TagRules, UserProfile};

/// The fields of a stored trade that aggregation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementFill {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub block_timestamp: Option<i64>,
    pub maker: Address,
    pub taker: Address,
    pub token_id: TokenId,
    /// Taker side.
    pub side: Side,
    pub price: Decimal,
    /// Outcome-token size in whole shares.
    pub size: Decimal,
    pub usd_notional: Decimal,
}

impl ChainOrdered for SettlementFill {
    fn chain_order_key(&self) -> ChainOrderKey {
        ChainOrderKey {
            block_number: self.block_number,
            log_index: self.log_index,
            tx_hash: self.tx_hash.clone(),
        }
    }
}

/// Aggregation knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationSettings {
    /// Never attributed PnL (exchange contracts, the zero address).
    pub excluded_addresses: BTreeSet<Address>,
    /// Treat `inferred` winners as unusable.
    pub require_confirmed_winner: bool,
    pub tag_rules: TagRules,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        let mut excluded: BTreeSet<Address> = crate::chain::DEFAULT_EXCHANGE_ADDRESSES
            .iter()
            .map(Address::new)
            .collect();
        excluded.insert(Address::zero());
        AggregationSettings {
            excluded_addresses: excluded,
            require_confirmed_winner: false,
            tag_rules: TagRules::default(),
        }
    }
}

/// Ways market metadata can contradict itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Inconsistency {
    ResolvedWithoutWinner,
    /// The winning token is not one of the market's tokens.
    WinnerNotInMarket,
    /// Winner present but flagged as unusable.
    NoConfidentWinner,
    /// Winner only inferred while confirmed winners are required.
    UnconfirmedWinner,
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Inconsistency::ResolvedWithoutWinner => "resolved without a winning token",
            Inconsistency::WinnerNotInMarket => "winning token not in the market's token set",
            Inconsistency::NoConfidentWinner => "winner has no confidence",
            Inconsistency::UnconfirmedWinner => "winner is inferred, confirmation required",
        };
        write!(f, "{}", s)
    }
}

/// A resolved market skipped by aggregation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AggregationInconsistent {
    pub market_id: MarketId,
    pub reason: Inconsistency,
}

/// Which markets can be settled, and why the others cannot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketResolution {
    /// Settleable markets and their winning token.
    pub winners: BTreeMap<MarketId, TokenId>,
    /// Tokens mapped to settleable markets.
    pub settleable_tokens: Vec<TokenId>,
    pub unresolved: u64,
    /// Markets referenced by the token map but unknown to the provider.
    pub missing: u64,
    pub flagged: Vec<AggregationInconsistent>,
}

/// Classify every market referenced by the token map.
pub fn resolve_markets(
    token_map: &TokenMap,
    markets: &BTreeMap<MarketId, Market>,
    settings: &AggregationSettings,
) -> MarketResolution {
    let mut tokens_by_market: BTreeMap<&MarketId, Vec<&TokenId>> = BTreeMap::new();
    for mapping in token_map.values() {
        tokens_by_market
            .entry(&mapping.market_id)
            .or_default()
            .push(&mapping.token_id);
    }

    let mut resolution = MarketResolution::default();
    for (market_id, tokens) in tokens_by_market {
        let Some(market) = markets.get(market_id) else {
            resolution.missing += 1;
            continue;
        };
        if !market.is_resolved() {
            resolution.unresolved += 1;
            continue;
        }
        match settleable_winner(market, &tokens, settings) {
            Ok(winner) => {
                resolution
                    .settleable_tokens
                    .extend(tokens.into_iter().cloned());
                resolution.winners.insert(market_id.clone(), winner);
            }
            Err(reason) => resolution.flagged.push(AggregationInconsistent {
                market_id: market_id.clone(),
                reason,
            }),
        }
    }
    resolution.settleable_tokens.sort();
    resolution
}

fn settleable_winner(
    market: &Market,
    tokens: &[&TokenId],
    settings: &AggregationSettings,
) -> Result<TokenId, Inconsistency> {
    use crate::domain::WinnerConfidence;

    let winner = market
        .winning_token_id
        .as_ref()
        .ok_or(Inconsistency::ResolvedWithoutWinner)?;
    match market.winner_confidence {
        WinnerConfidence::None => return Err(Inconsistency::NoConfidentWinner),
        WinnerConfidence::Inferred if settings.require_confirmed_winner => {
            return Err(Inconsistency::UnconfirmedWinner)
        }
        _ => {}
    }
    if !tokens.contains(&winner) {
        return Err(Inconsistency::WinnerNotInMarket);
    }
    Ok(winner.clone())
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationOutput {
    /// Ordered by (user, market).
    pub pnl: Vec<UserMarketPnl>,
    /// Ordered by user.
    pub stats: Vec<UserStats>,
    /// Ordered by (user, tag).
    pub tags: Vec<UserTag>,
    /// Fills that landed in a settleable market.
    pub fills_considered: u64,
}

fn ratio(numerator: Decimal, denominator: Decimal) -> Option<Decimal> {
    if denominator.is_zero() {
        return None;
    }
    numerator
        .checked_div(denominator)
        .map(|r| r.round_dp(RATIO_DP))
}

/// Compute per-(user, market) PnL, per-user rollups and tags.
///
/// Fills for tokens outside settleable markets are ignored. Each fill is
/// applied to the taker with its decoded side and to the maker with the
/// opposite side.
pub fn aggregate(
    fills: &[SettlementFill],
    token_map: &TokenMap,
    resolution: &MarketResolution,
    settings: &AggregationSettings,
) -> AggregationOutput {
    let mut ordered: Vec<&SettlementFill> = fills.iter().collect();
    ordered.sort_by_cached_key(|f| f.chain_order_key());

    let mut ledgers: BTreeMap<(Address, MarketId), MarketLedger> = BTreeMap::new();
    let mut fills_considered = 0u64;

    for fill in ordered {
        let Some(mapping) = token_map.get(&fill.token_id) else {
            continue;
        };
        if !resolution.winners.contains_key(&mapping.market_id) {
            continue;
        }
        fills_considered += 1;

        for (user, side) in [
            (&fill.taker, fill.side),
            (&fill.maker, fill.side.opposite()),
        ] {
            if settings.excluded_addresses.contains(user) {
                continue;
            }
            ledgers
                .entry((user.clone(), mapping.market_id.clone()))
                .or_default()
                .apply(side, fill);
        }
    }

    let mut pnl = Vec::with_capacity(ledgers.len());
    let mut stats: BTreeMap<Address, UserStats> = BTreeMap::new();
    let mut first_seen: BTreeMap<Address, SeenAt> = BTreeMap::new();
    let mut last_seen: BTreeMap<Address, SeenAt> = BTreeMap::new();
    let mut one_sided: BTreeMap<Address, bool> = BTreeMap::new();

    for ((user, market_id), ledger) in &ledgers {
        let Some(winner) = resolution.winners.get(market_id) else {
            continue;
        };
        let settled = ledger.settle(winner);
        let win = settled.realized_pnl.is_positive();
        pnl.push(UserMarketPnl {
            user: user.clone(),
            market_id: market_id.clone(),
            realized_pnl: settled.realized_pnl,
            cost: ledger.cost,
            proceeds: ledger.proceeds,
            settlement: settled.settlement,
            volume: ledger.volume,
            trade_count: ledger.trade_count,
            roi: ratio(settled.realized_pnl, ledger.cost),
            win,
        });

        let s = stats
            .entry(user.clone())
            .or_insert_with(|| UserStats::empty(user.clone()));
        s.markets_traded += 1;
        if win {
            s.wins += 1;
        } else if settled.realized_pnl.is_negative() {
            s.losses += 1;
        }
        s.total_realized_pnl += settled.realized_pnl;
        s.total_cost += ledger.cost;
        s.total_volume += ledger.volume;
        s.trade_count += ledger.trade_count;
        if ledger.max_trade_usd > s.max_trade_usd {
            s.max_trade_usd = ledger.max_trade_usd;
        }

        if let Some(seen) = ledger.first_seen {
            first_seen
                .entry(user.clone())
                .and_modify(|cur| *cur = (*cur).min(seen))
                .or_insert(seen);
        }
        if let Some(seen) = ledger.last_seen {
            last_seen
                .entry(user.clone())
                .and_modify(|cur| *cur = (*cur).max(seen))
                .or_insert(seen);
        }
        *one_sided.entry(user.clone()).or_insert(true) &= ledger.is_one_sided();
    }

    for (user, s) in stats.iter_mut() {
        s.win_rate = ratio(Decimal::from(s.wins), Decimal::from(s.markets_traded));
        s.roi = ratio(s.total_realized_pnl, s.total_cost);
        if let Some(seen) = first_seen.get(user) {
            s.first_seen_block = Some(seen.block_number);
            s.first_seen_ts = seen.block_timestamp;
        }
        if let Some(seen) = last_seen.get(user) {
            s.last_seen_block = Some(seen.block_number);
            s.last_seen_ts = seen.block_timestamp;
        }
    }

    let mut tags = Vec::new();
    for (user, s) in &stats {
        let start = pnl.partition_point(|row| row.user < *user);
        let end = pnl.partition_point(|row| row.user <= *user);
        let profile = UserProfile {
            stats: s,
            markets: &pnl[start..end],
            one_sided_everywhere: one_sided.get(user).copied().unwrap_or(false),
        };
        tags.extend(
            settings
                .tag_rules
                .evaluate(&profile)
                .into_iter()
                .map(|tag| UserTag {
                    user: user.clone(),
                    tag,
                }),
        );
    }
    tags.sort();

    AggregationOutput {
        pnl,
        stats: stats.into_values().collect(),
        tags,
        fills_considered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Tag, TokenMapping, WinnerConfidence};

    const MAKER: &str = "0x1111111111111111111111111111111111111111";
    const TAKER: &str = "0x2222222222222222222222222222222222222222";

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn fill(block: u64, token: &str, side: Side, price: &str, size: &str) -> SettlementFill {
        SettlementFill {
            tx_hash: format!("0x{:x}", block),
            log_index: 0,
            block_number: block,
            block_timestamp: Some(1_000 + block as i64),
            maker: Address::new(MAKER),
            taker: Address::new(TAKER),
            token_id: TokenId::new(token),
            side,
            price: d(price),
            size: d(size),
            usd_notional: d(price) * d(size),
        }
    }

    fn binary_market(id: &str, yes: &str, no: &str) -> TokenMap {
        let mut map = TokenMap::new();
        for (i, token) in [yes, no].iter().enumerate() {
            map.insert(
                TokenId::new(*token),
                TokenMapping::new(TokenId::new(*token), MarketId::new(id))
                    .with_outcome(i as i64, if i == 0 { "Yes" } else { "No" }),
            );
        }
        map
    }

    fn markets(list: Vec<Market>) -> BTreeMap<MarketId, Market> {
        list.into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    fn run(fills: &[SettlementFill], map: &TokenMap, ms: &BTreeMap<MarketId, Market>) -> AggregationOutput {
        let settings = AggregationSettings::default();
        let resolution = resolve_markets(map, ms, &settings);
        aggregate(fills, map, &resolution, &settings)
    }

    #[test]
    fn test_taker_buy_wins_maker_mirrors() {
        let map = binary_market("m1", "1", "2");
        let ms = markets(vec![Market::resolved(MarketId::new("m1"), TokenId::new("1"))]);
        let out = run(&[fill(10, "1", Side::Buy, "0.4", "10")], &map, &ms);

        assert_eq!(out.pnl.len(), 2);
        let taker = out.pnl.iter().find(|r| r.user.as_str() == TAKER).unwrap();
        let maker = out.pnl.iter().find(|r| r.user.as_str() == MAKER).unwrap();
        assert_eq!(taker.realized_pnl, d("6"));
        assert_eq!(taker.roi, Some(d("1.5")));
        assert!(taker.win);
        assert_eq!(maker.realized_pnl, d("-6"));
        assert!(!maker.win);
        assert_eq!(out.fills_considered, 1);
    }

    #[test]
    fn test_unresolved_market_contributes_nothing() {
        let map = binary_market("m1", "1", "2");
        let ms = markets(vec![Market::unresolved(MarketId::new("m1"))]);
        let out = run(&[fill(10, "1", Side::Buy, "0.4", "10")], &map, &ms);
        assert!(out.pnl.is_empty());
        assert!(out.stats.is_empty());
        assert!(out.tags.is_empty());
    }

    #[test]
    fn test_unknown_token_ignored() {
        let map = binary_market("m1", "1", "2");
        let ms = markets(vec![Market::resolved(MarketId::new("m1"), TokenId::new("1"))]);
        let out = run(&[fill(10, "99", Side::Buy, "0.4", "10")], &map, &ms);
        assert!(out.pnl.is_empty());
        assert_eq!(out.fills_considered, 0);
    }

    #[test]
    fn test_inconsistent_markets_are_flagged() {
        let mut map = binary_market("m1", "1", "2");
        map.extend(binary_market("m2", "3", "4"));
        map.extend(binary_market("m3", "5", "6"));
        let ms = markets(vec![
            Market::resolved(MarketId::new("m1"), TokenId::new("3")),
            Market {
                winning_token_id: None,
                ..Market::resolved(MarketId::new("m2"), TokenId::new("3"))
            },
            Market::resolved(MarketId::new("m3"), TokenId::new("5"))
                .with_confidence(WinnerConfidence::None),
        ]);
        let settings = AggregationSettings::default();
        let resolution = resolve_markets(&map, &ms, &settings);
        assert!(resolution.winners.is_empty());
        let reasons: Vec<Inconsistency> = resolution.flagged.iter().map(|f| f.reason).collect();
        assert_eq!(
            reasons,
            vec![
                Inconsistency::WinnerNotInMarket,
                Inconsistency::ResolvedWithoutWinner,
                Inconsistency::NoConfidentWinner,
            ]
        );
    }

    #[test]
    fn test_inferred_winner_policy() {
        let map = binary_market("m1", "1", "2");
        let ms = markets(vec![Market::resolved(MarketId::new("m1"), TokenId::new("1"))
            .with_confidence(WinnerConfidence::Inferred)]);

        let lenient = AggregationSettings::default();
        assert_eq!(resolve_markets(&map, &ms, &lenient).winners.len(), 1);

        let strict = AggregationSettings {
            require_confirmed_winner: true,
            ..AggregationSettings::default()
        };
        let resolution = resolve_markets(&map, &ms, &strict);
        assert!(resolution.winners.is_empty());
        assert_eq!(resolution.flagged[0].reason, Inconsistency::UnconfirmedWinner);
    }

    #[test]
    fn test_missing_market_counted() {
        let map = binary_market("m1", "1", "2");
        let resolution = resolve_markets(&map, &BTreeMap::new(), &AggregationSettings::default());
        assert_eq!(resolution.missing, 1);
        assert!(resolution.flagged.is_empty());
    }

    #[test]
    fn test_excluded_addresses_not_attributed() {
        let map = binary_market("m1", "1", "2");
        let ms = markets(vec![Market::resolved(MarketId::new("m1"), TokenId::new("1"))]);
        let mut f = fill(10, "1", Side::Buy, "0.4", "10");
        f.maker = Address::new(crate::chain::DEFAULT_EXCHANGE_ADDRESSES[0]);
        let out = run(&[f], &map, &ms);
        assert_eq!(out.pnl.len(), 1);
        assert_eq!(out.pnl[0].user.as_str(), TAKER);
    }

    #[test]
    fn test_rollup_across_markets() {
        let mut map = binary_market("m1", "1", "2");
        map.extend(binary_market("m2", "3", "4"));
        let ms = markets(vec![
            Market::resolved(MarketId::new("m1"), TokenId::new("1")),
            Market::resolved(MarketId::new("m2"), TokenId::new("4")),
        ]);
        let fills = vec![
            fill(10, "1", Side::Buy, "0.4", "10"),
            fill(12, "3", Side::Buy, "0.5", "4"),
        ];
        let out = run(&fills, &map, &ms);
        let taker = out.stats.iter().find(|s| s.user.as_str() == TAKER).unwrap();
        assert_eq!(taker.markets_traded, 2);
        assert_eq!(taker.wins, 1);
        assert_eq!(taker.losses, 1);
        assert_eq!(taker.win_rate, Some(d("0.5")));
        assert_eq!(taker.total_realized_pnl, d("4"));
        assert_eq!(taker.total_cost, d("6"));
        assert_eq!(taker.first_seen_block, Some(10));
        assert_eq!(taker.last_seen_block, Some(12));
        assert_eq!(taker.last_seen_ts, Some(1_012));
        // taker held the winner to settlement without selling
        assert!(out
            .tags
            .iter()
            .any(|t| t.user.as_str() == TAKER && t.tag == Tag::DiamondHands));
    }

    #[test]
    fn test_aggregate_ignores_input_order() {
        let map = binary_market("m1", "1", "2");
        let ms = markets(vec![Market::resolved(MarketId::new("m1"), TokenId::new("2"))]);
        let fills = vec![
            fill(10, "1", Side::Buy, "0.4", "10"),
            fill(11, "2", Side::Sell, "0.3", "5"),
            fill(12, "1", Side::Sell, "0.7", "10"),
        ];
        let mut reversed = fills.clone();
        reversed.reverse();
        assert_eq!(run(&fills, &map, &ms), run(&reversed, &map, &ms));
    }
}
