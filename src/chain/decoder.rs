//! ABI decoding of exchange `OrderFilled` logs into trades.
//!
//! Layout: `topics[1]` = orderHash, `topics[2]` = maker, `topics[3]` = taker;
//! `data` holds five words: makerAssetId, takerAssetId, makerAmountFilled,
//! takerAmountFilled, fee. Asset id 0 is the collateral.

use super::RawLog;
use crate::domain::{
    Address, BlockNumber, Decimal, FillProof, InferredFields, Side, TokenId, Trade, AMOUNT_DECIMALS,
};
use alloy_primitives::{keccak256, U256};
use rust_decimal::Decimal as RustDecimal;
use std::fmt;

pub const ORDER_FILLED_SIGNATURE: &str =
    "OrderFilled(bytes32,address,address,uint256,uint256,uint256,uint256,uint256)";

const WORD: usize = 32;
const DATA_WORDS: usize = 5;

/// How far above 1.0 a computed price may be before the log is rejected.
/// Prices within tolerance are clamped to 1.0.
pub fn price_tolerance() -> Decimal {
    Decimal::new(RustDecimal::new(1, 3))
}

/// `0x`-prefixed keccak256 of the event signature.
pub fn order_filled_topic() -> String {
    format!(
        "0x{}",
        hex::encode(keccak256(ORDER_FILLED_SIGNATURE.as_bytes()).as_slice())
    )
}

/// Why a log did not produce a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    UnexpectedTopic,
    Malformed,
    NoCollateralLeg,
    InvalidPrice,
    AmountOverflow,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UnexpectedTopic => "unexpected_topic",
            SkipReason::Malformed => "malformed",
            SkipReason::NoCollateralLeg => "no_collateral_leg",
            SkipReason::InvalidPrice => "invalid_price",
            SkipReason::AmountOverflow => "amount_overflow",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-log, non-fatal decode outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeSkipped {
    pub reason: SkipReason,
    pub detail: String,
}

impl DecodeSkipped {
    fn new(reason: SkipReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for DecodeSkipped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

impl std::error::Error for DecodeSkipped {}

/// Stateless `OrderFilled` decoder.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    topic0: String,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).ok()
}

fn word_to_u128(word: U256, field: &str) -> Result<u128, DecodeSkipped> {
    u128::try_from(word).map_err(|_| {
        DecodeSkipped::new(
            SkipReason::AmountOverflow,
            format!("{} does not fit in 128 bits: {}", field, word),
        )
    })
}

fn to_decimal(amount: u128, decimals: u32, field: &str) -> Result<Decimal, DecodeSkipped> {
    Decimal::from_base_units(amount, decimals).ok_or_else(|| {
        DecodeSkipped::new(
            SkipReason::AmountOverflow,
            format!("{} exceeds decimal range: {}", field, amount),
        )
    })
}

impl EventDecoder {
    pub fn new() -> Self {
        Self {
            topic0: order_filled_topic(),
        }
    }

    pub fn topic0(&self) -> &str {
        &self.topic0
    }

    /// Decode one log. `block_timestamp` is attached as-is.
    pub fn decode(&self, log: &RawLog, block_timestamp: Option<i64>) -> Result<Trade, DecodeSkipped> {
        let first = log
            .topics
            .first()
            .ok_or_else(|| DecodeSkipped::new(SkipReason::Malformed, "log has no topics"))?;
        if !first.eq_ignore_ascii_case(&self.topic0) {
            return Err(DecodeSkipped::new(
                SkipReason::UnexpectedTopic,
                format!("topic0 {}", first),
            ));
        }
        if log.topics.len() < 4 {
            return Err(DecodeSkipped::new(
                SkipReason::Malformed,
                format!("expected 4 topics, got {}", log.topics.len()),
            ));
        }

        let mut indexed = Vec::with_capacity(3);
        for topic in &log.topics[1..4] {
            match decode_hex(topic) {
                Some(bytes) if bytes.len() == WORD => indexed.push(bytes),
                _ => {
                    return Err(DecodeSkipped::new(
                        SkipReason::Malformed,
                        format!("topic is not a 32-byte word: {}", topic),
                    ))
                }
            }
        }
        let order_hash = format!("0x{}", hex::encode(&indexed[0]));
        let maker = Address::from_word(&indexed[1])
            .ok_or_else(|| DecodeSkipped::new(SkipReason::Malformed, "bad maker topic"))?;
        let taker = Address::from_word(&indexed[2])
            .ok_or_else(|| DecodeSkipped::new(SkipReason::Malformed, "bad taker topic"))?;

        let data = decode_hex(&log.data)
            .ok_or_else(|| DecodeSkipped::new(SkipReason::Malformed, "data is not hex"))?;
        if data.len() < WORD * DATA_WORDS {
            return Err(DecodeSkipped::new(
                SkipReason::Malformed,
                format!("data has {} bytes, need {}", data.len(), WORD * DATA_WORDS),
            ));
        }
        let words: Vec<U256> = data
            .chunks_exact(WORD)
            .take(DATA_WORDS)
            .map(U256::from_be_slice)
            .collect();
        let (maker_asset_id, taker_asset_id) = (words[0], words[1]);
        let (maker_amount_filled, taker_amount_filled, fee_word) = (words[2], words[3], words[4]);

        // The outcome token is the non-zero leg; the other must be collateral.
        let (side, token_word, token_amount_word, counter_amount_word) =
            match (maker_asset_id.is_zero(), taker_asset_id.is_zero()) {
                (true, false) => (Side::Buy, taker_asset_id, taker_amount_filled, maker_amount_filled),
                (false, true) => (Side::Sell, maker_asset_id, maker_amount_filled, taker_amount_filled),
                _ => {
                    return Err(DecodeSkipped::new(
                        SkipReason::NoCollateralLeg,
                        format!(
                            "makerAssetId={} takerAssetId={}",
                            maker_asset_id, taker_asset_id
                        ),
                    ))
                }
            };

        let token_amount = word_to_u128(token_amount_word, "token amount")?;
        let counter_amount = word_to_u128(counter_amount_word, "collateral amount")?;
        let fee = word_to_u128(fee_word, "fee")?;

        if token_amount == 0 {
            return Err(DecodeSkipped::new(
                SkipReason::InvalidPrice,
                "zero outcome-token amount",
            ));
        }
        let token_units = to_decimal(token_amount, 0, "token amount")?;
        let counter_units = to_decimal(counter_amount, 0, "collateral amount")?;
        let raw_price = counter_units.checked_div(token_units).ok_or_else(|| {
            DecodeSkipped::new(SkipReason::InvalidPrice, "price division failed")
        })?;
        if raw_price > Decimal::one() + price_tolerance() {
            return Err(DecodeSkipped::new(
                SkipReason::InvalidPrice,
                format!("price {} above 1", raw_price),
            ));
        }
        let price = if raw_price > Decimal::one() {
            Decimal::one()
        } else {
            raw_price
        };
        let usd_notional = to_decimal(counter_amount, AMOUNT_DECIMALS, "collateral amount")?;

        let token_id = TokenId::new(token_word.to_string());
        let block_number = BlockNumber::new(log.block_number);
        let proof = FillProof {
            event: "OrderFilled".to_string(),
            contract: log.address.clone(),
            tx_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number,
            order_hash,
            maker: maker.clone(),
            taker: taker.clone(),
            maker_asset_id: maker_asset_id.to_string(),
            taker_asset_id: taker_asset_id.to_string(),
            maker_amount_filled: maker_amount_filled.to_string(),
            taker_amount_filled: taker_amount_filled.to_string(),
            fee: fee_word.to_string(),
            topics: log.topics.clone(),
            data: log.data.clone(),
            inferred: InferredFields {
                side,
                token_id: token_id.clone(),
                token_amount: token_amount.to_string(),
                counter_amount: counter_amount.to_string(),
                price,
                amount_decimals: AMOUNT_DECIMALS,
            },
        };

        Ok(Trade {
            tx_hash: log.transaction_hash.clone(),
            log_index: log.log_index,
            block_number,
            block_timestamp,
            contract_address: log.address.clone(),
            maker,
            taker,
            token_id,
            side,
            price,
            filled_size: token_amount,
            counter_amount,
            fee,
            usd_notional,
            proof,
            raw_log_json: log.raw_json.clone(),
        })
    }
}

pub mod test_support {
    //! Builders for synthetic `OrderFilled` logs, shared by unit and
    //! integration tests.

    use super::*;

    pub const MAKER: &str = "0x1111111111111111111111111111111111111111";
    pub const TAKER: &str = "0x2222222222222222222222222222222222222222";
    pub const EXCHANGE: &str = "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";

    fn word(value: u128) -> String {
        format!("{:064x}", value)
    }

    fn address_topic(addr: &str) -> String {
        format!("0x{:0>64}", addr.trim_start_matches("0x"))
    }

    pub fn order_filled_log(
        block: u64,
        log_index: u64,
        maker_asset: u128,
        taker_asset: u128,
        maker_amount: u128,
        taker_amount: u128,
    ) -> RawLog {
        order_filled_log_between(
            MAKER,
            TAKER,
            block,
            log_index,
            maker_asset,
            taker_asset,
            maker_amount,
            taker_amount,
        )
    }

    /// Like [`order_filled_log`] with explicit counterparties.
    #[allow(clippy::too_many_arguments)]
    pub fn order_filled_log_between(
        maker: &str,
        taker: &str,
        block: u64,
        log_index: u64,
        maker_asset: u128,
        taker_asset: u128,
        maker_amount: u128,
        taker_amount: u128,
    ) -> RawLog {
        let data = format!(
            "0x{}{}{}{}{}",
            word(maker_asset),
            word(taker_asset),
            word(maker_amount),
            word(taker_amount),
            word(0)
        );
        let topics = vec![
            order_filled_topic(),
            format!("0x{}", word(block as u128 * 1000 + log_index as u128)),
            address_topic(maker),
            address_topic(taker),
        ];
        let tx_hash = format!("0x{:064x}", block);
        let raw_json = serde_json::json!({
            "address": EXCHANGE,
            "topics": topics,
            "data": data,
            "blockNumber": format!("0x{:x}", block),
            "transactionHash": tx_hash,
            "logIndex": format!("0x{:x}", log_index),
            "removed": false,
        })
        .to_string();
        RawLog {
            address: Address::new(EXCHANGE),
            topics,
            data,
            block_number: block,
            transaction_hash: tx_hash,
            log_index,
            raw_json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_topic_matches_known_hash() {
        assert_eq!(
            order_filled_topic(),
            "0xd0a08e8c493f9c94f29311604c9de1b4e8c8d4c06bd0c789af57f2d65bfec0f6"
        );
    }

    #[test]
    fn test_taker_receives_token_is_buy() {
        // takerAssetId is the outcome token, so the taker side is BUY
        let log = order_filled_log(100, 0, 0, 42, 4_000_000, 10_000_000);
        let trade = EventDecoder::new().decode(&log, Some(1_700_000_000)).unwrap();
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.token_id.as_str(), "42");
        assert_eq!(trade.price.to_canonical_string(), "0.4");
        assert_eq!(trade.filled_size, 10_000_000);
        assert_eq!(trade.counter_amount, 4_000_000);
        assert_eq!(trade.usd_notional.to_canonical_string(), "4");
        assert_eq!(trade.maker.as_str(), MAKER);
        assert_eq!(trade.taker.as_str(), TAKER);
        assert_eq!(trade.block_timestamp, Some(1_700_000_000));
        assert_eq!(trade.raw_log_json, log.raw_json);
    }

    #[test]
    fn test_maker_gives_token_is_sell() {
        let log = order_filled_log(100, 1, 42, 0, 10_000_000, 6_500_000);
        let trade = EventDecoder::new().decode(&log, None).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.token_id.as_str(), "42");
        assert_eq!(trade.price.to_canonical_string(), "0.65");
        assert_eq!(trade.proof.inferred.side, Side::Sell);
        assert_eq!(trade.proof.maker_asset_id, "42");
    }

    #[test]
    fn test_zero_token_amount_is_invalid_price() {
        let log = order_filled_log(100, 0, 0, 42, 4_000_000, 0);
        let err = EventDecoder::new().decode(&log, None).unwrap_err();
        assert_eq!(err.reason, SkipReason::InvalidPrice);
    }

    #[test]
    fn test_price_clamped_within_tolerance() {
        let log = order_filled_log(100, 0, 0, 42, 1_000_500, 1_000_000);
        let trade = EventDecoder::new().decode(&log, None).unwrap();
        assert_eq!(trade.price, Decimal::one());

        let log = order_filled_log(100, 0, 0, 42, 1_200_000, 1_000_000);
        let err = EventDecoder::new().decode(&log, None).unwrap_err();
        assert_eq!(err.reason, SkipReason::InvalidPrice);
    }

    #[test]
    fn test_no_collateral_leg() {
        let both = order_filled_log(100, 0, 7, 42, 1, 1);
        assert_eq!(
            EventDecoder::new().decode(&both, None).unwrap_err().reason,
            SkipReason::NoCollateralLeg
        );
        let neither = order_filled_log(100, 0, 0, 0, 1, 1);
        assert_eq!(
            EventDecoder::new().decode(&neither, None).unwrap_err().reason,
            SkipReason::NoCollateralLeg
        );
    }

    #[test]
    fn test_malformed_and_unexpected() {
        let mut short = order_filled_log(100, 0, 0, 42, 1, 1);
        short.data.truncate(2 + 64 * 4);
        assert_eq!(
            EventDecoder::new().decode(&short, None).unwrap_err().reason,
            SkipReason::Malformed
        );

        let mut other = order_filled_log(100, 0, 0, 42, 1, 1);
        other.topics[0] = format!("0x{}", "ab".repeat(32));
        assert_eq!(
            EventDecoder::new().decode(&other, None).unwrap_err().reason,
            SkipReason::UnexpectedTopic
        );

        let mut missing = order_filled_log(100, 0, 0, 42, 1, 1);
        missing.topics.truncate(3);
        assert_eq!(
            EventDecoder::new().decode(&missing, None).unwrap_err().reason,
            SkipReason::Malformed
        );
    }

    #[test]
    fn test_large_asset_id_renders_decimal() {
        let log = order_filled_log(100, 0, 0, u128::MAX, 5, 10);
        let trade = EventDecoder::new().decode(&log, None).unwrap();
        assert_eq!(trade.token_id.as_str(), u128::MAX.to_string());
        assert_eq!(trade.price.to_canonical_string(), "0.5");
    }
}
