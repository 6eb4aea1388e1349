//! Trade type representing one decoded `OrderFilled` event.

use crate::domain::{Address, BlockNumber, Decimal, Side, TokenId};
use serde::{Deserialize, Serialize};

/// Number of decimal places assumed for collateral and outcome-token amounts.
///
/// Not read from chain metadata; Polymarket's USDC collateral and CTF tokens
/// both use six.
pub const AMOUNT_DECIMALS: u32 = 6;

/// Idempotency key for a trade: the log's position in the chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradeKey {
    pub tx_hash: String,
    pub log_index: u64,
}

impl std::fmt::Display for TradeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// Values derived by the decoder, kept alongside the raw fields in the proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferredFields {
    pub side: Side,
    pub token_id: TokenId,
    pub token_amount: String,
    pub counter_amount: String,
    pub price: Decimal,
    pub amount_decimals: u32,
}

/// Fixed-schema decoded payload retained as verifiable proof of a trade.
///
/// uint256 values are rendered as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillProof {
    pub event: String,
    pub contract: Address,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: BlockNumber,
    pub order_hash: String,
    pub maker: Address,
    pub taker: Address,
    pub maker_asset_id: String,
    pub taker_asset_id: String,
    pub maker_amount_filled: String,
    pub taker_amount_filled: String,
    pub fee: String,
    pub topics: Vec<String>,
    pub data: String,
    pub inferred: InferredFields,
}

/// A single decoded fill. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: BlockNumber,
    /// Block time in Unix seconds, when the header could be fetched.
    pub block_timestamp: Option<i64>,
    pub contract_address: Address,
    pub maker: Address,
    pub taker: Address,
    pub token_id: TokenId,
    /// Side relative to the taker.
    pub side: Side,
    /// Collateral per outcome token, within [0, 1].
    pub price: Decimal,
    /// Outcome-token amount in base units.
    pub filled_size: u128,
    /// Collateral amount in base units.
    pub counter_amount: u128,
    pub fee: u128,
    pub usd_notional: Decimal,
    pub proof: FillProof,
    /// The log exactly as returned by the RPC endpoint.
    pub raw_log_json: String,
}

impl Trade {
    pub fn key(&self) -> TradeKey {
        TradeKey {
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }

    /// Serialize the proof payload for storage.
    pub fn proof_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof() -> FillProof {
        FillProof {
            event: "OrderFilled".to_string(),
            contract: Address::new("0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e"),
            tx_hash: "0xabc".to_string(),
            log_index: 3,
            block_number: BlockNumber::new(100),
            order_hash: "0x01".to_string(),
            maker: Address::new("0x1111111111111111111111111111111111111111"),
            taker: Address::new("0x2222222222222222222222222222222222222222"),
            maker_asset_id: "0".to_string(),
            taker_asset_id: "42".to_string(),
            maker_amount_filled: "4000000".to_string(),
            taker_amount_filled: "10000000".to_string(),
            fee: "0".to_string(),
            topics: vec![],
            data: "0x".to_string(),
            inferred: InferredFields {
                side: Side::Buy,
                token_id: TokenId::new("42"),
                token_amount: "10000000".to_string(),
                counter_amount: "4000000".to_string(),
                price: Decimal::from_str_canonical("0.4").unwrap(),
                amount_decimals: AMOUNT_DECIMALS,
            },
        }
    }

    #[test]
    fn test_proof_uses_camel_case_keys() {
        let json = serde_json::to_value(sample_proof()).unwrap();
        assert!(json.get("makerAssetId").is_some());
        assert!(json.get("takerAmountFilled").is_some());
        assert_eq!(json["inferred"]["side"], "BUY");
        assert_eq!(json["inferred"]["price"], "0.4");
    }

    #[test]
    fn test_trade_key_display() {
        let key = TradeKey {
            tx_hash: "0xabc".to_string(),
            log_index: 7,
        };
        assert_eq!(key.to_string(), "0xabc:7");
    }
}
