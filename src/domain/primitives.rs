//! Domain primitives: BlockNumber, Address, TokenId, MarketId, Side.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Chain block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Create a BlockNumber from a raw height.
    pub fn new(block: u64) -> Self {
        BlockNumber(block)
    }

    /// Get the underlying height.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// SQLite stores integers as i64; block heights never approach the sign bit.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }
}

impl std::fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wallet or contract address, normalized to lowercase `0x`-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Create an Address from a string, lowercasing it.
    pub fn new(addr: impl AsRef<str>) -> Self {
        Address(addr.as_ref().trim().to_ascii_lowercase())
    }

    /// Address from the low 20 bytes of a 32-byte ABI word or topic.
    pub fn from_word(word: &[u8]) -> Option<Self> {
        if word.len() != 32 {
            return None;
        }
        Some(Address(format!("0x{}", hex::encode(&word[12..]))))
    }

    /// The all-zero address.
    pub fn zero() -> Self {
        Address(format!("0x{}", "0".repeat(40)))
    }

    /// Get the address as a string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome token identifier (uint256 rendered in decimal).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        TokenId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Market identifier as assigned by the metadata provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId(String);

impl MarketId {
    pub fn new(id: impl Into<String>) -> Self {
        MarketId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MarketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade side, always expressed from the taker's perspective on a stored trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Received the outcome token.
    Buy,
    /// Gave up the outcome token.
    Sell,
}

impl Side {
    /// The counterparty's side of the same fill.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("invalid side: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_side_serialization() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"SELL\"");
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("buy".parse::<Side>().is_err());
    }

    #[test]
    fn test_address_is_lowercased() {
        let addr = Address::new("0xC5d563A36AE78145C45a50134d48A1215220f80a");
        assert_eq!(addr.as_str(), "0xc5d563a36ae78145c45a50134d48a1215220f80a");
        assert_eq!(addr, Address::new("0xc5d563a36ae78145c45a50134d48a1215220f80a"));
    }

    #[test]
    fn test_address_from_word() {
        let mut word = [0u8; 32];
        word[31] = 0xab;
        word[12] = 0x01;
        let addr = Address::from_word(&word).unwrap();
        assert_eq!(addr.as_str(), "0x01000000000000000000000000000000000000ab");
        assert!(Address::from_word(&word[..20]).is_none());
    }

    #[test]
    fn test_block_number_ordering() {
        assert!(BlockNumber::new(10) < BlockNumber::new(11));
        assert_eq!(BlockNumber::new(7).to_string(), "7");
    }
}
