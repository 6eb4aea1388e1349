//! Market metadata consumed by aggregation: resolution state and token mapping.

use crate::domain::{MarketId, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Resolution status of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Unresolved,
    Resolved,
}

/// How much the winner attached to a market can be trusted.
///
/// Winners are inferred externally (e.g. from final outcome prices) and are
/// treated as untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinnerConfidence {
    /// Winner read from an authoritative resolution.
    Confirmed,
    /// Winner inferred from a heuristic such as a terminal price near 1.0.
    Inferred,
    /// No usable winner.
    None,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Unresolved => "unresolved",
            ResolutionStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for ResolutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(ResolutionStatus::Unresolved),
            "resolved" => Ok(ResolutionStatus::Resolved),
            other => Err(format!("invalid resolution status: {}", other)),
        }
    }
}

impl WinnerConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            WinnerConfidence::Confirmed => "confirmed",
            WinnerConfidence::Inferred => "inferred",
            WinnerConfidence::None => "none",
        }
    }
}

impl FromStr for WinnerConfidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(WinnerConfidence::Confirmed),
            "inferred" => Ok(WinnerConfidence::Inferred),
            "none" => Ok(WinnerConfidence::None),
            other => Err(format!("invalid winner confidence: {}", other)),
        }
    }
}

/// A prediction market as known to the metadata provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub question: Option<String>,
    pub slug: Option<String>,
    pub status: ResolutionStatus,
    pub winning_token_id: Option<TokenId>,
    pub winner_confidence: WinnerConfidence,
}

impl Market {
    /// An open market with no winner.
    pub fn unresolved(id: MarketId) -> Self {
        Market {
            id,
            question: None,
            slug: None,
            status: ResolutionStatus::Unresolved,
            winning_token_id: None,
            winner_confidence: WinnerConfidence::None,
        }
    }

    /// A resolved market with a confirmed winner.
    pub fn resolved(id: MarketId, winner: TokenId) -> Self {
        Market {
            id,
            question: None,
            slug: None,
            status: ResolutionStatus::Resolved,
            winning_token_id: Some(winner),
            winner_confidence: WinnerConfidence::Confirmed,
        }
    }

    pub fn with_confidence(mut self, confidence: WinnerConfidence) -> Self {
        self.winner_confidence = confidence;
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = Some(question.into());
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ResolutionStatus::Resolved
    }
}

/// Maps an outcome token to its market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMapping {
    pub token_id: TokenId,
    pub market_id: MarketId,
    pub outcome_index: Option<i64>,
    pub outcome_label: Option<String>,
}

impl TokenMapping {
    pub fn new(token_id: TokenId, market_id: MarketId) -> Self {
        TokenMapping {
            token_id,
            market_id,
            outcome_index: None,
            outcome_label: None,
        }
    }

    pub fn with_outcome(mut self, index: i64, label: impl Into<String>) -> Self {
        self.outcome_index = Some(index);
        self.outcome_label = Some(label.into());
        self
    }
}

/// token_id → mapping. Ordered so every traversal is deterministic.
pub type TokenMap = BTreeMap<TokenId, TokenMapping>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_confidence_round_trip_strings() {
        for status in [ResolutionStatus::Unresolved, ResolutionStatus::Resolved] {
            assert_eq!(status.as_str().parse::<ResolutionStatus>().unwrap(), status);
        }
        for conf in [
            WinnerConfidence::Confirmed,
            WinnerConfidence::Inferred,
            WinnerConfidence::None,
        ] {
            assert_eq!(conf.as_str().parse::<WinnerConfidence>().unwrap(), conf);
        }
        assert!("maybe".parse::<WinnerConfidence>().is_err());
    }

    #[test]
    fn test_market_constructors() {
        let m = Market::resolved(MarketId::new("m1"), TokenId::new("1"));
        assert!(m.is_resolved());
        assert_eq!(m.winner_confidence, WinnerConfidence::Confirmed);

        let m = Market::unresolved(MarketId::new("m2"));
        assert!(!m.is_resolved());
        assert!(m.winning_token_id.is_none());
    }
}
