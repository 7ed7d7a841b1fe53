//! Core value types shared across the engine.
//!
//! Everything here is plain data: sides, actions, OHLCV bars, the technical
//! snapshot consumed from the signal provider, and the agent recommendation
//! attached to incoming trade proposals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TradewindError};

// ============================================================================
// Side / TradeAction
// ============================================================================

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = TradewindError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(TradewindError::InvalidSignal(format!(
                "invalid side '{other}'; expected long|short"
            ))),
        }
    }
}

/// Order action attached to an incoming proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAction {
    Buy,
    Sell,
    Short,
    Cover,
}

impl TradeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Short => "short",
            TradeAction::Cover => "cover",
        }
    }

    /// The position side an opening action establishes.
    pub fn opening_side(self) -> Side {
        match self {
            TradeAction::Buy | TradeAction::Cover => Side::Long,
            TradeAction::Sell | TradeAction::Short => Side::Short,
        }
    }

    /// Whether this action opens a new position (vs. unwinding one).
    pub fn is_opening(self) -> bool {
        matches!(self, TradeAction::Buy | TradeAction::Short)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = TradewindError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(TradeAction::Buy),
            "sell" => Ok(TradeAction::Sell),
            "short" => Ok(TradeAction::Short),
            "cover" => Ok(TradeAction::Cover),
            other => Err(TradewindError::InvalidSignal(format!(
                "invalid action '{other}'; expected buy|sell|short|cover"
            ))),
        }
    }
}

// ============================================================================
// Urgency / MarketStatus
// ============================================================================

/// Exit urgency. `Immediate` bypasses retry backoff waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Normal,
    Urgent,
    Immediate,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::Urgent => "urgent",
            Urgency::Immediate => "immediate",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market session status reported by the broker clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarketStatus {
    Open,
    PreMarket,
    AfterHours,
    Closed,
}

impl MarketStatus {
    pub fn is_open(self) -> bool {
        matches!(self, MarketStatus::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::PreMarket => "pre-market",
            MarketStatus::AfterHours => "after-hours",
            MarketStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// AgentRecommendation
// ============================================================================

/// Trade setup proposed by an upstream AI analyst.
///
/// Validate-mode strategies use these values verbatim once the technical
/// picture checks out; they never recompute them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecommendation {
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub target: Decimal,
    pub quantity: u64,
    pub trade_type: Side,
}

impl AgentRecommendation {
    /// Check internal price ordering for the proposed side.
    pub fn validate(&self) -> Result<()> {
        if self.quantity == 0 {
            return Err(TradewindError::InvalidSignal(
                "agent recommendation has zero quantity".to_string(),
            ));
        }
        let ordered = match self.trade_type {
            Side::Long => self.stop_loss < self.entry_price && self.entry_price < self.target,
            Side::Short => self.target < self.entry_price && self.entry_price < self.stop_loss,
        };
        if !ordered {
            return Err(TradewindError::InvalidSignal(format!(
                "agent levels out of order for {}: stop={} entry={} target={}",
                self.trade_type, self.stop_loss, self.entry_price, self.target
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Bars & TechnicalSignals
// ============================================================================

/// A single OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

/// Technical snapshot for one ticker, as returned by the signal provider.
///
/// `momentum` is a percent change, `score` a 0-1 composite, `signals` a set of
/// free-form tags (e.g. "breakout", "weak_trend"). `bars` is daily history,
/// oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalSignals {
    pub symbol: String,
    pub price: Decimal,
    pub atr: Decimal,
    pub momentum: f64,
    pub score: f64,
    pub rsi: f64,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default)]
    pub bars: Vec<Bar>,
}

impl TechnicalSignals {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.signals.iter().any(|s| s == tag)
    }

    /// Weak-technicals check used by exit evaluation: the provider marks
    /// deteriorating setups with side-specific tags.
    pub fn is_weak(&self, side: Side) -> bool {
        match side {
            Side::Long => self.has_tag("weak_trend") || self.has_tag("bearish_reversal"),
            Side::Short => self.has_tag("weak_trend") || self.has_tag("bullish_reversal"),
        }
    }
}

/// Validate a ticker symbol: 1-5 uppercase ASCII letters.
pub fn validate_ticker(ticker: &str) -> Result<()> {
    let ok = (1..=5).contains(&ticker.len())
        && ticker.bytes().all(|b| b.is_ascii_uppercase());
    if ok {
        Ok(())
    } else {
        Err(TradewindError::InvalidSignal(format!(
            "invalid ticker '{ticker}'; expected 1-5 uppercase letters"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_action_opening_side() {
        assert_eq!(TradeAction::Buy.opening_side(), Side::Long);
        assert_eq!(TradeAction::Short.opening_side(), Side::Short);
        assert!(TradeAction::Buy.is_opening());
        assert!(!TradeAction::Sell.is_opening());
    }

    #[test]
    fn test_side_roundtrip() {
        for side in [Side::Long, Side::Short] {
            assert_eq!(side.as_str().parse::<Side>().unwrap(), side);
        }
        assert!("sideways".parse::<Side>().is_err());
    }

    #[test]
    fn test_ticker_validation() {
        assert!(validate_ticker("AAPL").is_ok());
        assert!(validate_ticker("F").is_ok());
        assert!(validate_ticker("GOOGL").is_ok());
        assert!(validate_ticker("").is_err());
        assert!(validate_ticker("TOOLONG").is_err());
        assert!(validate_ticker("aapl").is_err());
        assert!(validate_ticker("BRK.B").is_err());
    }

    #[test]
    fn test_agent_recommendation_ordering() {
        let long = AgentRecommendation {
            entry_price: dec!(150),
            stop_loss: dec!(145),
            target: dec!(165),
            quantity: 100,
            trade_type: Side::Long,
        };
        assert!(long.validate().is_ok());

        let inverted = AgentRecommendation {
            stop_loss: dec!(155),
            ..long.clone()
        };
        assert!(inverted.validate().is_err());

        let short = AgentRecommendation {
            entry_price: dec!(150),
            stop_loss: dec!(155),
            target: dec!(140),
            quantity: 50,
            trade_type: Side::Short,
        };
        assert!(short.validate().is_ok());
    }

    #[test]
    fn test_weak_technicals_by_side() {
        let mut sig = TechnicalSignals {
            symbol: "AAPL".to_string(),
            price: dec!(150),
            atr: dec!(2),
            momentum: 5.0,
            score: 0.7,
            rsi: 55.0,
            signals: vec!["bearish_reversal".to_string()],
            bars: vec![],
        };
        assert!(sig.is_weak(Side::Long));
        assert!(!sig.is_weak(Side::Short));

        sig.signals = vec!["weak_trend".to_string()];
        assert!(sig.is_weak(Side::Long));
        assert!(sig.is_weak(Side::Short));
    }
}
