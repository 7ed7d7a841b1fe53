//! Strategy contract and supporting types.
//!
//! A strategy answers two questions: should this proposal become a position,
//! and should this position be closed right now. The authority model is a
//! runtime property: validate-mode strategies (Momentum) verify an
//! agent-proposed setup and use its levels verbatim; autonomous strategies
//! (Breakout, MeanReversion) detect their own setups and compute their own
//! levels.

pub mod breakout;
pub mod mean_reversion;
pub mod momentum;
pub mod registry;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::{AgentRecommendation, MarketStatus, TechnicalSignals, Urgency};
use crate::execution::position_tracker::TrackedPosition;

pub use breakout::{BreakoutConfig, BreakoutStrategy};
pub use mean_reversion::{MeanReversionConfig, MeanReversionStrategy};
pub use momentum::MomentumStrategy;
pub use registry::{SharedStrategy, StrategyFactory, StrategyRegistry};

// ============================================================================
// Decisions
// ============================================================================

/// Result of `evaluate_entry`.
///
/// Safety invariant enforced by the engine: when `should_enter` is true,
/// `stop_loss` must be set and `suggested_size` must be positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDecision {
    pub should_enter: bool,
    pub reason: String,
    pub suggested_size: u64,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
}

impl EntryDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            should_enter: false,
            reason: reason.into(),
            suggested_size: 0,
            entry_price: Decimal::ZERO,
            stop_loss: None,
            target: None,
        }
    }

    pub fn enter(
        reason: impl Into<String>,
        size: u64,
        entry_price: Decimal,
        stop_loss: Decimal,
        target: Decimal,
    ) -> Self {
        Self {
            should_enter: true,
            reason: reason.into(),
            suggested_size: size,
            entry_price,
            stop_loss: Some(stop_loss),
            target: Some(target),
        }
    }
}

/// Result of `evaluate_exit`. Only consulted for positions without an active
/// bracket order; brackets are the primary exit mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub should_exit: bool,
    pub reason: String,
    pub urgency: Urgency,
}

impl ExitDecision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            should_exit: false,
            reason: reason.into(),
            urgency: Urgency::Normal,
        }
    }

    pub fn exit(reason: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            should_exit: true,
            reason: reason.into(),
            urgency,
        }
    }
}

// ============================================================================
// Market context
// ============================================================================

/// Market and account context assembled by the engine each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContext {
    pub vix: f64,
    pub market_status: MarketStatus,
    pub account_equity: Decimal,
    pub buying_power: Decimal,
    pub existing_positions: HashSet<String>,
    pub cooldown_tickers: HashSet<String>,
}

impl MarketContext {
    /// Sentinel substituted when the VIX provider has nothing recent.
    pub const NEUTRAL_VIX: f64 = 20.0;
}

/// Common pre-filter applied before strategy-specific entry logic.
/// Returns the blocking reason, or `None` when all filters pass.
pub fn basic_entry_filters(signal: &TechnicalSignals, context: &MarketContext) -> Option<String> {
    if !context.market_status.is_open() {
        return Some(format!("market is {}", context.market_status));
    }
    if context.existing_positions.contains(&signal.symbol) {
        return Some(format!("already holding {}", signal.symbol));
    }
    if context.cooldown_tickers.contains(&signal.symbol) {
        return Some(format!("{} is in cooldown", signal.symbol));
    }
    None
}

// ============================================================================
// Shared strategy configuration
// ============================================================================

/// Parameters common to all strategies. Strategy-specific structs embed this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub description: String,

    /// Fraction of account equity a single position may consume.
    pub max_position_pct: f64,

    pub min_ta_score: f64,
    pub min_momentum: f64,

    pub exit_momentum_threshold: f64,
    pub exit_score_threshold: f64,
    pub catastrophic_momentum: f64,

    pub cooldown_hours: i64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: "Default strategy configuration".to_string(),
            max_position_pct: 0.05,
            min_ta_score: 0.6,
            min_momentum: -3.0,
            exit_momentum_threshold: -15.0,
            exit_score_threshold: 0.3,
            catastrophic_momentum: -25.0,
            cooldown_hours: 3,
        }
    }
}

impl StrategyConfig {
    /// Logical-consistency check. Returns problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !(0.0..=1.0).contains(&self.max_position_pct) || self.max_position_pct == 0.0 {
            errors.push("max_position_pct must be in (0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_ta_score) {
            errors.push("min_ta_score must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.exit_score_threshold) {
            errors.push("exit_score_threshold must be between 0 and 1".to_string());
        }
        if self.exit_momentum_threshold > self.min_momentum {
            errors.push(format!(
                "exit_momentum_threshold ({}) should not exceed min_momentum ({})",
                self.exit_momentum_threshold, self.min_momentum
            ));
        }
        if self.catastrophic_momentum > self.exit_momentum_threshold {
            errors.push(format!(
                "catastrophic_momentum ({}) should not exceed exit_momentum_threshold ({})",
                self.catastrophic_momentum, self.exit_momentum_threshold
            ));
        }
        if self.cooldown_hours < 0 {
            errors.push("cooldown_hours must be non-negative".to_string());
        }
        errors
    }
}

// ============================================================================
// Strategy trait
// ============================================================================

/// Capability contract for trading strategies.
///
/// Methods take `&mut self`: strategies may keep per-ticker memory (false
/// breakout counts, entry times) across cycles.
pub trait Strategy: Send + Sync + std::fmt::Debug {
    /// Registered strategy name.
    fn name(&self) -> &str;

    /// Shared configuration values.
    fn config(&self) -> &StrategyConfig;

    /// Decide whether a proposal becomes a position.
    fn evaluate_entry(
        &mut self,
        signal: &TechnicalSignals,
        context: &MarketContext,
        agent_recommendation: Option<&AgentRecommendation>,
    ) -> EntryDecision;

    /// Decide whether an unprotected position should be closed now.
    fn evaluate_exit(
        &mut self,
        position: &TrackedPosition,
        signal: &TechnicalSignals,
        context: &MarketContext,
    ) -> ExitDecision;

    /// Shares to trade given an allocation cap. Floored to whole shares.
    fn calculate_position_size(
        &self,
        signal: &TechnicalSignals,
        context: &MarketContext,
        max_amount: Decimal,
    ) -> u64 {
        if signal.price <= Decimal::ZERO {
            return 0;
        }
        let pct = Decimal::from_f64(self.config().max_position_pct).unwrap_or(Decimal::ZERO);
        let allocation = (context.account_equity * pct).min(max_amount);
        let shares = allocation / signal.price;
        shares.trunc().to_u64().unwrap_or(0)
    }

    /// Strategy-local state for the persisted engine snapshot.
    fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Object(serde_json::Map::new())
    }

    /// Restore strategy-local state from a persisted snapshot.
    fn restore(&mut self, _data: &serde_json::Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[derive(Debug)]
    struct Passive {
        config: StrategyConfig,
    }

    impl Strategy for Passive {
        fn name(&self) -> &str {
            "passive"
        }
        fn config(&self) -> &StrategyConfig {
            &self.config
        }
        fn evaluate_entry(
            &mut self,
            _signal: &TechnicalSignals,
            _context: &MarketContext,
            _agent: Option<&AgentRecommendation>,
        ) -> EntryDecision {
            EntryDecision::reject("passive")
        }
        fn evaluate_exit(
            &mut self,
            _position: &TrackedPosition,
            _signal: &TechnicalSignals,
            _context: &MarketContext,
        ) -> ExitDecision {
            ExitDecision::hold("passive")
        }
    }

    fn context() -> MarketContext {
        MarketContext {
            vix: MarketContext::NEUTRAL_VIX,
            market_status: MarketStatus::Open,
            account_equity: dec!(100_000),
            buying_power: dec!(50_000),
            existing_positions: HashSet::new(),
            cooldown_tickers: HashSet::new(),
        }
    }

    fn snapshot(symbol: &str, price: Decimal) -> TechnicalSignals {
        TechnicalSignals {
            symbol: symbol.to_string(),
            price,
            atr: dec!(2),
            momentum: 3.0,
            score: 0.7,
            rsi: 55.0,
            signals: vec![],
            bars: vec![],
        }
    }

    #[test]
    fn test_default_sizing_caps_at_equity_fraction() {
        let strategy = Passive {
            config: StrategyConfig::default(),
        };
        // 5% of 100k = 5k cap; 5k / 150 = 33.33 -> 33 shares
        let size = strategy.calculate_position_size(&snapshot("AAPL", dec!(150)), &context(), dec!(50_000));
        assert_eq!(size, 33);

        // Tighter max_amount wins.
        let size = strategy.calculate_position_size(&snapshot("AAPL", dec!(150)), &context(), dec!(1_500));
        assert_eq!(size, 10);

        // Zero price yields zero shares.
        let size = strategy.calculate_position_size(&snapshot("AAPL", dec!(0)), &context(), dec!(1_000));
        assert_eq!(size, 0);
    }

    #[test]
    fn test_basic_entry_filters() {
        let signal = snapshot("AAPL", dec!(150));

        let mut ctx = context();
        assert!(basic_entry_filters(&signal, &ctx).is_none());

        ctx.market_status = MarketStatus::Closed;
        assert!(basic_entry_filters(&signal, &ctx).unwrap().contains("closed"));

        let mut ctx = context();
        ctx.existing_positions.insert("AAPL".to_string());
        assert!(basic_entry_filters(&signal, &ctx).unwrap().contains("holding"));

        let mut ctx = context();
        ctx.cooldown_tickers.insert("AAPL".to_string());
        assert!(basic_entry_filters(&signal, &ctx).unwrap().contains("cooldown"));
    }

    #[test]
    fn test_config_validation() {
        assert!(StrategyConfig::default().validate().is_empty());

        let bad = StrategyConfig {
            max_position_pct: 0.0,
            catastrophic_momentum: -5.0,
            ..StrategyConfig::default()
        };
        let errors = bad.validate();
        assert_eq!(errors.len(), 2);
    }
}
