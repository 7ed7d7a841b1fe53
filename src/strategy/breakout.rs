//! Breakout strategy (autonomous mode).
//!
//! Looks for a tight consolidation window, then enters when price clears the
//! window's boundary on a volume spike. Stops sit one ATR beyond the opposite
//! boundary; targets are a multiple of the pattern height. Tickers that keep
//! producing false breakouts are blocked until the counter is cleared by a
//! winning trade.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::domain::{AgentRecommendation, Bar, Side, TechnicalSignals, Urgency};
use crate::execution::position_tracker::TrackedPosition;

use super::{
    basic_entry_filters, EntryDecision, ExitDecision, MarketContext, Strategy, StrategyConfig,
};

/// Configuration for the breakout strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutConfig {
    #[serde(flatten)]
    pub base: StrategyConfig,

    /// Bars in the consolidation window (current bar excluded).
    pub consolidation_periods: usize,
    /// Maximum high-low range of the window, as a fraction of support.
    pub max_consolidation_pct: f64,
    /// Required volume vs. the 50-bar average.
    pub volume_multiple: f64,
    /// Price buffer beyond the boundary before a break counts.
    pub breakout_buffer_pct: f64,
    /// Target distance as a multiple of pattern height.
    pub target_multiple: f64,
    /// Minimum ATR for the setup to be tradable.
    pub min_atr: Decimal,
    /// False breakouts tolerated per ticker before entries are blocked.
    pub max_false_breakouts: u32,
}

impl Default for BreakoutConfig {
    fn default() -> Self {
        Self {
            base: StrategyConfig {
                name: BreakoutStrategy::NAME.to_string(),
                description: "Consolidation breakout with volume confirmation".to_string(),
                ..StrategyConfig::default()
            },
            consolidation_periods: 20,
            max_consolidation_pct: 0.05,
            volume_multiple: 1.5,
            breakout_buffer_pct: 0.002,
            target_multiple: 2.0,
            min_atr: dec!(0.5),
            max_false_breakouts: 2,
        }
    }
}

/// Levels remembered for an open breakout position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BreakoutLevels {
    entry_price: Decimal,
    stop_loss: Decimal,
    target: Decimal,
    side: Side,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BreakoutState {
    false_breakout_count: HashMap<String, u32>,
    position_data: HashMap<String, BreakoutLevels>,
}

#[derive(Debug)]
pub struct BreakoutStrategy {
    config: BreakoutConfig,
    state: BreakoutState,
}

impl BreakoutStrategy {
    pub const NAME: &'static str = "breakout";
    const ATR_PERIOD: usize = 14;
    const VOLUME_WINDOW: usize = 50;

    pub fn new() -> Self {
        Self::with_config(BreakoutConfig::default())
    }

    pub fn with_config(config: BreakoutConfig) -> Self {
        Self {
            config,
            state: BreakoutState::default(),
        }
    }

    /// Average true range over the trailing period.
    fn calculate_atr(bars: &[Bar]) -> Decimal {
        if bars.len() < Self::ATR_PERIOD + 1 {
            return Decimal::ZERO;
        }
        let mut true_ranges = Vec::with_capacity(bars.len() - 1);
        for window in bars.windows(2) {
            let prev_close = window[0].close;
            let bar = &window[1];
            let tr = (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs());
            true_ranges.push(tr);
        }
        let tail = &true_ranges[true_ranges.len().saturating_sub(Self::ATR_PERIOD)..];
        let sum: Decimal = tail.iter().copied().sum();
        sum / Decimal::from(tail.len() as u64)
    }

    fn volume_ratio(bars: &[Bar]) -> f64 {
        let Some(latest) = bars.last() else { return 0.0 };
        let window = &bars[bars.len().saturating_sub(Self::VOLUME_WINDOW)..];
        let total: u64 = window.iter().map(|b| b.volume).sum();
        if window.is_empty() || total == 0 {
            return 0.0;
        }
        let avg = total as f64 / window.len() as f64;
        latest.volume as f64 / avg
    }

    fn record_false_breakout(&mut self, ticker: &str) {
        *self
            .state
            .false_breakout_count
            .entry(ticker.to_string())
            .or_insert(0) += 1;
    }

    fn clear_false_breakouts(&mut self, ticker: &str) {
        self.state.false_breakout_count.insert(ticker.to_string(), 0);
    }

    #[cfg(test)]
    fn false_breakouts(&self, ticker: &str) -> u32 {
        self.state
            .false_breakout_count
            .get(ticker)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        &self.config.base.name
    }

    fn config(&self) -> &StrategyConfig {
        &self.config.base
    }

    fn evaluate_entry(
        &mut self,
        signal: &TechnicalSignals,
        context: &MarketContext,
        agent_recommendation: Option<&AgentRecommendation>,
    ) -> EntryDecision {
        if let Some(reason) = basic_entry_filters(signal, context) {
            return EntryDecision::reject(reason);
        }

        let symbol = &signal.symbol;
        let price = signal.price;
        if price <= Decimal::ZERO {
            return EntryDecision::reject("invalid price");
        }

        let bars = &signal.bars;
        if bars.len() < self.config.consolidation_periods + 10 {
            return EntryDecision::reject(format!(
                "insufficient history: {} bars, need {}",
                bars.len(),
                self.config.consolidation_periods + 10
            ));
        }

        // Consolidation window excludes the current bar so the break itself
        // doesn't widen the range.
        let window = &bars[bars.len() - 1 - self.config.consolidation_periods..bars.len() - 1];
        let latest = bars.last().expect("non-empty history");
        let resistance = window.iter().map(|b| b.high).max().expect("window not empty");
        let support = window.iter().map(|b| b.low).min().expect("window not empty");

        if support <= Decimal::ZERO {
            return EntryDecision::reject("invalid support level");
        }
        let range_pct = (resistance - support) / support;
        let max_range =
            Decimal::from_f64(self.config.max_consolidation_pct).unwrap_or(Decimal::ZERO);
        if range_pct > max_range {
            return EntryDecision::reject(format!(
                "not consolidating: range {range_pct:.4} exceeds {max_range}"
            ));
        }

        let volume_ratio = Self::volume_ratio(bars);
        if volume_ratio < self.config.volume_multiple {
            return EntryDecision::reject(format!(
                "volume {:.1}x below required {:.1}x",
                volume_ratio, self.config.volume_multiple
            ));
        }

        let atr = Self::calculate_atr(bars);
        if atr < self.config.min_atr {
            return EntryDecision::reject(format!(
                "ATR {atr} below minimum {}",
                self.config.min_atr
            ));
        }

        let strikes = self
            .state
            .false_breakout_count
            .get(symbol)
            .copied()
            .unwrap_or(0);
        if strikes >= self.config.max_false_breakouts {
            return EntryDecision::reject(format!("{strikes} recent false breakouts"));
        }

        let buffer =
            price * Decimal::from_f64(self.config.breakout_buffer_pct).unwrap_or(Decimal::ZERO);
        let target_multiple =
            Decimal::from_f64(self.config.target_multiple).unwrap_or(Decimal::from(2));

        let (side, entry_price, stop_loss, target) = if latest.high > resistance + buffer {
            // Bullish break of the window high.
            if let Some(agent) = agent_recommendation {
                if agent.trade_type != Side::Long {
                    return EntryDecision::reject(format!(
                        "agent proposed {} but breakout is bullish",
                        agent.trade_type
                    ));
                }
                (Side::Long, agent.entry_price, agent.stop_loss, agent.target)
            } else {
                let pattern_height = price - support;
                (
                    Side::Long,
                    price,
                    support - atr,
                    price + pattern_height * target_multiple,
                )
            }
        } else if latest.low < support - buffer {
            // Bearish break of the window low.
            if let Some(agent) = agent_recommendation {
                if agent.trade_type != Side::Short {
                    return EntryDecision::reject(format!(
                        "agent proposed {} but breakout is bearish",
                        agent.trade_type
                    ));
                }
                (Side::Short, agent.entry_price, agent.stop_loss, agent.target)
            } else {
                let pattern_height = resistance - price;
                (
                    Side::Short,
                    price,
                    resistance + atr,
                    price - pattern_height * target_multiple,
                )
            }
        } else {
            return EntryDecision::reject("no breakout detected");
        };

        let size = match agent_recommendation {
            Some(agent) => agent.quantity,
            None => self.calculate_position_size(signal, context, context.buying_power),
        };
        if size == 0 {
            return EntryDecision::reject("position size rounds to zero");
        }

        self.state.position_data.insert(
            symbol.clone(),
            BreakoutLevels {
                entry_price,
                stop_loss,
                target,
                side,
            },
        );

        debug!(
            ticker = %symbol, %side, %entry_price, %stop_loss, %target, volume_ratio,
            "breakout setup"
        );

        let boundary = match side {
            Side::Long => resistance,
            Side::Short => support,
        };
        EntryDecision::enter(
            format!("{side} breakout past {boundary} with {volume_ratio:.1}x volume"),
            size,
            entry_price,
            stop_loss,
            target,
        )
    }

    fn evaluate_exit(
        &mut self,
        position: &TrackedPosition,
        signal: &TechnicalSignals,
        _context: &MarketContext,
    ) -> ExitDecision {
        let symbol = &position.ticker;
        let price = signal.price;
        if price <= Decimal::ZERO {
            return ExitDecision::hold("invalid price");
        }

        let Some(levels) = self.state.position_data.get(symbol).cloned() else {
            return ExitDecision::hold("no breakout levels recorded");
        };
        let is_long = levels.side == Side::Long;

        let stop_hit = if is_long {
            price <= levels.stop_loss
        } else {
            price >= levels.stop_loss
        };
        if stop_hit {
            self.record_false_breakout(symbol);
            self.state.position_data.remove(symbol);
            return ExitDecision::exit("stop_loss", Urgency::Immediate);
        }

        let target_hit = if is_long {
            price >= levels.target
        } else {
            price <= levels.target
        };
        if target_hit {
            self.clear_false_breakouts(symbol);
            self.state.position_data.remove(symbol);
            return ExitDecision::exit("target_reached", Urgency::Normal);
        }

        // Price back inside the consolidation window means the break failed.
        let bars = &signal.bars;
        if bars.len() > self.config.consolidation_periods {
            let window =
                &bars[bars.len() - 1 - self.config.consolidation_periods..bars.len() - 1];
            let resistance = window.iter().map(|b| b.high).max().expect("window not empty");
            let support = window.iter().map(|b| b.low).min().expect("window not empty");

            let failed = if is_long {
                price < resistance
            } else {
                price > support
            };
            if failed {
                self.state.position_data.remove(symbol);
                return ExitDecision::exit("breakout_failed", Urgency::Urgent);
            }
        }

        ExitDecision::hold("breakout intact")
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.state).unwrap_or_default()
    }

    fn restore(&mut self, data: &serde_json::Value) {
        self.state = serde_json::from_value(data.clone()).unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MarketStatus;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

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

    /// History that consolidates between 98 and 102 for `periods` bars, then
    /// appends `last` as the current bar.
    fn consolidating_bars(periods: usize, last: Bar) -> Vec<Bar> {
        let start = Utc::now() - Duration::days((periods + 20) as i64);
        let mut bars = Vec::new();
        for i in 0..periods + 19 {
            bars.push(Bar {
                timestamp: start + Duration::days(i as i64),
                open: dec!(100),
                high: dec!(102),
                low: dec!(98),
                close: dec!(100),
                volume: 1_000_000,
            });
        }
        bars.push(last);
        bars
    }

    fn bullish_break_bar() -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: dec!(101),
            high: dec!(105),
            low: dec!(100),
            close: dec!(104.5),
            volume: 2_500_000,
        }
    }

    fn snapshot_with_bars(bars: Vec<Bar>, price: Decimal) -> TechnicalSignals {
        TechnicalSignals {
            symbol: "AAPL".to_string(),
            price,
            atr: dec!(2),
            momentum: 4.0,
            score: 0.7,
            rsi: 58.0,
            signals: vec![],
            bars,
        }
    }

    #[test]
    fn test_bullish_breakout_levels() {
        let mut strategy = BreakoutStrategy::new();
        let bars = consolidating_bars(20, bullish_break_bar());
        let signal = snapshot_with_bars(bars, dec!(104.5));

        let decision = strategy.evaluate_entry(&signal, &context(), None);
        assert!(decision.should_enter, "rejected: {}", decision.reason);
        // Stop below support minus ATR.
        let stop = decision.stop_loss.unwrap();
        assert!(stop < dec!(98));
        // Target above entry by pattern height * multiple.
        let target = decision.target.unwrap();
        assert!(target > dec!(104.5));
        assert!(decision.suggested_size > 0);
    }

    #[test]
    fn test_rejects_when_not_consolidating() {
        let mut strategy = BreakoutStrategy::new();
        let mut bars = consolidating_bars(20, bullish_break_bar());
        // Blow out the range inside the window.
        let idx = bars.len() - 5;
        bars[idx].high = dec!(130);
        let signal = snapshot_with_bars(bars, dec!(104.5));

        let decision = strategy.evaluate_entry(&signal, &context(), None);
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("not consolidating"));
    }

    #[test]
    fn test_rejects_on_low_volume() {
        let mut strategy = BreakoutStrategy::new();
        let mut last = bullish_break_bar();
        last.volume = 1_000_000; // no spike
        let signal = snapshot_with_bars(consolidating_bars(20, last), dec!(104.5));

        let decision = strategy.evaluate_entry(&signal, &context(), None);
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("volume"));
    }

    #[test]
    fn test_agent_direction_mismatch_rejected() {
        let mut strategy = BreakoutStrategy::new();
        let signal = snapshot_with_bars(consolidating_bars(20, bullish_break_bar()), dec!(104.5));
        let short_agent = AgentRecommendation {
            entry_price: dec!(104),
            stop_loss: dec!(108),
            target: dec!(95),
            quantity: 50,
            trade_type: Side::Short,
        };

        let decision = strategy.evaluate_entry(&signal, &context(), Some(&short_agent));
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("bullish"));
    }

    #[test]
    fn test_agent_values_used_when_direction_matches() {
        let mut strategy = BreakoutStrategy::new();
        let signal = snapshot_with_bars(consolidating_bars(20, bullish_break_bar()), dec!(104.5));
        let agent = AgentRecommendation {
            entry_price: dec!(104.6),
            stop_loss: dec!(99.5),
            target: dec!(112),
            quantity: 42,
            trade_type: Side::Long,
        };

        let decision = strategy.evaluate_entry(&signal, &context(), Some(&agent));
        assert!(decision.should_enter);
        assert_eq!(decision.suggested_size, 42);
        assert_eq!(decision.entry_price, dec!(104.6));
        assert_eq!(decision.stop_loss, Some(dec!(99.5)));
        assert_eq!(decision.target, Some(dec!(112)));
    }

    #[test]
    fn test_false_breakout_counter_blocks_reentry() {
        let mut strategy = BreakoutStrategy::new();
        let ctx = context();
        let entry_signal =
            snapshot_with_bars(consolidating_bars(20, bullish_break_bar()), dec!(104.5));

        for round in 0..2 {
            let decision = strategy.evaluate_entry(&entry_signal, &ctx, None);
            assert!(decision.should_enter, "round {round}: {}", decision.reason);

            // Price collapses through the stop.
            let mut tracker = crate::execution::position_tracker::PositionTracker::default();
            tracker.add_position("AAPL", Side::Long, 10, dec!(104.5), "breakout", decision.stop_loss, decision.target, None);
            tracker.update_price("AAPL", dec!(90));
            let position = tracker.get("AAPL").unwrap().clone();
            let exit_signal =
                snapshot_with_bars(consolidating_bars(20, bullish_break_bar()), dec!(90));
            let exit = strategy.evaluate_exit(&position, &exit_signal, &ctx);
            assert!(exit.should_exit);
            assert_eq!(exit.urgency, Urgency::Immediate);
        }

        assert_eq!(strategy.false_breakouts("AAPL"), 2);
        let blocked = strategy.evaluate_entry(&entry_signal, &ctx, None);
        assert!(!blocked.should_enter);
        assert!(blocked.reason.contains("false breakouts"));
    }

    #[test]
    fn test_target_clears_counter() {
        let mut strategy = BreakoutStrategy::new();
        let ctx = context();
        strategy.record_false_breakout("AAPL");

        let entry_signal =
            snapshot_with_bars(consolidating_bars(20, bullish_break_bar()), dec!(104.5));
        let decision = strategy.evaluate_entry(&entry_signal, &ctx, None);
        assert!(decision.should_enter);

        let mut tracker = crate::execution::position_tracker::PositionTracker::default();
        tracker.add_position("AAPL", Side::Long, 10, dec!(104.5), "breakout", decision.stop_loss, decision.target, None);
        tracker.update_price("AAPL", dec!(130));
        let position = tracker.get("AAPL").unwrap().clone();
        let exit_signal = snapshot_with_bars(consolidating_bars(20, bullish_break_bar()), dec!(130));

        let exit = strategy.evaluate_exit(&position, &exit_signal, &ctx);
        assert!(exit.should_exit);
        assert_eq!(exit.reason, "target_reached");
        assert_eq!(strategy.false_breakouts("AAPL"), 0);
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut strategy = BreakoutStrategy::new();
        strategy.record_false_breakout("TSLA");
        strategy.state.position_data.insert(
            "AAPL".to_string(),
            BreakoutLevels {
                entry_price: dec!(104.5),
                stop_loss: dec!(96),
                target: dec!(117),
                side: Side::Long,
            },
        );

        let snapshot = strategy.snapshot();
        let mut restored = BreakoutStrategy::new();
        restored.restore(&snapshot);

        assert_eq!(restored.false_breakouts("TSLA"), 1);
        assert_eq!(
            restored.state.position_data.get("AAPL"),
            strategy.state.position_data.get("AAPL")
        );
    }
}
