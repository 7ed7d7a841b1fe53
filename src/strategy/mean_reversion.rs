//! Mean-reversion strategy (autonomous mode).
//!
//! Fades extremes: long when RSI is oversold and price has pushed below the
//! lower Bollinger band, short at the mirrored overbought extreme. Targets
//! the middle band; stops sit a configurable number of standard deviations
//! away. Positions also age out after a maximum hold duration.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::domain::{AgentRecommendation, Side, TechnicalSignals, Urgency};
use crate::execution::position_tracker::TrackedPosition;

use super::{
    basic_entry_filters, EntryDecision, ExitDecision, MarketContext, Strategy, StrategyConfig,
};

/// Configuration for the mean-reversion strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionConfig {
    #[serde(flatten)]
    pub base: StrategyConfig,

    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    /// RSI level treated as "normalized" for exits.
    pub rsi_exit_threshold: f64,
    pub bb_period: usize,
    pub bb_std: f64,
    pub mean_period: usize,
    /// Standard deviations from the mean required to enter.
    pub deviation_threshold: f64,
    /// Fraction of buying power risked per trade.
    pub risk_pct_per_trade: f64,
    pub max_hold_hours: i64,
    /// Stop distance in standard deviations.
    pub stop_loss_std: f64,
    pub min_volume_ratio: f64,
    pub trend_filter_period: usize,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        Self {
            base: StrategyConfig {
                name: MeanReversionStrategy::NAME.to_string(),
                description: "Mean reversion on RSI and Bollinger extremes".to_string(),
                ..StrategyConfig::default()
            },
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            rsi_exit_threshold: 50.0,
            bb_period: 20,
            bb_std: 2.0,
            mean_period: 20,
            deviation_threshold: 2.0,
            risk_pct_per_trade: 0.015,
            max_hold_hours: 48,
            stop_loss_std: 3.0,
            min_volume_ratio: 1.2,
            trend_filter_period: 50,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MeanReversionState {
    entry_times: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug)]
pub struct MeanReversionStrategy {
    config: MeanReversionConfig,
    state: MeanReversionState,
}

impl MeanReversionStrategy {
    pub const NAME: &'static str = "mean_reversion";
    const VOLUME_WINDOW: usize = 50;

    pub fn new() -> Self {
        Self::with_config(MeanReversionConfig::default())
    }

    pub fn with_config(config: MeanReversionConfig) -> Self {
        Self {
            config,
            state: MeanReversionState::default(),
        }
    }

    fn sma(values: &[f64], period: usize) -> f64 {
        let window = &values[values.len().saturating_sub(period)..];
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }

    fn stddev(values: &[f64], period: usize) -> f64 {
        let window = &values[values.len().saturating_sub(period)..];
        if window.len() < 2 {
            return 0.0;
        }
        let mean = window.iter().sum::<f64>() / window.len() as f64;
        let variance =
            window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window.len() - 1) as f64;
        variance.sqrt()
    }

    /// Simple-average RSI over the trailing period.
    fn rsi(closes: &[f64], period: usize) -> f64 {
        if closes.len() < period + 1 {
            return 50.0;
        }
        let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
        let tail = &deltas[deltas.len() - period..];
        let gain: f64 = tail.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
        let loss: f64 = -tail.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;
        if loss == 0.0 {
            return 100.0;
        }
        let rs = gain / loss;
        100.0 - (100.0 / (1.0 + rs))
    }

    fn closes(signal: &TechnicalSignals) -> Vec<f64> {
        signal
            .bars
            .iter()
            .map(|b| b.close.to_f64().unwrap_or(0.0))
            .collect()
    }
}

impl Default for MeanReversionStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MeanReversionStrategy {
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
        _agent_recommendation: Option<&AgentRecommendation>,
    ) -> EntryDecision {
        if let Some(reason) = basic_entry_filters(signal, context) {
            return EntryDecision::reject(reason);
        }

        let required = self
            .config
            .rsi_period
            .max(self.config.bb_period)
            .max(self.config.trend_filter_period)
            + 10;
        if signal.bars.len() < required {
            return EntryDecision::reject(format!(
                "insufficient history: {} bars, need {required}",
                signal.bars.len()
            ));
        }

        let closes = Self::closes(signal);
        let price = signal.price.to_f64().unwrap_or(0.0);
        if price <= 0.0 {
            return EntryDecision::reject("invalid price");
        }

        let rsi = Self::rsi(&closes, self.config.rsi_period);
        let middle = Self::sma(&closes, self.config.bb_period);
        let std = Self::stddev(&closes, self.config.bb_period);
        let upper = middle + std * self.config.bb_std;
        let lower = middle - std * self.config.bb_std;

        let mean = Self::sma(&closes, self.config.mean_period);
        let mean_std = Self::stddev(&closes, self.config.mean_period);
        let z_score = if mean_std > 0.0 {
            (price - mean) / mean_std
        } else {
            0.0
        };

        let latest_volume = signal.bars.last().map(|b| b.volume).unwrap_or(0);
        let window = &signal.bars[signal.bars.len().saturating_sub(Self::VOLUME_WINDOW)..];
        let avg_volume =
            window.iter().map(|b| b.volume).sum::<u64>() as f64 / window.len().max(1) as f64;
        let volume_ratio = if avg_volume > 0.0 {
            latest_volume as f64 / avg_volume
        } else {
            0.0
        };
        if volume_ratio < self.config.min_volume_ratio {
            return EntryDecision::reject(format!(
                "volume ratio {volume_ratio:.2} below {}",
                self.config.min_volume_ratio
            ));
        }

        let sma_long = Self::sma(&closes, self.config.trend_filter_period);
        let sma_short = Self::sma(&closes, 20);
        let trend_strength = if sma_long > 0.0 {
            (sma_short - sma_long) / sma_long
        } else {
            0.0
        };

        let oversold = rsi < self.config.rsi_oversold
            && price < lower
            && z_score < -self.config.deviation_threshold
            && trend_strength > -0.10;
        let overbought = rsi > self.config.rsi_overbought
            && price > upper
            && z_score > self.config.deviation_threshold
            && trend_strength < 0.10;

        let (side, stop_f64) = if oversold {
            (Side::Long, price - std * self.config.stop_loss_std)
        } else if overbought {
            (Side::Short, price + std * self.config.stop_loss_std)
        } else {
            let mut reasons = Vec::new();
            if (self.config.rsi_oversold..=self.config.rsi_overbought).contains(&rsi) {
                reasons.push(format!("RSI neutral ({rsi:.1})"));
            }
            if price >= lower && price <= upper {
                reasons.push("price within bands".to_string());
            }
            if z_score.abs() < self.config.deviation_threshold {
                reasons.push(format!("z-score within threshold ({z_score:.2})"));
            }
            if trend_strength <= -0.10 {
                reasons.push(format!("strong downtrend ({trend_strength:.1})"));
            }
            if trend_strength >= 0.10 {
                reasons.push(format!("strong uptrend ({trend_strength:.1})"));
            }
            return EntryDecision::reject(reasons.join("; "));
        };

        let stop_loss = Decimal::from_f64(stop_f64).unwrap_or(Decimal::ZERO).round_dp(4);
        let target = Decimal::from_f64(middle).unwrap_or(Decimal::ZERO).round_dp(4);
        let risk = Decimal::from_f64(self.config.risk_pct_per_trade).unwrap_or(Decimal::ZERO);
        let size = self.calculate_position_size(signal, context, context.buying_power * risk);
        if size == 0 {
            return EntryDecision::reject("position size rounds to zero");
        }

        self.state
            .entry_times
            .insert(signal.symbol.clone(), Utc::now());

        debug!(
            ticker = %signal.symbol, %side, rsi, z_score, %stop_loss, %target,
            "mean reversion setup"
        );

        let condition = match side {
            Side::Long => "oversold",
            Side::Short => "overbought",
        };
        EntryDecision::enter(
            format!("{condition}: RSI={rsi:.1}, z-score={z_score:.2}, outside band"),
            size,
            signal.price,
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
        let closes = Self::closes(signal);
        let price = signal.price.to_f64().unwrap_or(0.0);
        if price <= 0.0 || closes.len() < self.config.bb_period {
            return ExitDecision::hold("insufficient data");
        }

        let entry = position.avg_entry_price.to_f64().unwrap_or(0.0);
        let middle = Self::sma(&closes, self.config.bb_period);
        let std = Self::stddev(&closes, self.config.bb_period);
        let rsi = Self::rsi(&closes, self.config.rsi_period);
        let is_long = position.side == Side::Long;

        // Stop: configured deviations against the entry.
        let stop_breached = if is_long {
            price <= entry - std * self.config.stop_loss_std
        } else {
            price >= entry + std * self.config.stop_loss_std
        };
        if stop_breached {
            self.state.entry_times.remove(&position.ticker);
            return ExitDecision::exit("stop_loss", Urgency::Immediate);
        }

        // Target: reversion to the middle band.
        let reverted = if is_long { price >= middle } else { price <= middle };
        if reverted {
            self.state.entry_times.remove(&position.ticker);
            return ExitDecision::exit("target_reached", Urgency::Normal);
        }

        // RSI normalized around the exit threshold.
        let normalized = rsi > self.config.rsi_oversold
            && rsi < self.config.rsi_overbought
            && (rsi - self.config.rsi_exit_threshold).abs() < 5.0;
        if normalized {
            self.state.entry_times.remove(&position.ticker);
            return ExitDecision::exit("rsi_normalized", Urgency::Normal);
        }

        // Age out stale positions.
        let entered = self
            .state
            .entry_times
            .get(&position.ticker)
            .copied()
            .unwrap_or(position.opened_at);
        if Utc::now() - entered > Duration::hours(self.config.max_hold_hours) {
            self.state.entry_times.remove(&position.ticker);
            return ExitDecision::exit("max_hold_exceeded", Urgency::Normal);
        }

        ExitDecision::hold("reversion still in progress")
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
    use crate::domain::{Bar, MarketStatus};
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

    /// Flat history around 100 with a final plunge (or spike) bar.
    fn bars_with_final(close: Decimal, volume: u64) -> Vec<Bar> {
        let start = Utc::now() - Duration::days(70);
        let mut bars = Vec::new();
        for i in 0..64 {
            // Gentle oscillation so stddev is nonzero.
            let wiggle = if i % 2 == 0 { dec!(0.8) } else { dec!(-0.8) };
            let c = dec!(100) + wiggle;
            bars.push(Bar {
                timestamp: start + Duration::days(i),
                open: c,
                high: c + dec!(0.5),
                low: c - dec!(0.5),
                close: c,
                volume: 1_000_000,
            });
        }
        bars.push(Bar {
            timestamp: Utc::now(),
            open: dec!(99),
            high: dec!(100),
            low: close - dec!(0.5),
            close,
            volume,
        });
        bars
    }

    fn snapshot(price: Decimal, bars: Vec<Bar>) -> TechnicalSignals {
        TechnicalSignals {
            symbol: "XOM".to_string(),
            price,
            atr: dec!(1.5),
            momentum: -2.0,
            score: 0.5,
            rsi: 25.0,
            signals: vec![],
            bars,
        }
    }

    #[test]
    fn test_oversold_entry_goes_long() {
        let mut strategy = MeanReversionStrategy::new();
        // Deep plunge on heavy volume: RSI crushed, price far below the band.
        let signal = snapshot(dec!(82), bars_with_final(dec!(82), 3_000_000));

        let decision = strategy.evaluate_entry(&signal, &context(), None);
        assert!(decision.should_enter, "rejected: {}", decision.reason);
        assert!(decision.reason.contains("oversold"));
        let stop = decision.stop_loss.unwrap();
        assert!(stop < dec!(82));
        // Target is the middle band, above the entry.
        assert!(decision.target.unwrap() > dec!(82));
    }

    #[test]
    fn test_neutral_conditions_rejected() {
        let mut strategy = MeanReversionStrategy::new();
        let signal = snapshot(dec!(100), bars_with_final(dec!(100), 3_000_000));

        let decision = strategy.evaluate_entry(&signal, &context(), None);
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("within"));
    }

    #[test]
    fn test_low_volume_rejected() {
        let mut strategy = MeanReversionStrategy::new();
        let signal = snapshot(dec!(82), bars_with_final(dec!(82), 900_000));

        let decision = strategy.evaluate_entry(&signal, &context(), None);
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("volume"));
    }

    #[test]
    fn test_exit_on_reversion_to_mean() {
        let mut strategy = MeanReversionStrategy::new();
        let mut tracker = crate::execution::position_tracker::PositionTracker::default();
        tracker.add_position("XOM", Side::Long, 10, dec!(90), "mean_reversion", Some(dec!(85)), Some(dec!(100)), None);
        tracker.update_price("XOM", dec!(101));
        let position = tracker.get("XOM").unwrap().clone();

        // Price back above the ~100 middle band.
        let signal = snapshot(dec!(101), bars_with_final(dec!(101), 1_000_000));
        let decision = strategy.evaluate_exit(&position, &signal, &context());
        assert!(decision.should_exit);
        assert_eq!(decision.reason, "target_reached");
    }

    #[test]
    fn test_exit_on_stop_breach() {
        let mut strategy = MeanReversionStrategy::new();
        let mut tracker = crate::execution::position_tracker::PositionTracker::default();
        tracker.add_position("XOM", Side::Long, 10, dec!(90), "mean_reversion", Some(dec!(85)), Some(dec!(100)), None);
        tracker.update_price("XOM", dec!(60));
        let position = tracker.get("XOM").unwrap().clone();

        let signal = snapshot(dec!(60), bars_with_final(dec!(60), 1_000_000));
        let decision = strategy.evaluate_exit(&position, &signal, &context());
        assert!(decision.should_exit);
        assert_eq!(decision.reason, "stop_loss");
        assert_eq!(decision.urgency, Urgency::Immediate);
    }

    #[test]
    fn test_max_hold_ages_out() {
        let mut strategy = MeanReversionStrategy::new();
        strategy
            .state
            .entry_times
            .insert("XOM".to_string(), Utc::now() - Duration::hours(72));

        let mut tracker = crate::execution::position_tracker::PositionTracker::default();
        tracker.add_position("XOM", Side::Long, 10, dec!(95), "mean_reversion", Some(dec!(85)), Some(dec!(100)), None);
        tracker.update_price("XOM", dec!(94));
        let position = tracker.get("XOM").unwrap().clone();

        // Still below the mean, stop intact, RSI not normalized: only age
        // forces the exit.
        let signal = snapshot(dec!(94), bars_with_final(dec!(94), 1_000_000));
        let decision = strategy.evaluate_exit(&position, &signal, &context());
        assert!(decision.should_exit);
        assert_eq!(decision.reason, "max_hold_exceeded");
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let mut strategy = MeanReversionStrategy::new();
        let entered = Utc::now();
        strategy.state.entry_times.insert("XOM".to_string(), entered);

        let snapshot = strategy.snapshot();
        let mut restored = MeanReversionStrategy::new();
        restored.restore(&snapshot);
        assert_eq!(restored.state.entry_times.get("XOM"), Some(&entered));
    }
}
