//! Momentum strategy (validate mode).
//!
//! Entries arrive with an agent-proposed setup; this strategy only verifies
//! the technical picture supports it. On acceptance the agent's entry, stop,
//! target and quantity are used verbatim, never recomputed. Exits are a
//! safety net behind bracket orders: profitable positions are left to run
//! unless momentum or the composite score collapses.

use tracing::debug;

use crate::domain::{AgentRecommendation, Side, TechnicalSignals, Urgency};
use crate::execution::position_tracker::TrackedPosition;

use super::{
    basic_entry_filters, EntryDecision, ExitDecision, MarketContext, Strategy, StrategyConfig,
};

#[derive(Debug)]
pub struct MomentumStrategy {
    config: StrategyConfig,
    /// Score floor applied when the provider reports no breakout pattern.
    score_without_pattern: f64,
}

impl MomentumStrategy {
    pub const NAME: &'static str = "momentum";

    pub fn new() -> Self {
        Self::with_config(StrategyConfig {
            name: Self::NAME.to_string(),
            description: "Momentum swing trading with agent-proposed setups".to_string(),
            ..StrategyConfig::default()
        })
    }

    pub fn with_config(config: StrategyConfig) -> Self {
        Self {
            config,
            score_without_pattern: 0.75,
        }
    }

    /// Momentum in the direction of the trade: positive is favorable.
    fn directional_momentum(momentum: f64, side: Side) -> f64 {
        match side {
            Side::Long => momentum,
            Side::Short => -momentum,
        }
    }
}

impl Default for MomentumStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &StrategyConfig {
        &self.config
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

        let Some(agent) = agent_recommendation else {
            return EntryDecision::reject("no agent recommendation for trade setup");
        };
        if let Err(e) = agent.validate() {
            return EntryDecision::reject(e.to_string());
        }

        let side = agent.trade_type;
        let momentum = Self::directional_momentum(signal.momentum, side);
        if momentum < self.config.min_momentum {
            return EntryDecision::reject(format!(
                "momentum {:.1} below {:.1} for {} setup",
                momentum, self.config.min_momentum, side
            ));
        }

        let required_score = if signal.has_tag("breakout") {
            self.config.min_ta_score
        } else {
            self.score_without_pattern
        };
        if signal.score < required_score {
            return EntryDecision::reject(format!(
                "score {:.2} below required {:.2}",
                signal.score, required_score
            ));
        }

        if signal.is_weak(side) {
            return EntryDecision::reject("technicals marked weak");
        }

        debug!(
            ticker = %signal.symbol,
            momentum = signal.momentum,
            score = signal.score,
            "momentum setup validated, using agent levels"
        );

        // Agent has authority over the setup; strategy only validated it.
        EntryDecision::enter(
            format!(
                "momentum {:.1} and score {:.2} confirm {} setup",
                signal.momentum, signal.score, side
            ),
            agent.quantity,
            agent.entry_price,
            agent.stop_loss,
            agent.target,
        )
    }

    fn evaluate_exit(
        &mut self,
        position: &TrackedPosition,
        signal: &TechnicalSignals,
        _context: &MarketContext,
    ) -> ExitDecision {
        let momentum = Self::directional_momentum(signal.momentum, position.side);

        // Catastrophic reversal exits immediately, profitable or not.
        if momentum < self.config.catastrophic_momentum {
            return ExitDecision::exit(
                format!("catastrophic momentum {:.1}%", momentum),
                Urgency::Immediate,
            );
        }

        let score_collapsed = match position.side {
            Side::Long => signal.score < self.config.exit_score_threshold,
            Side::Short => signal.score > 1.0 - self.config.exit_score_threshold,
        };

        if position.is_profitable() {
            // Let winners run; only a major reversal cuts them short.
            if momentum < self.config.exit_momentum_threshold {
                return ExitDecision::exit(
                    format!("major momentum reversal {:.1}%", momentum),
                    Urgency::Urgent,
                );
            }
            if score_collapsed {
                return ExitDecision::exit(
                    format!("technical score collapse {:.2}", signal.score),
                    Urgency::Normal,
                );
            }
        } else {
            // Cut losses only on confirmed weakness.
            let weak = signal.is_weak(position.side);
            if momentum < self.config.exit_momentum_threshold && weak {
                return ExitDecision::exit(
                    format!("momentum {:.1}% with weak technicals", momentum),
                    Urgency::Urgent,
                );
            }
            if score_collapsed && weak {
                return ExitDecision::exit(
                    format!("score {:.2} with weak technicals", signal.score),
                    Urgency::Normal,
                );
            }
        }

        ExitDecision::hold("exit conditions not met")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MarketStatus;
    use rust_decimal::Decimal;
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

    fn snapshot(momentum: f64, score: f64, tags: &[&str]) -> TechnicalSignals {
        TechnicalSignals {
            symbol: "AAPL".to_string(),
            price: dec!(150),
            atr: dec!(2.5),
            momentum,
            score,
            rsi: 55.0,
            signals: tags.iter().map(|t| t.to_string()).collect(),
            bars: vec![],
        }
    }

    fn agent_long() -> AgentRecommendation {
        AgentRecommendation {
            entry_price: dec!(150),
            stop_loss: dec!(145),
            target: dec!(165),
            quantity: 100,
            trade_type: Side::Long,
        }
    }

    fn position(side: Side, entry: Decimal, current: Decimal) -> TrackedPosition {
        let mut tracker = crate::execution::position_tracker::PositionTracker::default();
        tracker.add_position("AAPL", side, 100, entry, "momentum", Some(dec!(145)), Some(dec!(165)), None);
        tracker.update_price("AAPL", current);
        tracker.get("AAPL").unwrap().clone()
    }

    #[test]
    fn test_entry_uses_agent_values_verbatim() {
        let mut strategy = MomentumStrategy::new();
        let decision = strategy.evaluate_entry(
            &snapshot(5.0, 0.75, &["breakout"]),
            &context(),
            Some(&agent_long()),
        );

        assert!(decision.should_enter);
        assert_eq!(decision.suggested_size, 100);
        assert_eq!(decision.entry_price, dec!(150));
        assert_eq!(decision.stop_loss, Some(dec!(145)));
        assert_eq!(decision.target, Some(dec!(165)));
    }

    #[test]
    fn test_entry_requires_agent() {
        let mut strategy = MomentumStrategy::new();
        let decision = strategy.evaluate_entry(&snapshot(5.0, 0.9, &[]), &context(), None);
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("agent"));
    }

    #[test]
    fn test_entry_rejects_weak_momentum() {
        let mut strategy = MomentumStrategy::new();
        let decision = strategy.evaluate_entry(
            &snapshot(-10.0, 0.9, &["breakout"]),
            &context(),
            Some(&agent_long()),
        );
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("momentum"));
    }

    #[test]
    fn test_score_threshold_raised_without_pattern() {
        let mut strategy = MomentumStrategy::new();
        // 0.70 passes with a breakout tag (floor 0.6)...
        let with_pattern = strategy.evaluate_entry(
            &snapshot(5.0, 0.70, &["breakout"]),
            &context(),
            Some(&agent_long()),
        );
        assert!(with_pattern.should_enter);

        // ...but not without one (floor 0.75).
        let without_pattern =
            strategy.evaluate_entry(&snapshot(5.0, 0.70, &[]), &context(), Some(&agent_long()));
        assert!(!without_pattern.should_enter);
    }

    #[test]
    fn test_entry_rejects_weak_technicals() {
        let mut strategy = MomentumStrategy::new();
        let decision = strategy.evaluate_entry(
            &snapshot(5.0, 0.9, &["breakout", "weak_trend"]),
            &context(),
            Some(&agent_long()),
        );
        assert!(!decision.should_enter);
        assert!(decision.reason.contains("weak"));
    }

    #[test]
    fn test_profitable_position_holds_through_noise() {
        let mut strategy = MomentumStrategy::new();
        let winner = position(Side::Long, dec!(150), dec!(160));
        let decision = strategy.evaluate_exit(&winner, &snapshot(-5.0, 0.6, &[]), &context());
        assert!(!decision.should_exit);
    }

    #[test]
    fn test_profitable_exit_on_major_reversal() {
        let mut strategy = MomentumStrategy::new();
        let winner = position(Side::Long, dec!(150), dec!(160));
        let decision = strategy.evaluate_exit(&winner, &snapshot(-16.0, 0.6, &[]), &context());
        assert!(decision.should_exit);
        assert_eq!(decision.urgency, Urgency::Urgent);
    }

    #[test]
    fn test_catastrophic_momentum_exits_immediately() {
        let mut strategy = MomentumStrategy::new();
        let winner = position(Side::Long, dec!(150), dec!(160));
        let decision = strategy.evaluate_exit(&winner, &snapshot(-26.0, 0.9, &[]), &context());
        assert!(decision.should_exit);
        assert_eq!(decision.urgency, Urgency::Immediate);
    }

    #[test]
    fn test_losing_exit_requires_confirmation() {
        let mut strategy = MomentumStrategy::new();
        let loser = position(Side::Long, dec!(150), dec!(144));

        // Momentum breach alone is not enough.
        let unconfirmed = strategy.evaluate_exit(&loser, &snapshot(-16.0, 0.6, &[]), &context());
        assert!(!unconfirmed.should_exit);

        // Breach plus weak technicals exits.
        let confirmed =
            strategy.evaluate_exit(&loser, &snapshot(-16.0, 0.6, &["weak_trend"]), &context());
        assert!(confirmed.should_exit);
        assert_eq!(confirmed.urgency, Urgency::Urgent);
    }

    #[test]
    fn test_short_side_mirrors_momentum() {
        let mut strategy = MomentumStrategy::new();
        // Short position profits as price falls; rising momentum is adverse.
        let short_winner = position(Side::Short, dec!(150), dec!(140));
        let decision = strategy.evaluate_exit(&short_winner, &snapshot(16.0, 0.5, &[]), &context());
        assert!(decision.should_exit);
        assert_eq!(decision.urgency, Urgency::Urgent);

        let calm = strategy.evaluate_exit(&short_winner, &snapshot(-2.0, 0.5, &[]), &context());
        assert!(!calm.should_exit);
    }
}
