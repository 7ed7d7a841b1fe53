//! Registry of available strategies.
//!
//! Strategies register a factory keyed by name. `get` hands out a cached
//! shared instance built with default configuration; `get_with_config` builds
//! a fresh instance from strategy-specific parameters supplied as JSON.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Result, TradewindError};

use super::{
    BreakoutConfig, BreakoutStrategy, MeanReversionConfig, MeanReversionStrategy,
    MomentumStrategy, Strategy, StrategyConfig,
};

/// A strategy instance shared between the engine and its owner.
pub type SharedStrategy = Arc<Mutex<Box<dyn Strategy>>>;

/// Builds a strategy, optionally from custom JSON parameters.
pub type StrategyFactory =
    Box<dyn Fn(Option<&serde_json::Value>) -> Result<Box<dyn Strategy>> + Send + Sync>;

pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
    instances: Mutex<HashMap<String, SharedStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the built-in strategies.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register(MomentumStrategy::NAME, |config| {
            let strategy = match config {
                Some(value) => {
                    let parsed: StrategyConfig = serde_json::from_value(value.clone())?;
                    MomentumStrategy::with_config(parsed)
                }
                None => MomentumStrategy::new(),
            };
            Ok(Box::new(strategy))
        });

        registry.register(BreakoutStrategy::NAME, |config| {
            let strategy = match config {
                Some(value) => {
                    let parsed: BreakoutConfig = serde_json::from_value(value.clone())?;
                    BreakoutStrategy::with_config(parsed)
                }
                None => BreakoutStrategy::new(),
            };
            Ok(Box::new(strategy))
        });

        registry.register(MeanReversionStrategy::NAME, |config| {
            let strategy = match config {
                Some(value) => {
                    let parsed: MeanReversionConfig = serde_json::from_value(value.clone())?;
                    MeanReversionStrategy::with_config(parsed)
                }
                None => MeanReversionStrategy::new(),
            };
            Ok(Box::new(strategy))
        });

        registry
    }

    /// Register a strategy factory under a unique name.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Option<&serde_json::Value>) -> Result<Box<dyn Strategy>> + Send + Sync + 'static,
    {
        debug!(name, "strategy registered");
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Cached default-config instance for `name`.
    pub fn get(&self, name: &str) -> Result<SharedStrategy> {
        let mut instances = self.instances.lock().expect("instance lock");
        if let Some(instance) = instances.get(name) {
            return Ok(instance.clone());
        }

        let instance = Arc::new(Mutex::new(self.build(name, None)?));
        instances.insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// Fresh instance built from custom parameters. Never cached.
    pub fn get_with_config(&self, name: &str, config: &serde_json::Value) -> Result<SharedStrategy> {
        Ok(Arc::new(Mutex::new(self.build(name, Some(config))?)))
    }

    /// Registered strategy names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn build(&self, name: &str, config: Option<&serde_json::Value>) -> Result<Box<dyn Strategy>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            TradewindError::UnknownStrategy(format!(
                "{name}; available: {}",
                self.list().join(", ")
            ))
        })?;
        factory(config)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_registered() {
        let registry = StrategyRegistry::builtin();
        assert_eq!(
            registry.list(),
            vec!["breakout", "mean_reversion", "momentum"]
        );
    }

    #[test]
    fn test_unknown_strategy_fails() {
        let registry = StrategyRegistry::builtin();
        let err = registry.get("scalper").unwrap_err();
        assert!(matches!(err, TradewindError::UnknownStrategy(_)));
    }

    #[test]
    fn test_default_instances_cached() {
        let registry = StrategyRegistry::builtin();
        let first = registry.get("momentum").unwrap();
        let second = registry.get("momentum").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_custom_config_builds_fresh_instance() {
        let registry = StrategyRegistry::builtin();
        let cached = registry.get("breakout").unwrap();

        let custom = registry
            .get_with_config(
                "breakout",
                &json!({
                    "name": "breakout",
                    "description": "custom",
                    "max_position_pct": 0.10,
                    "min_ta_score": 0.6,
                    "min_momentum": -3.0,
                    "exit_momentum_threshold": -15.0,
                    "exit_score_threshold": 0.3,
                    "catastrophic_momentum": -25.0,
                    "cooldown_hours": 3,
                    "consolidation_periods": 10,
                    "max_consolidation_pct": 0.08,
                    "volume_multiple": 1.2,
                    "breakout_buffer_pct": 0.002,
                    "target_multiple": 3.0,
                    "min_atr": "0.5",
                    "max_false_breakouts": 1
                }),
            )
            .unwrap();

        assert!(!Arc::ptr_eq(&cached, &custom));
        let strategy = custom.lock().unwrap();
        assert_eq!(strategy.config().max_position_pct, 0.10);
    }

    #[test]
    fn test_bad_config_surfaces_error() {
        let registry = StrategyRegistry::builtin();
        let err = registry
            .get_with_config("momentum", &json!({"name": 42}))
            .unwrap_err();
        assert!(matches!(err, TradewindError::Json(_)));
    }
}
