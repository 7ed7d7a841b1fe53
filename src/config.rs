//! Application configuration.
//!
//! Layered: a TOML file (optional) overlaid with `TRADEWIND_`-prefixed
//! environment variables. Every field has a default so a bare `tradewind run`
//! works against the paper broker.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::execution::EngineConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub strategy: StrategySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Seconds between cycles.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Deadline margin subtracted from the interval.
    #[serde(default = "default_cycle_margin_secs")]
    pub cycle_margin_secs: u64,
    /// Per-call broker timeout.
    #[serde(default = "default_broker_timeout_secs")]
    pub broker_timeout_secs: u64,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_signals")]
    pub max_signals: usize,
    /// Default TTL for queued signals, in hours.
    #[serde(default = "default_signal_ttl_hours")]
    pub signal_ttl_hours: i64,
    /// Signal cache TTL, in seconds.
    #[serde(default = "default_signal_cache_ttl_secs")]
    pub signal_cache_ttl_secs: i64,
    /// Cooldown applied after exits and reject streaks, in hours.
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
    /// Broker rejects per ticker within an hour before a cooldown.
    #[serde(default = "default_max_rejects")]
    pub max_rejects_before_cooldown: usize,
    /// Skip order submission, emit dry_run events instead.
    #[serde(default)]
    pub analyze_mode: bool,
    /// Persisted state file.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Paper-broker starting cash.
    #[serde(default = "default_paper_cash")]
    pub paper_cash: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            cycle_margin_secs: default_cycle_margin_secs(),
            broker_timeout_secs: default_broker_timeout_secs(),
            max_positions: default_max_positions(),
            max_signals: default_max_signals(),
            signal_ttl_hours: default_signal_ttl_hours(),
            signal_cache_ttl_secs: default_signal_cache_ttl_secs(),
            cooldown_hours: default_cooldown_hours(),
            max_rejects_before_cooldown: default_max_rejects(),
            analyze_mode: false,
            state_path: default_state_path(),
            paper_cash: default_paper_cash(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategySection {
    /// Registered strategy name to trade with.
    #[serde(default = "default_strategy_name")]
    pub name: String,
    /// Strategy-specific parameter overrides, passed to the registry.
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

impl Default for StrategySection {
    fn default() -> Self {
        Self {
            name: default_strategy_name(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// tracing env-filter directive, e.g. "info" or "tradewind=debug".
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_check_interval_secs() -> u64 {
    120
}
fn default_cycle_margin_secs() -> u64 {
    10
}
fn default_broker_timeout_secs() -> u64 {
    30
}
fn default_max_positions() -> usize {
    10
}
fn default_max_signals() -> usize {
    100
}
fn default_signal_ttl_hours() -> i64 {
    4
}
fn default_signal_cache_ttl_secs() -> i64 {
    300
}
fn default_cooldown_hours() -> i64 {
    3
}
fn default_max_rejects() -> usize {
    3
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./engine-state.json")
}
fn default_paper_cash() -> u64 {
    100_000
}
fn default_strategy_name() -> String {
    "momentum".to_string()
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load from an optional file plus `TRADEWIND_*` environment overrides
    /// (e.g. `TRADEWIND_ENGINE__MAX_POSITIONS=5`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name("tradewind").required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("TRADEWIND").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Translate the engine section into the engine's own config type.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            check_interval: Duration::from_secs(self.engine.check_interval_secs),
            cycle_margin: Duration::from_secs(self.engine.cycle_margin_secs),
            broker_timeout: Duration::from_secs(self.engine.broker_timeout_secs),
            max_positions: self.engine.max_positions,
            max_signals: self.engine.max_signals,
            signal_ttl: chrono::Duration::hours(self.engine.signal_ttl_hours),
            signal_cache_ttl: chrono::Duration::seconds(self.engine.signal_cache_ttl_secs),
            cooldown: chrono::Duration::hours(self.engine.cooldown_hours),
            max_rejects_before_cooldown: self.engine.max_rejects_before_cooldown,
            reject_window: chrono::Duration::hours(1),
            analyze_mode: self.engine.analyze_mode,
            state_path: self.engine.state_path.clone(),
        }
    }
}
