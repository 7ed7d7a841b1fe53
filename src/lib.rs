pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod execution;
pub mod signals;
pub mod strategy;

pub use config::AppConfig;
pub use error::{Result, TradewindError};
pub use events::{EngineEvent, EventBus};
pub use execution::{
    CycleSummary, EngineConfig, EngineStatus, ExecutionEngine, PendingSignal, TrackedPosition,
};
pub use strategy::{Strategy, StrategyRegistry};
