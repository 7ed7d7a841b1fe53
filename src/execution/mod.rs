//! Execution core: queue, positions, cooldowns, orders, cache, persistence,
//! and the engine loop that ties them together.

pub mod cooldown;
pub mod engine;
pub mod order_manager;
pub mod position_tracker;
pub mod signal_cache;
pub mod signal_queue;
pub mod state;

pub use cooldown::{Cooldown, CooldownManager};
pub use engine::{CycleSummary, EngineConfig, EngineStatus, ExecutionEngine};
pub use order_manager::{OrderManager, OrderManagerConfig, OrderParams, SubmitOutcome};
pub use position_tracker::{PositionTracker, SyncReport, TrackedPosition};
pub use signal_cache::SignalCache;
pub use signal_queue::{Admission, PendingSignal, RejectReason, SignalQueue};
pub use state::{EngineState, StateStore, STATE_VERSION};
