//! Engine event taxonomy and the event bus.
//!
//! Every observable state transition in the execution core is published as a
//! typed event carrying a UTC timestamp. The bus renders each event through
//! `tracing` for operators, invokes registered handlers synchronously, and
//! fans out over a broadcast channel for async consumers (analytics sinks,
//! test harnesses).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::{Side, TradeAction, Urgency};

/// Which mechanism closed a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitMechanism {
    /// Broker-managed bracket leg triggered.
    BracketOrder,
    /// Strategy-driven close submitted by the engine.
    DynamicExit,
}

/// Typed engine event. Serialized with an `event_type` discriminant so logs
/// written as JSON lines stay machine-readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EngineEvent {
    ScanComplete {
        timestamp: DateTime<Utc>,
        source: String,
        tickers_found: Vec<String>,
        duration_ms: u64,
    },
    SignalAccepted {
        timestamp: DateTime<Utc>,
        ticker: String,
        action: TradeAction,
        priority: i32,
        source: String,
    },
    SignalRejected {
        timestamp: DateTime<Utc>,
        ticker: String,
        reason: String,
    },
    SignalExpired {
        timestamp: DateTime<Utc>,
        ticker: String,
        created_at: DateTime<Utc>,
    },
    EntryTriggered {
        timestamp: DateTime<Utc>,
        ticker: String,
        strategy: String,
        side: Side,
        quantity: u64,
        entry_price: Decimal,
        stop_loss: Decimal,
        target: Decimal,
        reason: String,
    },
    ExitTriggered {
        timestamp: DateTime<Utc>,
        ticker: String,
        strategy: String,
        side: Side,
        quantity: u64,
        entry_price: Decimal,
        pnl: Decimal,
        pnl_pct: Decimal,
        reason: String,
        urgency: Urgency,
        exit_mechanism: ExitMechanism,
    },
    OrderFilled {
        timestamp: DateTime<Utc>,
        ticker: String,
        order_id: String,
        quantity: u64,
        fill_price: Option<Decimal>,
    },
    OrderRejected {
        timestamp: DateTime<Utc>,
        ticker: String,
        order_id: Option<String>,
        reason: String,
    },
    PositionOpened {
        timestamp: DateTime<Utc>,
        ticker: String,
        side: Side,
        quantity: u64,
        entry_price: Decimal,
        strategy: String,
        order_id: String,
    },
    PositionClosed {
        timestamp: DateTime<Utc>,
        ticker: String,
        side: Side,
        quantity: u64,
        entry_price: Decimal,
        pnl: Decimal,
        pnl_pct: Decimal,
    },
    CycleComplete {
        timestamp: DateTime<Utc>,
        cycle: u64,
        exits_evaluated: usize,
        exits_triggered: usize,
        entries_evaluated: usize,
        entries_triggered: usize,
        signals_pending: usize,
        positions_open: usize,
        duration_ms: u64,
    },
    SyncFailed {
        timestamp: DateTime<Utc>,
        reason: String,
    },
    PersistenceFailed {
        timestamp: DateTime<Utc>,
        reason: String,
    },
    CapacityReached {
        timestamp: DateTime<Utc>,
        ticker: Option<String>,
        positions_open: usize,
        max_positions: usize,
    },
    DryRun {
        timestamp: DateTime<Utc>,
        ticker: String,
        operation: String,
        quantity: u64,
        entry_price: Option<Decimal>,
    },
    StrategyError {
        timestamp: DateTime<Utc>,
        ticker: String,
        stage: String,
        reason: String,
    },
}

impl EngineEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::ScanComplete { timestamp, .. }
            | EngineEvent::SignalAccepted { timestamp, .. }
            | EngineEvent::SignalRejected { timestamp, .. }
            | EngineEvent::SignalExpired { timestamp, .. }
            | EngineEvent::EntryTriggered { timestamp, .. }
            | EngineEvent::ExitTriggered { timestamp, .. }
            | EngineEvent::OrderFilled { timestamp, .. }
            | EngineEvent::OrderRejected { timestamp, .. }
            | EngineEvent::PositionOpened { timestamp, .. }
            | EngineEvent::PositionClosed { timestamp, .. }
            | EngineEvent::CycleComplete { timestamp, .. }
            | EngineEvent::SyncFailed { timestamp, .. }
            | EngineEvent::PersistenceFailed { timestamp, .. }
            | EngineEvent::CapacityReached { timestamp, .. }
            | EngineEvent::DryRun { timestamp, .. }
            | EngineEvent::StrategyError { timestamp, .. } => *timestamp,
        }
    }

    /// Stable discriminant name, matching the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::ScanComplete { .. } => "scan_complete",
            EngineEvent::SignalAccepted { .. } => "signal_accepted",
            EngineEvent::SignalRejected { .. } => "signal_rejected",
            EngineEvent::SignalExpired { .. } => "signal_expired",
            EngineEvent::EntryTriggered { .. } => "entry_triggered",
            EngineEvent::ExitTriggered { .. } => "exit_triggered",
            EngineEvent::OrderFilled { .. } => "order_filled",
            EngineEvent::OrderRejected { .. } => "order_rejected",
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::CycleComplete { .. } => "cycle_complete",
            EngineEvent::SyncFailed { .. } => "sync_failed",
            EngineEvent::PersistenceFailed { .. } => "persistence_failed",
            EngineEvent::CapacityReached { .. } => "capacity_reached",
            EngineEvent::DryRun { .. } => "dry_run",
            EngineEvent::StrategyError { .. } => "strategy_error",
        }
    }

    /// The ticker this event concerns, when there is one.
    pub fn ticker(&self) -> Option<&str> {
        match self {
            EngineEvent::SignalAccepted { ticker, .. }
            | EngineEvent::SignalRejected { ticker, .. }
            | EngineEvent::SignalExpired { ticker, .. }
            | EngineEvent::EntryTriggered { ticker, .. }
            | EngineEvent::ExitTriggered { ticker, .. }
            | EngineEvent::OrderFilled { ticker, .. }
            | EngineEvent::OrderRejected { ticker, .. }
            | EngineEvent::PositionOpened { ticker, .. }
            | EngineEvent::PositionClosed { ticker, .. }
            | EngineEvent::DryRun { ticker, .. }
            | EngineEvent::StrategyError { ticker, .. } => Some(ticker),
            EngineEvent::CapacityReached { ticker, .. } => ticker.as_deref(),
            _ => None,
        }
    }
}

/// Synchronous event handler.
pub type EventHandler = Box<dyn Fn(&EngineEvent) + Send + Sync>;

/// Handler registry plus broadcast fan-out.
///
/// Handlers run inline on the emitting (engine) task, so they must be cheap;
/// anything heavier should subscribe to the broadcast side.
pub struct EventBus {
    handlers: Mutex<Vec<EventHandler>>,
    sender: broadcast::Sender<EngineEvent>,
    emitted: Mutex<u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            handlers: Mutex::new(Vec::new()),
            sender,
            emitted: Mutex::new(0),
        }
    }

    /// Register a synchronous handler.
    pub fn register<F>(&self, handler: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.handlers.lock().expect("handler lock").push(Box::new(handler));
    }

    /// Subscribe to the broadcast side.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Total events emitted since construction.
    pub fn emitted(&self) -> u64 {
        *self.emitted.lock().expect("counter lock")
    }

    /// Emit an event: log it, run handlers, fan out.
    pub fn emit(&self, event: EngineEvent) {
        log_event(&event);

        {
            let handlers = self.handlers.lock().expect("handler lock");
            for handler in handlers.iter() {
                handler(&event);
            }
        }

        *self.emitted.lock().expect("counter lock") += 1;

        // No receivers is fine; broadcast is best-effort.
        let _ = self.sender.send(event);
    }
}

/// Render an event through tracing at an appropriate level.
fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::EntryTriggered {
            ticker,
            strategy,
            side,
            quantity,
            entry_price,
            stop_loss,
            target,
            reason,
            ..
        } => info!(
            %ticker, %strategy, %side, quantity, %entry_price, %stop_loss, %target,
            "entry triggered: {reason}"
        ),
        EngineEvent::ExitTriggered {
            ticker,
            reason,
            urgency,
            pnl_pct,
            ..
        } => info!(%ticker, %urgency, %pnl_pct, "exit triggered: {reason}"),
        EngineEvent::OrderFilled {
            ticker,
            order_id,
            quantity,
            fill_price,
            ..
        } => info!(%ticker, %order_id, quantity, ?fill_price, "order filled"),
        EngineEvent::OrderRejected { ticker, reason, .. } => {
            warn!(%ticker, "order rejected: {reason}")
        }
        EngineEvent::PositionOpened {
            ticker,
            side,
            quantity,
            entry_price,
            ..
        } => info!(%ticker, %side, quantity, %entry_price, "position opened"),
        EngineEvent::PositionClosed {
            ticker, pnl_pct, ..
        } => info!(%ticker, %pnl_pct, "position closed"),
        EngineEvent::SignalAccepted {
            ticker,
            action,
            priority,
            source,
            ..
        } => info!(%ticker, %action, priority, %source, "signal accepted"),
        EngineEvent::SignalRejected { ticker, reason, .. } => {
            debug!(%ticker, "signal rejected: {reason}")
        }
        EngineEvent::SignalExpired { ticker, .. } => debug!(%ticker, "signal expired"),
        EngineEvent::SyncFailed { reason, .. } => warn!("position sync failed: {reason}"),
        EngineEvent::PersistenceFailed { reason, .. } => {
            warn!("state persistence failed: {reason}")
        }
        EngineEvent::CapacityReached {
            positions_open,
            max_positions,
            ..
        } => debug!(positions_open, max_positions, "position capacity reached"),
        EngineEvent::DryRun {
            ticker, operation, ..
        } => info!(%ticker, %operation, "analyze mode, order not sent"),
        EngineEvent::StrategyError {
            ticker,
            stage,
            reason,
            ..
        } => warn!(%ticker, %stage, "strategy error: {reason}"),
        EngineEvent::CycleComplete {
            cycle,
            entries_triggered,
            exits_triggered,
            positions_open,
            signals_pending,
            duration_ms,
            ..
        } => debug!(
            cycle,
            entries_triggered, exits_triggered, positions_open, signals_pending, duration_ms,
            "cycle complete"
        ),
        EngineEvent::ScanComplete {
            source,
            tickers_found,
            duration_ms,
            ..
        } => debug!(%source, count = tickers_found.len(), duration_ms, "scan complete"),
    }
}
