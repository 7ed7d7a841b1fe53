//! Broker-reconciled mirror of open positions.
//!
//! The broker is authoritative for quantity and prices; local metadata
//! (owning strategy, bracket levels, order ids, exit attempts) survives each
//! sync. Positions vanishing from the broker report are moved into a bounded
//! closed-positions history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::broker::BrokerPosition;
use crate::domain::Side;

/// A tracked position with enriched metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub ticker: String,
    pub side: Side,
    pub quantity: u64,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub strategy_name: String,
    pub opened_at: DateTime<Utc>,
    pub entry_order_id: Option<String>,
    pub stop_loss: Option<Decimal>,
    pub target: Option<Decimal>,
    pub has_bracket_order: bool,
    pub exit_attempts: u32,
    pub last_exit_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl TrackedPosition {
    /// Recompute market value and P&L from the current price.
    pub fn set_current_price(&mut self, price: Decimal) {
        self.current_price = price;
        self.market_value = price * Decimal::from(self.quantity);
        self.unrealized_pnl = match self.side {
            Side::Long => (price - self.avg_entry_price) * Decimal::from(self.quantity),
            Side::Short => (self.avg_entry_price - price) * Decimal::from(self.quantity),
        };
        let basis = self.avg_entry_price * Decimal::from(self.quantity);
        self.unrealized_pnl_pct = if basis.is_zero() {
            Decimal::ZERO
        } else {
            self.unrealized_pnl / basis
        };
    }

    pub fn is_profitable(&self) -> bool {
        self.unrealized_pnl > Decimal::ZERO
    }
}

/// Reconciliation outcome for one sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    /// Positions no longer reported by the broker, now in the closed history.
    pub removed: Vec<TrackedPosition>,
}

/// Tracks open positions keyed by ticker.
#[derive(Debug)]
pub struct PositionTracker {
    positions: HashMap<String, TrackedPosition>,
    closed: VecDeque<TrackedPosition>,
    closed_capacity: usize,
}

impl PositionTracker {
    pub const DEFAULT_CLOSED_CAPACITY: usize = 100;

    pub fn new(closed_capacity: usize) -> Self {
        Self {
            positions: HashMap::new(),
            closed: VecDeque::new(),
            closed_capacity,
        }
    }

    /// Reconcile against the broker's position report.
    ///
    /// Broker wins on quantity and prices; local metadata is preserved.
    /// Tickers the broker no longer reports are closed out.
    pub fn sync_from_broker(&mut self, broker_positions: &[BrokerPosition]) -> SyncReport {
        let mut report = SyncReport::default();
        let mut seen: Vec<&str> = Vec::with_capacity(broker_positions.len());

        for bp in broker_positions {
            seen.push(bp.ticker.as_str());
            match self.positions.get_mut(&bp.ticker) {
                Some(tracked) => {
                    tracked.side = bp.side;
                    tracked.quantity = bp.quantity;
                    tracked.avg_entry_price = bp.avg_entry_price;
                    tracked.set_current_price(bp.current_price);
                    report.updated += 1;
                }
                None => {
                    // Broker knows a position we never recorded; admit it
                    // without metadata so exits still get evaluated.
                    let mut tracked = TrackedPosition {
                        ticker: bp.ticker.clone(),
                        side: bp.side,
                        quantity: bp.quantity,
                        avg_entry_price: bp.avg_entry_price,
                        current_price: bp.current_price,
                        market_value: Decimal::ZERO,
                        unrealized_pnl: Decimal::ZERO,
                        unrealized_pnl_pct: Decimal::ZERO,
                        strategy_name: "unknown".to_string(),
                        opened_at: Utc::now(),
                        entry_order_id: None,
                        stop_loss: None,
                        target: None,
                        has_bracket_order: false,
                        exit_attempts: 0,
                        last_exit_attempt: None,
                        notes: vec!["admitted via broker sync".to_string()],
                    };
                    tracked.set_current_price(bp.current_price);
                    debug!(ticker = %bp.ticker, "unrecorded broker position admitted");
                    self.positions.insert(bp.ticker.clone(), tracked);
                    report.added += 1;
                }
            }
        }

        let vanished: Vec<String> = self
            .positions
            .keys()
            .filter(|t| !seen.contains(&t.as_str()))
            .cloned()
            .collect();
        for ticker in vanished {
            if let Some(position) = self.positions.remove(&ticker) {
                info!(%ticker, pnl = %position.unrealized_pnl, "position closed at broker");
                self.push_closed(position.clone());
                report.removed.push(position);
            }
        }

        report
    }

    /// Record a newly opened position after a successful entry submission.
    #[allow(clippy::too_many_arguments)]
    pub fn add_position(
        &mut self,
        ticker: &str,
        side: Side,
        quantity: u64,
        entry_price: Decimal,
        strategy_name: &str,
        stop_loss: Option<Decimal>,
        target: Option<Decimal>,
        entry_order_id: Option<String>,
    ) -> &TrackedPosition {
        let mut position = TrackedPosition {
            ticker: ticker.to_string(),
            side,
            quantity,
            avg_entry_price: entry_price,
            current_price: entry_price,
            market_value: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            unrealized_pnl_pct: Decimal::ZERO,
            strategy_name: strategy_name.to_string(),
            opened_at: Utc::now(),
            entry_order_id,
            stop_loss,
            target,
            has_bracket_order: true,
            exit_attempts: 0,
            last_exit_attempt: None,
            notes: Vec::new(),
        };
        position.set_current_price(entry_price);
        self.positions.insert(ticker.to_string(), position);
        self.positions.get(ticker).expect("just inserted")
    }

    pub fn get(&self, ticker: &str) -> Option<&TrackedPosition> {
        self.positions.get(ticker)
    }

    pub fn get_mut(&mut self, ticker: &str) -> Option<&mut TrackedPosition> {
        self.positions.get_mut(ticker)
    }

    pub fn has(&self, ticker: &str) -> bool {
        self.positions.contains_key(ticker)
    }

    pub fn all(&self) -> Vec<TrackedPosition> {
        let mut positions: Vec<_> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        positions
    }

    pub fn tickers(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn total_value(&self) -> Decimal {
        self.positions.values().map(|p| p.market_value).sum()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Update the current price of one position, recomputing P&L.
    pub fn update_price(&mut self, ticker: &str, price: Decimal) -> bool {
        match self.positions.get_mut(ticker) {
            Some(position) => {
                position.set_current_price(price);
                true
            }
            None => false,
        }
    }

    /// Stamp a dynamic-exit attempt on the position.
    pub fn record_exit_attempt(&mut self, ticker: &str, now: DateTime<Utc>) {
        if let Some(position) = self.positions.get_mut(ticker) {
            position.exit_attempts += 1;
            position.last_exit_attempt = Some(now);
        }
    }

    /// Remove a position without going through broker sync (dynamic exits).
    pub fn remove(&mut self, ticker: &str) -> Option<TrackedPosition> {
        let position = self.positions.remove(ticker);
        if let Some(ref p) = position {
            self.push_closed(p.clone());
        }
        position
    }

    pub fn closed_history(&self) -> &VecDeque<TrackedPosition> {
        &self.closed
    }

    fn push_closed(&mut self, position: TrackedPosition) {
        if self.closed.len() >= self.closed_capacity {
            self.closed.pop_front();
        }
        self.closed.push_back(position);
    }

    /// Open positions plus closed history, for persistence.
    pub fn snapshot(&self) -> (Vec<TrackedPosition>, Vec<TrackedPosition>) {
        (self.all(), self.closed.iter().cloned().collect())
    }

    /// Rebuild from a persisted snapshot.
    pub fn restore(&mut self, open: Vec<TrackedPosition>, closed: Vec<TrackedPosition>) {
        self.positions = open
            .into_iter()
            .map(|p| (p.ticker.clone(), p))
            .collect();
        self.closed = closed.into_iter().collect();
        while self.closed.len() > self.closed_capacity {
            self.closed.pop_front();
        }
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CLOSED_CAPACITY)
    }
}
