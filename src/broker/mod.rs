//! Broker abstraction consumed by the execution core.
//!
//! The engine never talks to a broker SDK directly; everything goes through
//! [`BrokerClient`]. A live adapter (Alpaca, IBKR, ...) lives outside this
//! crate; [`paper::PaperBroker`] is the in-memory implementation used by the
//! default configuration and the test suite.

pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{MarketStatus, Side, TradeAction};
use crate::error::Result;

pub use paper::PaperBroker;

/// A position as reported by the broker. Authoritative for quantity and
/// entry/current prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticker: String,
    pub side: Side,
    pub quantity: u64,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
}

/// Bracket order request: entry plus linked stop-loss and take-profit legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketRequest {
    pub ticker: String,
    pub action: TradeAction,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub target: Decimal,
    pub client_order_id: String,
}

/// What happened to an order since the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEventKind {
    Filled,
    Rejected,
    Canceled,
}

/// Order lifecycle update returned by `poll_order_updates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub ticker: String,
    pub kind: OrderEventKind,
    pub quantity: u64,
    pub fill_price: Option<Decimal>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Account snapshot used to build the market context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub buying_power: Decimal,
    pub day_trading_buying_power: Decimal,
    pub margin_requirement: Decimal,
}

/// Market clock as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketClock {
    pub status: MarketStatus,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

/// Capabilities the execution core requires from a broker.
///
/// All calls may suspend; each is invoked under the engine's per-call timeout.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// All currently open positions.
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>>;

    /// Submit an atomically linked entry + stop + target order.
    /// Returns the broker-assigned order id.
    async fn submit_bracket(&self, request: &BracketRequest) -> Result<String>;

    /// Cancel open orders for the ticker and close the position at market.
    /// Returns the closing order id.
    async fn close_position(&self, ticker: &str) -> Result<String>;

    /// Cancel a single open order.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Fill/rejection/cancel events since `since`.
    async fn poll_order_updates(&self, since: DateTime<Utc>) -> Result<Vec<OrderUpdate>>;

    /// Current account figures.
    async fn account(&self) -> Result<AccountSnapshot>;

    /// Current market session.
    async fn market_clock(&self) -> Result<MarketClock>;
}
