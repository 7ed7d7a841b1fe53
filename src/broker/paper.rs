//! In-memory paper broker.
//!
//! Fills bracket entries instantly at the requested limit price and tracks
//! simulated positions and cash. Good enough to drive the engine end-to-end
//! without touching a live venue; stop/target legs are modeled as fills only
//! when the simulated price crosses them via [`PaperBroker::mark_price`].

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use async_trait::async_trait;

use super::{
    AccountSnapshot, BracketRequest, BrokerClient, BrokerPosition, MarketClock, OrderEventKind,
    OrderUpdate,
};
use crate::domain::{MarketStatus, Side, TradeAction};
use crate::error::{Result, TradewindError};

#[derive(Debug, Clone)]
struct PaperBracket {
    order_id: String,
    stop_loss: Decimal,
    target: Decimal,
}

#[derive(Debug)]
struct PaperState {
    positions: HashMap<String, BrokerPosition>,
    brackets: HashMap<String, PaperBracket>,
    updates: Vec<OrderUpdate>,
    cash: Decimal,
    realized_pnl: Decimal,
    status: MarketStatus,
}

/// Simulated broker backed by an in-memory book.
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState {
                positions: HashMap::new(),
                brackets: HashMap::new(),
                updates: Vec::new(),
                cash: starting_cash,
                realized_pnl: Decimal::ZERO,
                status: MarketStatus::Open,
            }),
        }
    }

    /// Override the simulated market session.
    pub fn set_market_status(&self, status: MarketStatus) {
        self.state.lock().expect("paper state").status = status;
    }

    /// Total realized P&L across all simulated closes.
    pub fn realized_pnl(&self) -> Decimal {
        self.state.lock().expect("paper state").realized_pnl
    }

    /// Move the simulated price for a ticker. Triggers bracket legs when the
    /// price crosses a stop or target.
    pub fn mark_price(&self, ticker: &str, price: Decimal) {
        let mut state = self.state.lock().expect("paper state");

        let Some(position) = state.positions.get_mut(ticker) else {
            return;
        };
        position.current_price = price;
        let side = position.side;
        let quantity = position.quantity;
        let entry = position.avg_entry_price;

        let Some(bracket) = state.brackets.get(ticker).cloned() else {
            return;
        };

        let stop_hit = match side {
            Side::Long => price <= bracket.stop_loss,
            Side::Short => price >= bracket.stop_loss,
        };
        let target_hit = match side {
            Side::Long => price >= bracket.target,
            Side::Short => price <= bracket.target,
        };

        if stop_hit || target_hit {
            let fill = if stop_hit { bracket.stop_loss } else { bracket.target };
            debug!(ticker, %fill, "bracket leg triggered");
            state.positions.remove(ticker);
            state.brackets.remove(ticker);

            let pnl = match side {
                Side::Long => (fill - entry) * Decimal::from(quantity),
                Side::Short => (entry - fill) * Decimal::from(quantity),
            };
            state.realized_pnl += pnl;
            // Longs paid cash up front; shorts only realize the P&L.
            match side {
                Side::Long => state.cash += fill * Decimal::from(quantity),
                Side::Short => state.cash += pnl,
            }
            state.updates.push(OrderUpdate {
                order_id: bracket.order_id,
                ticker: ticker.to_string(),
                kind: OrderEventKind::Filled,
                quantity,
                fill_price: Some(fill),
                reason: None,
                timestamp: Utc::now(),
            });
        }
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        let state = self.state.lock().expect("paper state");
        Ok(state.positions.values().cloned().collect())
    }

    async fn submit_bracket(&self, request: &BracketRequest) -> Result<String> {
        let mut state = self.state.lock().expect("paper state");

        if state.positions.contains_key(&request.ticker) {
            return Err(TradewindError::BrokerRejected {
                ticker: request.ticker.clone(),
                reason: "position already open".to_string(),
            });
        }

        let notional = request.entry_price * Decimal::from(request.quantity);
        if matches!(request.action, TradeAction::Buy) && notional > state.cash {
            return Err(TradewindError::BrokerRejected {
                ticker: request.ticker.clone(),
                reason: format!("insufficient cash: need {notional}, have {}", state.cash),
            });
        }

        let order_id = format!("paper-{}", Uuid::new_v4().simple());
        let side = request.action.opening_side();

        state.positions.insert(
            request.ticker.clone(),
            BrokerPosition {
                ticker: request.ticker.clone(),
                side,
                quantity: request.quantity,
                avg_entry_price: request.entry_price,
                current_price: request.entry_price,
            },
        );
        state.brackets.insert(
            request.ticker.clone(),
            PaperBracket {
                order_id: order_id.clone(),
                stop_loss: request.stop_loss,
                target: request.target,
            },
        );
        if matches!(request.action, TradeAction::Buy) {
            state.cash -= notional;
        }
        state.updates.push(OrderUpdate {
            order_id: order_id.clone(),
            ticker: request.ticker.clone(),
            kind: OrderEventKind::Filled,
            quantity: request.quantity,
            fill_price: Some(request.entry_price),
            reason: None,
            timestamp: Utc::now(),
        });

        info!(
            ticker = %request.ticker,
            %order_id,
            quantity = request.quantity,
            entry = %request.entry_price,
            "paper bracket filled"
        );
        Ok(order_id)
    }

    async fn close_position(&self, ticker: &str) -> Result<String> {
        let mut state = self.state.lock().expect("paper state");

        let position = state.positions.remove(ticker).ok_or_else(|| {
            TradewindError::BrokerRejected {
                ticker: ticker.to_string(),
                reason: "no open position".to_string(),
            }
        })?;
        state.brackets.remove(ticker);

        let fill = position.current_price;
        let pnl = match position.side {
            Side::Long => (fill - position.avg_entry_price) * Decimal::from(position.quantity),
            Side::Short => (position.avg_entry_price - fill) * Decimal::from(position.quantity),
        };
        state.realized_pnl += pnl;
        match position.side {
            Side::Long => state.cash += fill * Decimal::from(position.quantity),
            Side::Short => state.cash += pnl,
        }

        let order_id = format!("paper-{}", Uuid::new_v4().simple());
        state.updates.push(OrderUpdate {
            order_id: order_id.clone(),
            ticker: ticker.to_string(),
            kind: OrderEventKind::Filled,
            quantity: position.quantity,
            fill_price: Some(fill),
            reason: None,
            timestamp: Utc::now(),
        });

        info!(ticker, %order_id, %fill, %pnl, "paper position closed");
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("paper state");
        let ticker = state
            .brackets
            .iter()
            .find(|(_, b)| b.order_id == order_id)
            .map(|(t, _)| t.clone());
        if let Some(ticker) = ticker {
            state.brackets.remove(&ticker);
            state.updates.push(OrderUpdate {
                order_id: order_id.to_string(),
                ticker,
                kind: OrderEventKind::Canceled,
                quantity: 0,
                fill_price: None,
                reason: None,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    async fn poll_order_updates(&self, since: DateTime<Utc>) -> Result<Vec<OrderUpdate>> {
        let state = self.state.lock().expect("paper state");
        Ok(state
            .updates
            .iter()
            .filter(|u| u.timestamp > since)
            .cloned()
            .collect())
    }

    async fn account(&self) -> Result<AccountSnapshot> {
        let state = self.state.lock().expect("paper state");
        let position_value: Decimal = state
            .positions
            .values()
            .map(|p| p.current_price * Decimal::from(p.quantity))
            .sum();
        let equity = state.cash + position_value;
        Ok(AccountSnapshot {
            equity,
            buying_power: state.cash,
            day_trading_buying_power: state.cash * Decimal::from(4),
            margin_requirement: Decimal::ZERO,
        })
    }

    async fn market_clock(&self) -> Result<MarketClock> {
        let state = self.state.lock().expect("paper state");
        let now = Utc::now();
        Ok(MarketClock {
            status: state.status,
            next_open: now + Duration::hours(16),
            next_close: now + Duration::hours(6),
        })
    }
}
