//! Order submission and lifecycle management.
//!
//! Validates bracket parameters before any broker call, retries transient
//! failures with exponential backoff, and tracks outstanding order ids per
//! ticker. In analyze mode every submission short-circuits into a `dry_run`
//! event; the rest of the engine proceeds as if the order had filled.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BracketRequest, BrokerClient, OrderEventKind, OrderUpdate};
use crate::domain::{TradeAction, Urgency};
use crate::error::{Result, TradewindError};
use crate::events::{EngineEvent, EventBus};

/// Inputs for a bracket submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderParams {
    pub ticker: String,
    pub side: TradeAction,
    pub quantity: u64,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub target: Decimal,
    pub strategy_name: String,
}

impl OrderParams {
    /// Price-ordering and positivity checks. Invalid params never reach the
    /// broker.
    pub fn validate(&self) -> Result<()> {
        if self.quantity == 0 {
            return Err(TradewindError::InvalidOrderParams(
                "quantity must be positive".to_string(),
            ));
        }
        for (label, price) in [
            ("entry_price", self.entry_price),
            ("stop_loss", self.stop_loss),
            ("target", self.target),
        ] {
            if price <= Decimal::ZERO {
                return Err(TradewindError::InvalidOrderParams(format!(
                    "{label} must be positive, got {price}"
                )));
            }
        }
        let ordered = match self.side {
            TradeAction::Buy | TradeAction::Cover => {
                self.stop_loss < self.entry_price && self.entry_price < self.target
            }
            TradeAction::Short | TradeAction::Sell => {
                self.target < self.entry_price && self.entry_price < self.stop_loss
            }
        };
        if !ordered {
            return Err(TradewindError::InvalidOrderParams(format!(
                "levels out of order for {}: stop={} entry={} target={}",
                self.side, self.stop_loss, self.entry_price, self.target
            )));
        }
        Ok(())
    }

    /// Unique client order id: `{strategy}_{ticker}_{side}_{suffix}`.
    pub fn client_order_id(&self) -> String {
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        format!(
            "{}_{}_{}_{}",
            self.strategy_name, self.ticker, self.side, suffix
        )
    }
}

/// Result of a submission path.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Broker accepted; order id returned.
    Submitted { order_id: String },
    /// Analyze mode: nothing sent, synthetic id for local tracking.
    DryRun { client_order_id: String },
}

impl SubmitOutcome {
    pub fn order_id(&self) -> &str {
        match self {
            SubmitOutcome::Submitted { order_id } => order_id,
            SubmitOutcome::DryRun { client_order_id } => client_order_id,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, SubmitOutcome::DryRun { .. })
    }
}

/// Tuning for broker interaction.
#[derive(Debug, Clone)]
pub struct OrderManagerConfig {
    pub analyze_mode: bool,
    /// Bounded attempts for transient failures.
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub base_backoff: Duration,
    /// Per-call broker timeout.
    pub call_timeout: Duration,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            analyze_mode: false,
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct OrderManager {
    broker: Arc<dyn BrokerClient>,
    events: Arc<EventBus>,
    config: OrderManagerConfig,
    /// ticker -> outstanding order ids.
    outstanding: HashMap<String, Vec<String>>,
    last_poll: DateTime<Utc>,
}

impl OrderManager {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        events: Arc<EventBus>,
        config: OrderManagerConfig,
    ) -> Self {
        Self {
            broker,
            events,
            config,
            outstanding: HashMap::new(),
            last_poll: Utc::now(),
        }
    }

    pub fn analyze_mode(&self) -> bool {
        self.config.analyze_mode
    }

    pub fn set_analyze_mode(&mut self, enabled: bool) {
        info!(enabled, "analyze mode toggled");
        self.config.analyze_mode = enabled;
    }

    /// Submit an entry bracket. `urgency` controls whether backoff sleeps are
    /// taken between retries.
    pub async fn submit_bracket_order(
        &mut self,
        params: &OrderParams,
        urgency: Urgency,
    ) -> Result<SubmitOutcome> {
        params.validate()?;

        let client_order_id = params.client_order_id();

        if self.config.analyze_mode {
            self.events.emit(EngineEvent::DryRun {
                timestamp: Utc::now(),
                ticker: params.ticker.clone(),
                operation: "submit_bracket_order".to_string(),
                quantity: params.quantity,
                entry_price: Some(params.entry_price),
            });
            return Ok(SubmitOutcome::DryRun { client_order_id });
        }

        let request = BracketRequest {
            ticker: params.ticker.clone(),
            action: params.side,
            quantity: params.quantity,
            entry_price: params.entry_price,
            stop_loss: params.stop_loss,
            target: params.target,
            client_order_id,
        };

        let order_id = self
            .with_retries(urgency, &params.ticker, || {
                let broker = self.broker.clone();
                let request = request.clone();
                async move { broker.submit_bracket(&request).await }
            })
            .await?;

        debug!(ticker = %params.ticker, %order_id, "bracket order accepted");
        self.outstanding
            .entry(params.ticker.clone())
            .or_default()
            .push(order_id.clone());

        Ok(SubmitOutcome::Submitted { order_id })
    }

    /// Close a position, canceling its outstanding orders first.
    pub async fn close_position(
        &mut self,
        ticker: &str,
        urgency: Urgency,
    ) -> Result<SubmitOutcome> {
        if self.config.analyze_mode {
            self.events.emit(EngineEvent::DryRun {
                timestamp: Utc::now(),
                ticker: ticker.to_string(),
                operation: "close_position".to_string(),
                quantity: 0,
                entry_price: None,
            });
            self.outstanding.remove(ticker);
            return Ok(SubmitOutcome::DryRun {
                client_order_id: format!("dry_close_{ticker}"),
            });
        }

        // Open bracket legs would conflict with the closing order.
        for order_id in self.outstanding.remove(ticker).unwrap_or_default() {
            if let Err(e) = self.broker.cancel_order(&order_id).await {
                warn!(ticker, %order_id, "cancel before close failed: {e}");
            }
        }

        let order_id = self
            .with_retries(urgency, ticker, || {
                let broker = self.broker.clone();
                let ticker = ticker.to_string();
                async move { broker.close_position(&ticker).await }
            })
            .await?;

        info!(ticker, %order_id, "close order submitted");
        Ok(SubmitOutcome::Submitted { order_id })
    }

    /// Cancel a single order and drop it from tracking.
    pub async fn cancel_order(&mut self, order_id: &str) -> Result<()> {
        self.broker.cancel_order(order_id).await?;
        for ids in self.outstanding.values_mut() {
            ids.retain(|id| id != order_id);
        }
        self.outstanding.retain(|_, ids| !ids.is_empty());
        Ok(())
    }

    /// Fill and rejection events since the previous poll.
    pub async fn poll_orders(&mut self) -> Result<Vec<OrderUpdate>> {
        let since = self.last_poll;
        let updates = self.broker.poll_order_updates(since).await?;
        self.last_poll = Utc::now();

        for update in &updates {
            if matches!(
                update.kind,
                OrderEventKind::Filled | OrderEventKind::Rejected | OrderEventKind::Canceled
            ) {
                if let Some(ids) = self.outstanding.get_mut(&update.ticker) {
                    ids.retain(|id| id != &update.order_id);
                }
            }
        }
        self.outstanding.retain(|_, ids| !ids.is_empty());

        Ok(updates)
    }

    /// Outstanding order ids per ticker.
    pub fn outstanding(&self) -> &HashMap<String, Vec<String>> {
        &self.outstanding
    }

    /// Restore outstanding-order tracking from persisted state.
    pub fn restore_outstanding(&mut self, outstanding: HashMap<String, Vec<String>>) {
        self.outstanding = outstanding;
    }

    /// Run a broker call under the per-call timeout, retrying transient
    /// failures with exponential backoff. `Immediate` urgency skips the
    /// backoff sleeps. Persistent failures emit `order_rejected` and abort.
    async fn with_retries<F, Fut>(
        &self,
        urgency: Urgency,
        ticker: &str,
        mut call: F,
    ) -> Result<String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            let outcome = match tokio::time::timeout(self.config.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(TradewindError::BrokerTimeout {
                    elapsed_ms: self.config.call_timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Ok(order_id) => return Ok(order_id),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    let backoff = self.config.base_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        ticker,
                        attempt,
                        error = %e,
                        "transient broker failure, retrying in {backoff:?}"
                    );
                    if urgency != Urgency::Immediate {
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    self.events.emit(EngineEvent::OrderRejected {
                        timestamp: Utc::now(),
                        ticker: ticker.to_string(),
                        order_id: None,
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        let final_error = last_error
            .unwrap_or_else(|| TradewindError::BrokerTransient("retries exhausted".to_string()));
        self.events.emit(EngineEvent::OrderRejected {
            timestamp: Utc::now(),
            ticker: ticker.to_string(),
            order_id: None,
            reason: final_error.to_string(),
        });
        Err(final_error)
    }
}
