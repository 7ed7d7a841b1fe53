//! The execution engine run loop.
//!
//! One engine loop owns all mutable trading state and drives serial cycles:
//! sync positions, process exits, process entries, poll order updates,
//! persist, emit a summary. Exits are always evaluated before entries.
//!
//! Exit precedence: a position protected by a broker-side bracket order is
//! never handed to `Strategy::evaluate_exit`; the bracket is the primary exit
//! mechanism and strategy-driven closes exist only as an emergency fallback
//! for unprotected positions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, OrderEventKind};
use crate::domain::{TechnicalSignals, Urgency};
use crate::error::{Result, TradewindError};
use crate::events::{EngineEvent, EventBus, ExitMechanism};
use crate::execution::cooldown::CooldownManager;
use crate::execution::order_manager::{OrderManager, OrderManagerConfig, OrderParams};
use crate::execution::position_tracker::PositionTracker;
use crate::execution::signal_cache::SignalCache;
use crate::execution::signal_queue::{Admission, PendingSignal, RejectReason, SignalQueue};
use crate::execution::state::{EngineState, StateStore, STATE_VERSION};
use crate::signals::{MarketDataProvider, SignalProvider};
use crate::strategy::{MarketContext, SharedStrategy, Strategy};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Stopped,
    Running,
    Draining,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between cycles.
    pub check_interval: StdDuration,
    /// Deadline margin subtracted from the interval for each cycle.
    pub cycle_margin: StdDuration,
    /// Per-call broker timeout.
    pub broker_timeout: StdDuration,
    pub max_positions: usize,
    pub max_signals: usize,
    /// TTL assigned to signals admitted without an expiry.
    pub signal_ttl: chrono::Duration,
    pub signal_cache_ttl: chrono::Duration,
    /// Cooldown applied after exits and reject streaks.
    pub cooldown: chrono::Duration,
    /// Broker rejects per ticker within `reject_window` before a cooldown.
    pub max_rejects_before_cooldown: usize,
    pub reject_window: chrono::Duration,
    pub analyze_mode: bool,
    pub state_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval: StdDuration::from_secs(120),
            cycle_margin: StdDuration::from_secs(10),
            broker_timeout: StdDuration::from_secs(30),
            max_positions: 10,
            max_signals: SignalQueue::DEFAULT_MAX_SIGNALS,
            signal_ttl: chrono::Duration::hours(SignalQueue::DEFAULT_TTL_HOURS),
            signal_cache_ttl: chrono::Duration::seconds(SignalCache::DEFAULT_TTL_SECS),
            cooldown: chrono::Duration::hours(CooldownManager::DEFAULT_DURATION_HOURS),
            max_rejects_before_cooldown: 3,
            reject_window: chrono::Duration::hours(1),
            analyze_mode: false,
            state_path: PathBuf::from(StateStore::DEFAULT_PATH),
        }
    }
}

/// Counters from one cycle, mostly for tests and the summary event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle: u64,
    pub exits_evaluated: usize,
    pub exits_triggered: usize,
    pub entries_evaluated: usize,
    pub entries_triggered: usize,
    pub signals_pending: usize,
    pub positions_open: usize,
    pub sync_failed: bool,
}

/// State owned exclusively by the engine loop.
struct EngineCore {
    positions: PositionTracker,
    cooldowns: CooldownManager,
    orders: OrderManager,
    cache: SignalCache,
    store: StateStore,
    /// Per-ticker broker-reject timestamps within the sliding window.
    reject_times: HashMap<String, Vec<DateTime<Utc>>>,
    cycle_count: u64,
    state_loaded: bool,
}

pub struct ExecutionEngine {
    config: EngineConfig,
    strategy: SharedStrategy,
    broker: Arc<dyn BrokerClient>,
    signal_provider: Arc<dyn SignalProvider>,
    market_data: Arc<dyn MarketDataProvider>,
    events: Arc<EventBus>,
    status: RwLock<EngineStatus>,
    /// Admission port; the only state touched by concurrent producers.
    queue: StdMutex<SignalQueue>,
    core: Mutex<EngineCore>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        strategy: SharedStrategy,
        broker: Arc<dyn BrokerClient>,
        signal_provider: Arc<dyn SignalProvider>,
        market_data: Arc<dyn MarketDataProvider>,
        events: Arc<EventBus>,
    ) -> Self {
        let orders = OrderManager::new(
            broker.clone(),
            events.clone(),
            OrderManagerConfig {
                analyze_mode: config.analyze_mode,
                call_timeout: config.broker_timeout,
                ..OrderManagerConfig::default()
            },
        );
        let core = EngineCore {
            positions: PositionTracker::default(),
            cooldowns: CooldownManager::new(),
            orders,
            cache: SignalCache::new(config.signal_cache_ttl),
            store: StateStore::new(config.state_path.clone()),
            reject_times: HashMap::new(),
            cycle_count: 0,
            state_loaded: false,
        };

        Self {
            queue: StdMutex::new(SignalQueue::new(config.max_signals, config.signal_ttl)),
            config,
            strategy,
            broker,
            signal_provider,
            market_data,
            events,
            status: RwLock::new(EngineStatus::Stopped),
            core: Mutex::new(core),
        }
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.read().expect("status lock")
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Transition `stopped -> running`. Idempotent while running.
    pub fn start(&self) {
        let mut status = self.status.write().expect("status lock");
        if *status == EngineStatus::Stopped {
            info!("engine starting");
            *status = EngineStatus::Running;
        }
    }

    /// Request graceful shutdown: the in-flight cycle completes (including
    /// persistence), then the loop halts.
    pub fn stop(&self) {
        let mut status = self.status.write().expect("status lock");
        if *status == EngineStatus::Running {
            info!("engine draining");
            *status = EngineStatus::Draining;
        }
    }

    /// Thread-safe admission port for external producers. Signals are
    /// accepted only while the engine is running.
    pub fn add_signal(&self, signal: PendingSignal) -> Admission {
        if self.status() != EngineStatus::Running {
            let admission =
                Admission::Rejected(RejectReason::Invalid("engine not running".to_string()));
            self.events.emit(EngineEvent::SignalRejected {
                timestamp: Utc::now(),
                ticker: signal.ticker.clone(),
                reason: "engine not running".to_string(),
            });
            return admission;
        }

        let ticker = signal.ticker.clone();
        let action = signal.action;
        let priority = signal.priority;
        let source = signal.source.clone();

        let admission = self.queue.lock().expect("queue lock").add(signal);
        match &admission {
            Admission::Accepted => self.events.emit(EngineEvent::SignalAccepted {
                timestamp: Utc::now(),
                ticker,
                action,
                priority,
                source,
            }),
            Admission::Rejected(reason) => self.events.emit(EngineEvent::SignalRejected {
                timestamp: Utc::now(),
                ticker,
                reason: reason.to_string(),
            }),
        }
        admission
    }

    /// Toggle analyze mode at runtime.
    pub async fn set_analyze_mode(&self, enabled: bool) {
        self.core.lock().await.orders.set_analyze_mode(enabled);
    }

    /// Swap the active strategy. Takes effect from the next cycle.
    pub fn set_strategy(&self, strategy: Box<dyn Strategy>) {
        let mut guard = match self.strategy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        info!(name = strategy.name(), "strategy swapped");
        *guard = strategy;
    }

    /// Delete the persisted state file and start the next cycle fresh.
    pub async fn reset_state(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        core.store.reset()?;
        core.state_loaded = true; // nothing to load anymore
        Ok(())
    }

    /// Drive cycles at the configured interval until stopped.
    pub async fn run(&self) -> Result<()> {
        self.start();
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let deadline = self
            .config
            .check_interval
            .saturating_sub(self.config.cycle_margin);

        loop {
            // Race the interval against a short sleep so a stop() issued
            // between cycles is noticed promptly.
            tokio::select! {
                _ = interval.tick() => {
                    match tokio::time::timeout(deadline, self.run_cycle()).await {
                        Ok(Ok(summary)) => {
                            debug!(cycle = summary.cycle, "cycle finished");
                        }
                        Ok(Err(e)) => {
                            error!("cycle failed: {e}");
                        }
                        Err(_) => {
                            warn!("cycle exceeded deadline of {deadline:?}");
                        }
                    }
                }
                _ = tokio::time::sleep(StdDuration::from_millis(500)) => {}
            }

            // A drain requested while no cycle is in flight halts right away;
            // a drain during a cycle was already resolved by that cycle.
            self.finish_drain();
            if self.status() == EngineStatus::Stopped {
                info!("engine stopped");
                return Ok(());
            }
        }
    }

    /// Execute one full cycle. Serial: never overlaps another cycle.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let started = Instant::now();
        let now = Utc::now();
        let mut core = self.core.lock().await;
        core.cycle_count += 1;
        let mut summary = CycleSummary {
            cycle: core.cycle_count,
            ..CycleSummary::default()
        };

        // 1. Pre-cycle: restore persisted state on the first cycle, then
        // start from a cold signal cache.
        if !core.state_loaded {
            self.load_state(&mut core);
            core.state_loaded = true;
        }
        core.cache.clear();
        core.cooldowns.prune(now);
        self.expire_queued_signals(now);

        // 2. Sync positions from the broker. Failure aborts the cycle;
        // existing state is retained and the next cycle retries.
        let broker_positions = match tokio::time::timeout(
            self.config.broker_timeout,
            self.broker.list_positions(),
        )
        .await
        {
            Ok(Ok(positions)) => positions,
            Ok(Err(e)) => return self.abort_sync(&mut core, summary, e.to_string()),
            Err(_) => {
                return self.abort_sync(&mut core, summary, "position sync timed out".to_string())
            }
        };
        let sync_report = core.positions.sync_from_broker(&broker_positions);
        for closed in &sync_report.removed {
            self.events.emit(EngineEvent::PositionClosed {
                timestamp: Utc::now(),
                ticker: closed.ticker.clone(),
                side: closed.side,
                quantity: closed.quantity,
                entry_price: closed.avg_entry_price,
                pnl: closed.unrealized_pnl,
                pnl_pct: closed.unrealized_pnl_pct,
            });
        }

        // Account and clock are fetched once per cycle; the per-stage context
        // sets (positions, cooldowns) are rebuilt as state changes.
        let (account, clock) = match self.fetch_account_and_clock().await {
            Ok(pair) => pair,
            Err(e) => return self.abort_sync(&mut core, summary, e.to_string()),
        };
        let vix = self.market_data.vix().unwrap_or(MarketContext::NEUTRAL_VIX);
        if vix > 30.0 {
            warn!(vix, "elevated VIX");
        }

        // 3. Exits before entries, always.
        self.process_exits(&mut core, &account, &clock, vix, &mut summary)
            .await;

        // 4-5. Entries up to remaining capacity.
        if let Err(e) = self
            .process_entries(&mut core, &account, &clock, vix, &mut summary)
            .await
        {
            // Internal invariant violation: record it, persist, abort.
            self.persist(&mut core);
            self.emit_cycle_complete(&core, &mut summary, started);
            self.finish_drain();
            return Err(e);
        }

        // 6. Poll order updates.
        self.poll_order_updates(&mut core).await;

        // 7. Persist. Failure is tolerated; trading continues.
        self.persist(&mut core);

        // 8. Summary event.
        self.emit_cycle_complete(&core, &mut summary, started);

        self.finish_drain();
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Cycle stages
    // ------------------------------------------------------------------

    fn expire_queued_signals(&self, now: DateTime<Utc>) {
        let expired = self.queue.lock().expect("queue lock").take_expired(now);
        for signal in expired {
            self.events.emit(EngineEvent::SignalExpired {
                timestamp: now,
                ticker: signal.ticker,
                created_at: signal.created_at,
            });
        }
    }

    fn abort_sync(
        &self,
        core: &mut EngineCore,
        mut summary: CycleSummary,
        reason: String,
    ) -> Result<CycleSummary> {
        self.events.emit(EngineEvent::SyncFailed {
            timestamp: Utc::now(),
            reason,
        });
        summary.sync_failed = true;
        summary.positions_open = core.positions.count();
        summary.signals_pending = self.queue.lock().expect("queue lock").size();
        self.finish_drain();
        Ok(summary)
    }

    async fn fetch_account_and_clock(
        &self,
    ) -> Result<(crate::broker::AccountSnapshot, crate::broker::MarketClock)> {
        let account =
            tokio::time::timeout(self.config.broker_timeout, self.broker.account())
                .await
                .map_err(|_| TradewindError::BrokerTimeout {
                    elapsed_ms: self.config.broker_timeout.as_millis() as u64,
                })??;
        let clock =
            tokio::time::timeout(self.config.broker_timeout, self.broker.market_clock())
                .await
                .map_err(|_| TradewindError::BrokerTimeout {
                    elapsed_ms: self.config.broker_timeout.as_millis() as u64,
                })??;
        Ok((account, clock))
    }

    fn build_context(
        &self,
        core: &EngineCore,
        account: &crate::broker::AccountSnapshot,
        clock: &crate::broker::MarketClock,
        vix: f64,
    ) -> MarketContext {
        MarketContext {
            vix,
            market_status: clock.status,
            account_equity: account.equity,
            buying_power: account.buying_power,
            existing_positions: core.positions.tickers().into_iter().collect(),
            cooldown_tickers: core.cooldowns.all_active(Utc::now()),
        }
    }

    /// Fetch a technical snapshot through the per-cycle cache.
    async fn fetch_signals(
        &self,
        core: &mut EngineCore,
        ticker: &str,
    ) -> Option<TechnicalSignals> {
        let now = Utc::now();
        if let Some(cached) = core.cache.get(ticker, now) {
            debug!(ticker, "signal cache hit");
            return Some(cached);
        }
        match tokio::time::timeout(
            self.config.broker_timeout,
            self.signal_provider.fetch_signals(ticker),
        )
        .await
        {
            Ok(Ok(signals)) => {
                core.cache.insert(signals.clone(), now);
                debug!(ticker, "signal cache fill");
                Some(signals)
            }
            Ok(Err(e)) => {
                warn!(ticker, "signal fetch failed: {e}");
                None
            }
            Err(_) => {
                warn!(ticker, "signal fetch timed out");
                None
            }
        }
    }

    async fn process_exits(
        &self,
        core: &mut EngineCore,
        account: &crate::broker::AccountSnapshot,
        clock: &crate::broker::MarketClock,
        vix: f64,
        summary: &mut CycleSummary,
    ) {
        for position in core.positions.all() {
            let ticker = position.ticker.clone();

            // Bracket orders are the primary exit mechanism; the broker
            // manages them and dynamic evaluation is skipped entirely.
            if position.has_bracket_order {
                debug!(
                    %ticker,
                    stop = ?position.stop_loss,
                    target = ?position.target,
                    "exit skipped, bracket active"
                );
                continue;
            }

            summary.exits_evaluated += 1;

            // Missing signals degrade to hold.
            let Some(signals) = self.fetch_signals(core, &ticker).await else {
                continue;
            };
            let context = self.build_context(core, account, clock, vix);

            let decision = {
                let mut strategy = match self.strategy.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => {
                        self.events.emit(EngineEvent::StrategyError {
                            timestamp: Utc::now(),
                            ticker: ticker.clone(),
                            stage: "evaluate_exit".to_string(),
                            reason: "strategy panicked previously".to_string(),
                        });
                        poisoned.into_inner()
                    }
                };
                strategy.evaluate_exit(&position, &signals, &context)
            };

            if !decision.should_exit {
                continue;
            }

            info!(
                %ticker,
                reason = %decision.reason,
                urgency = %decision.urgency,
                "dynamic exit triggered"
            );

            match core.orders.close_position(&ticker, decision.urgency).await {
                Ok(_outcome) => {
                    let now = Utc::now();
                    core.positions.record_exit_attempt(&ticker, now);
                    // Remove optimistically; the next broker sync confirms.
                    let removed = core.positions.remove(&ticker);
                    core.cooldowns
                        .add(&ticker, self.config.cooldown, "exit", "engine");
                    summary.exits_triggered += 1;

                    if let Some(closed) = removed {
                        self.events.emit(EngineEvent::ExitTriggered {
                            timestamp: now,
                            ticker: ticker.clone(),
                            strategy: closed.strategy_name.clone(),
                            side: closed.side,
                            quantity: closed.quantity,
                            entry_price: closed.avg_entry_price,
                            pnl: closed.unrealized_pnl,
                            pnl_pct: closed.unrealized_pnl_pct,
                            reason: decision.reason.clone(),
                            urgency: decision.urgency,
                            exit_mechanism: ExitMechanism::DynamicExit,
                        });
                    }
                }
                Err(e) => {
                    warn!(%ticker, "dynamic exit failed: {e}");
                    core.positions.record_exit_attempt(&ticker, Utc::now());
                    self.note_reject(core, &ticker);
                }
            }
        }
    }

    async fn process_entries(
        &self,
        core: &mut EngineCore,
        account: &crate::broker::AccountSnapshot,
        clock: &crate::broker::MarketClock,
        vix: f64,
        summary: &mut CycleSummary,
    ) -> Result<()> {
        let now = Utc::now();
        let open = core.positions.count();
        let available = self.config.max_positions.saturating_sub(open);

        if available == 0 {
            let pending = self.queue.lock().expect("queue lock").size();
            if pending > 0 {
                self.events.emit(EngineEvent::CapacityReached {
                    timestamp: now,
                    ticker: None,
                    positions_open: open,
                    max_positions: self.config.max_positions,
                });
            }
            return Ok(());
        }

        let popped = self
            .queue
            .lock()
            .expect("queue lock")
            .pop_ready(now, available);

        for signal in popped {
            summary.entries_evaluated += 1;
            let ticker = signal.ticker.clone();

            // Capacity may have been consumed by earlier entries this cycle.
            if core.positions.count() >= self.config.max_positions {
                self.events.emit(EngineEvent::CapacityReached {
                    timestamp: Utc::now(),
                    ticker: Some(ticker),
                    positions_open: core.positions.count(),
                    max_positions: self.config.max_positions,
                });
                continue;
            }

            // Common pre-filter. Strategies repeat these checks, but the
            // engine enforces them regardless of the strategy in play.
            let blocked = if !clock.status.is_open() {
                Some(format!("market is {}", clock.status))
            } else if core.positions.has(&ticker) {
                Some(format!("already holding {ticker}"))
            } else if core.cooldowns.contains(&ticker, Utc::now()) {
                Some(format!("{ticker} is in cooldown"))
            } else {
                None
            };
            if let Some(reason) = blocked {
                self.events.emit(EngineEvent::SignalRejected {
                    timestamp: Utc::now(),
                    ticker,
                    reason,
                });
                continue;
            }

            let Some(ta_signals) = self.fetch_signals(core, &ticker).await else {
                self.events.emit(EngineEvent::SignalRejected {
                    timestamp: Utc::now(),
                    ticker,
                    reason: "signals_unavailable".to_string(),
                });
                continue;
            };
            let context = self.build_context(core, account, clock, vix);

            let decision = {
                let mut strategy = match self.strategy.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => {
                        self.events.emit(EngineEvent::StrategyError {
                            timestamp: Utc::now(),
                            ticker: ticker.clone(),
                            stage: "evaluate_entry".to_string(),
                            reason: "strategy panicked previously".to_string(),
                        });
                        poisoned.into_inner()
                    }
                };
                strategy.evaluate_entry(&ta_signals, &context, signal.agent_recommendation.as_ref())
            };

            if !decision.should_enter {
                self.events.emit(EngineEvent::SignalRejected {
                    timestamp: Utc::now(),
                    ticker,
                    reason: decision.reason,
                });
                continue;
            }

            // Safety invariant: an accepted entry carries a stop and a size.
            let (stop_loss, target, size) = match (decision.stop_loss, decision.target, decision.suggested_size) {
                (Some(stop), Some(target), size) if size > 0 => (stop, target, size),
                _ => {
                    self.events.emit(EngineEvent::StrategyError {
                        timestamp: Utc::now(),
                        ticker: ticker.clone(),
                        stage: "entry_safety_invariant".to_string(),
                        reason: format!(
                            "accepted entry without stop/size: stop={:?} target={:?} size={}",
                            decision.stop_loss, decision.target, decision.suggested_size
                        ),
                    });
                    return Err(TradewindError::Internal(format!(
                        "entry decision for {ticker} violates stop-loss invariant"
                    )));
                }
            };

            let strategy_name = {
                let strategy = match self.strategy.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                strategy.name().to_string()
            };
            let params = OrderParams {
                ticker: ticker.clone(),
                side: signal.action,
                quantity: size,
                entry_price: decision.entry_price,
                stop_loss,
                target,
                strategy_name: strategy_name.clone(),
            };

            match core.orders.submit_bracket_order(&params, Urgency::Normal).await {
                Ok(outcome) => {
                    let side = signal.action.opening_side();
                    core.positions.add_position(
                        &ticker,
                        side,
                        size,
                        decision.entry_price,
                        &strategy_name,
                        Some(stop_loss),
                        Some(target),
                        Some(outcome.order_id().to_string()),
                    );
                    summary.entries_triggered += 1;
                    self.events.emit(EngineEvent::EntryTriggered {
                        timestamp: Utc::now(),
                        ticker: ticker.clone(),
                        strategy: strategy_name,
                        side,
                        quantity: size,
                        entry_price: decision.entry_price,
                        stop_loss,
                        target,
                        reason: decision.reason,
                    });
                }
                Err(e) => {
                    // order_rejected was already emitted by the order manager.
                    warn!(%ticker, "entry submission failed: {e}");
                    if matches!(e, TradewindError::BrokerRejected { .. }) {
                        self.note_reject(core, &ticker);
                    }
                }
            }
        }

        Ok(())
    }

    async fn poll_order_updates(&self, core: &mut EngineCore) {
        let updates = match core.orders.poll_orders().await {
            Ok(updates) => updates,
            Err(e) => {
                warn!("order poll failed: {e}");
                return;
            }
        };

        for update in updates {
            match update.kind {
                OrderEventKind::Filled => {
                    let mut opened = None;
                    if let Some(position) = core.positions.get_mut(&update.ticker) {
                        if position.entry_order_id.as_deref() == Some(update.order_id.as_str()) {
                            if let Some(fill_price) = update.fill_price {
                                position.avg_entry_price = fill_price;
                                position.set_current_price(fill_price);
                            }
                            opened = Some(position.clone());
                        }
                    }
                    self.events.emit(EngineEvent::OrderFilled {
                        timestamp: update.timestamp,
                        ticker: update.ticker.clone(),
                        order_id: update.order_id.clone(),
                        quantity: update.quantity,
                        fill_price: update.fill_price,
                    });
                    if let Some(position) = opened {
                        self.events.emit(EngineEvent::PositionOpened {
                            timestamp: update.timestamp,
                            ticker: position.ticker.clone(),
                            side: position.side,
                            quantity: position.quantity,
                            entry_price: position.avg_entry_price,
                            strategy: position.strategy_name.clone(),
                            order_id: update.order_id.clone(),
                        });
                    }
                }
                OrderEventKind::Rejected => {
                    self.events.emit(EngineEvent::OrderRejected {
                        timestamp: update.timestamp,
                        ticker: update.ticker.clone(),
                        order_id: Some(update.order_id.clone()),
                        reason: update
                            .reason
                            .clone()
                            .unwrap_or_else(|| "rejected by broker".to_string()),
                    });
                    // A rejected bracket leaves the position unprotected;
                    // dynamic exit takes over from here.
                    if let Some(position) = core.positions.get_mut(&update.ticker) {
                        position.has_bracket_order = false;
                    }
                    self.note_reject(core, &update.ticker);
                }
                OrderEventKind::Canceled => {
                    debug!(ticker = %update.ticker, order_id = %update.order_id, "order canceled");
                }
            }
        }
    }

    /// Count a broker reject; a streak within the window earns a cooldown.
    fn note_reject(&self, core: &mut EngineCore, ticker: &str) {
        let now = Utc::now();
        let cutoff = now - self.config.reject_window;
        let times = core.reject_times.entry(ticker.to_string()).or_default();
        times.push(now);
        times.retain(|t| *t > cutoff);

        if times.len() >= self.config.max_rejects_before_cooldown {
            info!(ticker, rejects = times.len(), "reject streak, applying cooldown");
            core.cooldowns
                .add(ticker, self.config.cooldown, "repeated_rejects", "engine");
            times.clear();
        }
    }

    fn persist(&self, core: &mut EngineCore) {
        let (positions, closed_positions) = core.positions.snapshot();
        let strategy_state = {
            let strategy = match self.strategy.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            strategy.snapshot()
        };
        let state = EngineState {
            version: STATE_VERSION.to_string(),
            saved_at: Utc::now(),
            signal_queue: self.queue.lock().expect("queue lock").snapshot(),
            positions,
            closed_positions,
            cooldowns: core.cooldowns.snapshot(),
            orders: core.orders.outstanding().clone(),
            strategy_state,
        };

        if let Err(e) = core.store.save(&state) {
            self.events.emit(EngineEvent::PersistenceFailed {
                timestamp: Utc::now(),
                reason: e.to_string(),
            });
        }
    }

    fn load_state(&self, core: &mut EngineCore) {
        let state = core.store.load();
        self.queue
            .lock()
            .expect("queue lock")
            .restore(state.signal_queue);
        core.positions
            .restore(state.positions, state.closed_positions);
        core.cooldowns.restore(state.cooldowns);
        core.orders.restore_outstanding(state.orders);

        let mut strategy = match self.strategy.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        strategy.restore(&state.strategy_state);
    }

    fn emit_cycle_complete(
        &self,
        core: &EngineCore,
        summary: &mut CycleSummary,
        started: Instant,
    ) {
        summary.signals_pending = self.queue.lock().expect("queue lock").size();
        summary.positions_open = core.positions.count();
        self.events.emit(EngineEvent::CycleComplete {
            timestamp: Utc::now(),
            cycle: summary.cycle,
            exits_evaluated: summary.exits_evaluated,
            exits_triggered: summary.exits_triggered,
            entries_evaluated: summary.entries_evaluated,
            entries_triggered: summary.entries_triggered,
            signals_pending: summary.signals_pending,
            positions_open: summary.positions_open,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// `draining -> stopped` once the current cycle has fully completed.
    fn finish_drain(&self) {
        let mut status = self.status.write().expect("status lock");
        if *status == EngineStatus::Draining {
            *status = EngineStatus::Stopped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::domain::{AgentRecommendation, Side, TradeAction};
    use crate::signals::{StaticMarketData, StaticSignalProvider};
    use crate::strategy::StrategyRegistry;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn engine_with(
        broker: Arc<PaperBroker>,
        provider: Arc<StaticSignalProvider>,
        strategy: crate::strategy::SharedStrategy,
        state_dir: &std::path::Path,
    ) -> ExecutionEngine {
        let config = EngineConfig {
            state_path: state_dir.join("engine-state.json"),
            ..EngineConfig::default()
        };
        ExecutionEngine::new(
            config,
            strategy,
            broker,
            provider,
            Arc::new(StaticMarketData { vix: Some(18.0) }),
            Arc::new(EventBus::new()),
        )
    }

    fn momentum_signal(ticker: &str) -> TechnicalSignals {
        TechnicalSignals {
            symbol: ticker.to_string(),
            price: dec!(150),
            atr: dec!(2.5),
            momentum: 5.0,
            score: 0.75,
            rsi: 55.0,
            signals: vec!["breakout".to_string()],
            bars: vec![],
        }
    }

    fn buy_signal(ticker: &str, priority: i32) -> PendingSignal {
        PendingSignal {
            ticker: ticker.to_string(),
            action: TradeAction::Buy,
            priority,
            confidence: 85.0,
            source: "analyst".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            agent_recommendation: Some(AgentRecommendation {
                entry_price: dec!(150),
                stop_loss: dec!(145),
                target: dec!(165),
                quantity: 100,
                trade_type: Side::Long,
            }),
        }
    }

    #[tokio::test]
    async fn test_happy_entry_submits_bracket() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(dec!(100_000)));
        let provider = Arc::new(StaticSignalProvider::new());
        provider.insert(momentum_signal("AAPL"));
        let strategy = StrategyRegistry::builtin().get("momentum").unwrap();
        let engine = engine_with(broker.clone(), provider, strategy, dir.path());

        engine.start();
        assert!(engine.add_signal(buy_signal("AAPL", 50)).is_accepted());

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.entries_triggered, 1);
        assert_eq!(summary.positions_open, 1);

        // Broker got the agent's exact levels.
        let positions = broker.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 100);
        assert_eq!(positions[0].avg_entry_price, dec!(150));
    }

    #[tokio::test]
    async fn test_signals_rejected_when_not_running() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(dec!(100_000)));
        let provider = Arc::new(StaticSignalProvider::new());
        let strategy = StrategyRegistry::builtin().get("momentum").unwrap();
        let engine = engine_with(broker, provider, strategy, dir.path());

        assert_eq!(engine.status(), EngineStatus::Stopped);
        let admission = engine.add_signal(buy_signal("AAPL", 50));
        assert!(!admission.is_accepted());
    }

    #[tokio::test]
    async fn test_stop_drains_after_cycle() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(dec!(100_000)));
        let provider = Arc::new(StaticSignalProvider::new());
        let strategy = StrategyRegistry::builtin().get("momentum").unwrap();
        let engine = engine_with(broker, provider, strategy, dir.path());

        engine.start();
        assert_eq!(engine.status(), EngineStatus::Running);
        engine.stop();
        assert_eq!(engine.status(), EngineStatus::Draining);

        engine.run_cycle().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_bracket_positions_skip_dynamic_exit() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(dec!(100_000)));
        let provider = Arc::new(StaticSignalProvider::new());
        provider.insert(momentum_signal("NVDA"));
        let strategy = StrategyRegistry::builtin().get("momentum").unwrap();
        let engine = engine_with(broker.clone(), provider, strategy, dir.path());

        engine.start();
        assert!(engine.add_signal(buy_signal("NVDA", 10)).is_accepted());
        let first = engine.run_cycle().await.unwrap();
        assert_eq!(first.entries_triggered, 1);

        // Second cycle: the position is bracket-protected, so evaluate_exit
        // is skipped and nothing counts as evaluated.
        let second = engine.run_cycle().await.unwrap();
        assert_eq!(second.exits_evaluated, 0);
        assert_eq!(second.exits_triggered, 0);
        assert_eq!(second.positions_open, 1);
    }

    #[tokio::test]
    async fn test_capacity_zero_leaves_queue_untouched() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(dec!(1_000_000)));
        let provider = Arc::new(StaticSignalProvider::new());
        for ticker in ["AAPL", "MSFT"] {
            provider.insert(momentum_signal(ticker));
        }
        let strategy = StrategyRegistry::builtin().get("momentum").unwrap();
        let config = EngineConfig {
            max_positions: 1,
            state_path: dir.path().join("engine-state.json"),
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(
            config,
            strategy,
            broker,
            provider,
            Arc::new(StaticMarketData { vix: Some(18.0) }),
            Arc::new(EventBus::new()),
        );

        engine.start();
        engine.add_signal(buy_signal("AAPL", 10));
        engine.add_signal(buy_signal("MSFT", 20));

        let summary = engine.run_cycle().await.unwrap();
        assert_eq!(summary.entries_triggered, 1);
        assert_eq!(summary.positions_open, 1);
        // MSFT still queued, not discarded.
        assert_eq!(summary.signals_pending, 1);

        let mut rx = engine.events().subscribe();
        let next = engine.run_cycle().await.unwrap();
        assert_eq!(next.entries_triggered, 0);
        assert_eq!(next.signals_pending, 1);

        let mut saw_capacity = false;
        while let Ok(event) = rx.try_recv() {
            if event.kind() == "capacity_reached" {
                saw_capacity = true;
            }
        }
        assert!(saw_capacity);
    }

    #[tokio::test]
    async fn test_analyze_mode_records_position_without_broker_order() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(dec!(100_000)));
        let provider = Arc::new(StaticSignalProvider::new());
        provider.insert(momentum_signal("AAPL"));
        let strategy = StrategyRegistry::builtin().get("momentum").unwrap();
        let config = EngineConfig {
            analyze_mode: true,
            state_path: dir.path().join("engine-state.json"),
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(
            config,
            strategy,
            broker.clone(),
            provider,
            Arc::new(StaticMarketData { vix: Some(18.0) }),
            Arc::new(EventBus::new()),
        );

        engine.start();
        let mut rx = engine.events().subscribe();
        engine.add_signal(buy_signal("AAPL", 50));
        let summary = engine.run_cycle().await.unwrap();

        // Entry recorded locally, nothing sent to the broker.
        assert_eq!(summary.entries_triggered, 1);
        assert!(broker.list_positions().await.unwrap().is_empty());

        let mut saw_dry_run = false;
        while let Ok(event) = rx.try_recv() {
            if event.kind() == "dry_run" {
                saw_dry_run = true;
            }
        }
        assert!(saw_dry_run);
    }

    #[tokio::test]
    async fn test_missing_signals_skip_entry() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(PaperBroker::new(dec!(100_000)));
        let provider = Arc::new(StaticSignalProvider::new()); // empty
        let strategy = StrategyRegistry::builtin().get("momentum").unwrap();
        let engine = engine_with(broker.clone(), provider, strategy, dir.path());

        engine.start();
        let mut rx = engine.events().subscribe();
        engine.add_signal(buy_signal("AAPL", 50));
        let summary = engine.run_cycle().await.unwrap();

        assert_eq!(summary.entries_triggered, 0);
        assert!(broker.list_positions().await.unwrap().is_empty());

        let mut saw_unavailable = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::SignalRejected { reason, .. } = &event {
                if reason == "signals_unavailable" {
                    saw_unavailable = true;
                }
            }
        }
        assert!(saw_unavailable);
    }
}
