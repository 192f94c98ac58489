//! Per-symbol worker
//!
//! One worker owns one symbol's state. It consumes that symbol's events
//! FIFO, runs the timeout checks once per cycle, and performs the
//! phase-driven exchange I/O (guard evaluation, order submission,
//! protection management, exit execution) that produces the next events.
//! Exchange calls suspend only this worker, never the engine globally.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::domain::{
    Event, EventKind, Fill, OrderRequest, Phase, PositionInfo, ProtectionKind, ProtectionState,
    SymbolState,
};
use crate::engine::{FsmEngine, ProtectionSwitcher, TimeoutManager};
use crate::exchange::MarketData;
use crate::execution::fills::{accumulate_fill, progress_event, FILL_COMPLETE_RATIO};
use crate::execution::{ExitExecutor, ExitReason, OrderRouter};
use crate::persistence::SnapshotStore;
use crate::portfolio::{BudgetLedger, PortfolioSink, PositionClosed, PositionOpened};

/// Shared collaborators handed to every worker
pub struct WorkerDeps {
    pub engine: Arc<FsmEngine>,
    pub router: Arc<OrderRouter>,
    pub market: Arc<dyn MarketData>,
    pub exits: Arc<ExitExecutor>,
    pub budget: Arc<BudgetLedger>,
    pub portfolio: Arc<dyn PortfolioSink>,
    pub snapshots: Arc<SnapshotStore>,
    pub switcher: Arc<ProtectionSwitcher>,
    pub timeouts: TimeoutManager,
    pub config: AppConfig,
}

/// State captured before a transition, for post-commit effects
struct PreSnapshot {
    phase: Phase,
    reservation_id: Option<uuid::Uuid>,
    position: Option<PositionInfo>,
}

pub struct SymbolWorker {
    state: SymbolState,
    deps: Arc<WorkerDeps>,
    rx: mpsc::UnboundedReceiver<Event>,
    /// Hands spawned tasks (exit ladder) a way back into this queue
    self_tx: mpsc::UnboundedSender<Event>,
    shutdown: watch::Receiver<bool>,
}

impl SymbolWorker {
    pub fn new(
        state: SymbolState,
        deps: Arc<WorkerDeps>,
        rx: mpsc::UnboundedReceiver<Event>,
        self_tx: mpsc::UnboundedSender<Event>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            deps,
            rx,
            self_tx,
            shutdown,
        }
    }

    pub async fn run(mut self) -> SymbolState {
        let symbol = self.state.symbol().to_string();
        info!("{}: worker starting in {}", symbol, self.state.phase());

        self.reconcile_startup().await;

        let mut cycle = interval(Duration::from_millis(
            self.deps.config.engine.cycle_interval_ms,
        ));
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(event) => { self.handle_event(event).await; }
                        None => break,
                    }
                }
                _ = cycle.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        // Final snapshot so a restart resumes exactly here
        if let Err(e) = self.deps.snapshots.save(&self.state).await {
            error!("{}: final snapshot failed: {}", symbol, e);
        }
        info!("{}: worker stopped in {}", symbol, self.state.phase());
        self.state
    }

    /// Reconcile restored state against the exchange before processing
    /// anything. An order submitted just before a crash must be adopted,
    /// never re-submitted.
    pub async fn reconcile_startup(&mut self) {
        if self.state.phase() != Phase::PlaceBuy {
            return;
        }
        let Some(ctx) = self.state.buy_order.clone() else {
            return;
        };
        if ctx.order_id.is_some() {
            return;
        }

        match self
            .deps
            .router
            .lookup_client_order(&ctx.client_order_id)
            .await
        {
            Ok(Some(snapshot)) => {
                info!(
                    "{}: adopted in-flight order {} for {}",
                    self.state.symbol(),
                    snapshot.order_id,
                    ctx.client_order_id
                );
                let event = Event::new(EventKind::BuyPlaced, self.state.symbol())
                    .with_order_id(snapshot.order_id);
                self.handle_event(event).await;
            }
            Ok(None) => {
                debug!(
                    "{}: no exchange order for {}, submission will retry",
                    self.state.symbol(),
                    ctx.client_order_id
                );
            }
            Err(e) => {
                warn!("{}: startup reconciliation failed: {}", self.state.symbol(), e);
            }
        }
    }

    /// Entry point for every event aimed at this symbol.
    pub async fn handle_event(&mut self, event: Event) {
        match event.kind {
            // Raw trade deliveries carry a trade id and get normalized
            // through the accumulator before hitting the table
            EventKind::OrderPartial | EventKind::OrderFilled if event.trade_id.is_some() => {
                self.handle_raw_fill(event).await;
            }
            EventKind::BuyOrderTimeout => {
                self.resolve_buy_timeout(event).await;
            }
            _ => {
                self.dispatch(event).await;
            }
        }
    }

    /// Run the event through the engine and apply post-commit effects.
    async fn dispatch(&mut self, event: Event) -> bool {
        let pre = PreSnapshot {
            phase: self.state.phase(),
            reservation_id: self.state.reservation_id,
            position: self.state.position.clone(),
        };

        let applied = self.deps.engine.process_event(&mut self.state, &event).await;
        if applied {
            self.post_transition(pre).await;
        }
        applied
    }

    /// Budget and portfolio effects keyed on the committed transition.
    async fn post_transition(&mut self, pre: PreSnapshot) {
        let now_phase = self.state.phase();
        let symbol = self.state.symbol().to_string();

        match (pre.phase, now_phase) {
            // Entry abandoned: the reservation goes back to free budget
            (Phase::EntryEval, Phase::Idle)
            | (Phase::PlaceBuy, Phase::Idle)
            | (Phase::WaitFill, Phase::Idle) => {
                if let Some(id) = pre.reservation_id {
                    self.deps.budget.release(id);
                }
            }

            // Buy filled: commit the reservation at actual cost, tell the
            // portfolio
            (Phase::WaitFill, Phase::Position) => {
                if let Some(position) = self.state.position.clone() {
                    if let Some(id) = pre.reservation_id {
                        if let Err(e) = self.deps.budget.commit(id, position.cost_basis()) {
                            warn!("{}: reservation commit failed: {}", symbol, e);
                        }
                    }
                    self.deps
                        .portfolio
                        .position_opened(PositionOpened {
                            symbol: symbol.clone(),
                            qty: position.qty,
                            avg_price: position.avg_entry_price,
                            fees: position.entry_fees,
                            opened_at: position.opened_at,
                        })
                        .await;
                }
            }

            // Exit aborted after partial fills: the sold portion's
            // capital is no longer deployed
            (Phase::WaitSellFill, Phase::Position) => {
                if let Some(position) = &pre.position {
                    let sold = self
                        .state
                        .position
                        .as_ref()
                        .map(|p| position.qty - p.qty)
                        .unwrap_or(Decimal::ZERO);
                    if sold > Decimal::ZERO {
                        self.deps
                            .budget
                            .settle_close(sold * position.avg_entry_price);
                    }
                }
            }

            _ => {}
        }
    }

    /// Normalize a raw trade into ORDER_PARTIAL / ORDER_FILLED through
    /// the accumulator, or into PROTECTION_FILLED when it belongs to the
    /// resting protective order.
    async fn handle_raw_fill(&mut self, event: Event) {
        let Some(order_id) = event.order_id.clone() else {
            warn!("{}: fill without order id dropped", self.state.symbol());
            return;
        };

        // Protective order fills close the position
        if self
            .state
            .protection
            .as_ref()
            .and_then(|p| p.order_id())
            .map(|id| id == order_id)
            .unwrap_or(false)
        {
            self.check_protective_fill(&order_id).await;
            return;
        }

        let matches = |ctx: &Option<crate::domain::OrderContext>| {
            ctx.as_ref()
                .and_then(|c| c.order_id.as_deref())
                .map(|id| id == order_id)
                .unwrap_or(false)
        };
        let ctx = if matches(&self.state.buy_order) {
            self.state.buy_order.clone()
        } else if matches(&self.state.sell_order) {
            self.state.sell_order.clone()
        } else {
            debug!(
                "{}: fill for unknown order {} ignored",
                self.state.symbol(),
                order_id
            );
            return;
        };
        let Some(ctx) = ctx else {
            return;
        };

        // Probe the progress on a scratch copy; the real mutation happens
        // inside the action so state only ever changes through the table.
        let (Some(qty), Some(price)) = (event.filled_qty, event.avg_price) else {
            warn!("{}: fill without quantity/price dropped", self.state.symbol());
            return;
        };
        let fill = Fill {
            order_id: order_id.clone(),
            trade_id: event.trade_id.clone().unwrap_or_default(),
            qty,
            price,
            fee: event.fee.unwrap_or(Decimal::ZERO),
            timestamp: event.timestamp,
        };
        let mut probe = ctx;
        let progress = accumulate_fill(&mut probe, &fill);

        let mut normalized = progress_event(&probe, progress, self.state.symbol());
        // Keep the raw trade payload so the action accumulates exactly
        // this fill
        normalized.filled_qty = Some(fill.qty);
        normalized.avg_price = Some(fill.price);
        normalized.fee = Some(fill.fee);
        normalized.trade_id = Some(fill.trade_id.clone());
        normalized.timestamp = event.timestamp;

        self.dispatch(normalized).await;
    }

    /// Fetch the protective order's authoritative state; a full fill
    /// means the position closed at the trigger.
    async fn check_protective_fill(&mut self, order_id: &str) {
        match self.deps.router.fetch(order_id).await {
            Ok(snap) if snap.status == crate::domain::OrderStatus::Filled => {
                let event = Event::new(EventKind::ProtectionFilled, self.state.symbol())
                    .with_order_id(order_id)
                    .with_fill(
                        snap.filled_qty,
                        snap.avg_fill_price.unwrap_or(Decimal::ZERO),
                        snap.total_fees,
                    );
                self.dispatch(event).await;
            }
            Ok(_) => {
                debug!(
                    "{}: protective order {} partially filled, waiting",
                    self.state.symbol(),
                    order_id
                );
            }
            Err(e) => {
                warn!(
                    "{}: could not fetch protective order {}: {}",
                    self.state.symbol(),
                    order_id,
                    e
                );
            }
        }
    }

    /// A buy timeout first cancels, then fetches the authoritative final
    /// state: any filled quantity is adopted as a position rather than
    /// silently dropped.
    async fn resolve_buy_timeout(&mut self, event: Event) {
        let Some(ctx) = self.state.buy_order.clone() else {
            self.dispatch(event).await;
            return;
        };
        let Some(order_id) = ctx.order_id.clone() else {
            self.dispatch(event).await;
            return;
        };

        if let Err(e) = self.deps.router.cancel(&order_id).await {
            warn!(
                "{}: cancel of timed-out buy {} failed: {}",
                self.state.symbol(),
                order_id,
                e
            );
        }

        match self.deps.router.fetch(&order_id).await {
            Ok(snap) if snap.filled_qty > Decimal::ZERO => {
                info!(
                    "{}: buy timeout with {} filled, adopting position",
                    self.state.symbol(),
                    snap.filled_qty
                );
                let adopted = Event::new(EventKind::OrderFilled, self.state.symbol())
                    .with_order_id(order_id)
                    .with_fill(
                        snap.filled_qty,
                        snap.avg_fill_price.unwrap_or(Decimal::ZERO),
                        snap.total_fees,
                    );
                self.dispatch(adopted).await;
            }
            Ok(_) => {
                self.dispatch(event).await;
            }
            Err(e) => {
                warn!(
                    "{}: could not fetch timed-out buy {}: {}",
                    self.state.symbol(),
                    order_id,
                    e
                );
                self.dispatch(event).await;
            }
        }
    }

    /// One periodic cycle: timeouts first, then the phase's own work.
    pub async fn run_cycle(&mut self) {
        let now = Utc::now();
        let timeout_events = self.deps.timeouts.check_all_timeouts(&self.state, now);
        for event in timeout_events {
            self.handle_event(event).await;
        }

        match self.state.phase() {
            Phase::Warmup => self.cycle_warmup().await,
            Phase::EntryEval => self.cycle_entry_eval().await,
            Phase::PlaceBuy => self.cycle_place_buy().await,
            Phase::WaitFill => self.cycle_poll_buy().await,
            Phase::Position => self.cycle_position().await,
            Phase::ExitEval => self.cycle_exit_eval().await,
            Phase::PlaceSell => self.cycle_place_sell().await,
            Phase::PostTrade => self.cycle_post_trade().await,
            _ => {}
        }
    }

    async fn fresh_ticker(&self, max_age_secs: u64) -> Option<crate::exchange::Ticker> {
        match self.deps.market.get_ticker(self.state.symbol()).await {
            Ok(ticker) if !ticker.is_stale(max_age_secs, Utc::now()) => Some(ticker),
            Ok(_) => None,
            Err(_) => None,
        }
    }

    async fn cycle_warmup(&mut self) {
        if self
            .fresh_ticker(self.deps.config.entry.max_ticker_age_secs)
            .await
            .is_some()
        {
            let event = Event::new(EventKind::WarmupComplete, self.state.symbol());
            self.dispatch(event).await;
        }
    }

    /// Entry guards: fresh market data, then a budget reservation. The
    /// reservation happens before any order is placed; denial means the
    /// entry never reaches the router.
    async fn cycle_entry_eval(&mut self) {
        let symbol = self.state.symbol().to_string();
        let Some(ticker) = self
            .fresh_ticker(self.deps.config.entry.max_ticker_age_secs)
            .await
        else {
            let event =
                Event::new(EventKind::EntryRejected, &symbol).with_reason("stale_ticker");
            self.dispatch(event).await;
            return;
        };

        let qty = self.deps.config.entry.order_qty;
        let amount = qty * ticker.ask;
        match self.deps.budget.reserve(&symbol, amount) {
            Ok(reservation_id) => {
                let mut event = Event::new(EventKind::EntryApproved, &symbol)
                    .with_reservation(reservation_id)
                    .with_price(ticker.ask);
                event.filled_qty = Some(qty);
                self.dispatch(event).await;
            }
            Err(e) => {
                info!("{}: entry denied: {}", symbol, e);
                let event = Event::new(EventKind::EntryRejected, &symbol)
                    .with_reason(e.to_string());
                self.dispatch(event).await;
            }
        }
    }

    async fn cycle_place_buy(&mut self) {
        let symbol = self.state.symbol().to_string();
        let Some(ctx) = self.state.buy_order.clone() else {
            let event = Event::new(EventKind::BuyRejected, &symbol)
                .with_reason("missing buy context");
            self.dispatch(event).await;
            return;
        };
        let Some(ticker) = self
            .fresh_ticker(self.deps.config.entry.max_ticker_age_secs)
            .await
        else {
            // No fresh price to peg the limit to; retry next cycle
            return;
        };

        let request = OrderRequest::buy_limit(&symbol, ctx.target_qty, ticker.ask)
            .with_client_order_id(ctx.client_order_id.clone());
        match self.deps.router.submit(&request).await {
            Ok(ack) => {
                let event = Event::new(EventKind::BuyPlaced, &symbol)
                    .with_order_id(ack.order_id)
                    .with_price(ticker.ask);
                self.dispatch(event).await;
            }
            Err(e) => {
                warn!("{}: buy submission failed: {}", symbol, e);
                let event =
                    Event::new(EventKind::BuyRejected, &symbol).with_reason(e.to_string());
                self.dispatch(event).await;
            }
        }
    }

    /// Poll the working buy order. Covers venues without fill callbacks
    /// and closes any gap after a restart: only quantity the context has
    /// not seen yet produces an event.
    async fn cycle_poll_buy(&mut self) {
        let Some(ctx) = self.state.buy_order.clone() else {
            return;
        };
        let Some(order_id) = ctx.order_id.clone() else {
            return;
        };

        let snap = match self.deps.router.fetch(&order_id).await {
            Ok(snap) => snap,
            Err(e) => {
                warn!("{}: buy poll failed: {}", self.state.symbol(), e);
                return;
            }
        };

        if snap.filled_qty > ctx.cumulative_filled_qty {
            let complete = !ctx.target_qty.is_zero()
                && snap.filled_qty / ctx.target_qty >= FILL_COMPLETE_RATIO;
            let kind = if complete {
                EventKind::OrderFilled
            } else {
                EventKind::OrderPartial
            };
            let event = Event::new(kind, self.state.symbol())
                .with_order_id(order_id)
                .with_fill(
                    snap.filled_qty,
                    snap.avg_fill_price.unwrap_or(Decimal::ZERO),
                    snap.total_fees,
                );
            self.dispatch(event).await;
        } else if snap.status.is_terminal() && snap.filled_qty.is_zero() {
            // Cancelled or rejected out from under us with nothing filled
            let event = Event::new(EventKind::BuyOrderTimeout, self.state.symbol())
                .with_order_id(order_id);
            self.handle_event(event).await;
        }
    }

    /// Position upkeep: initial protection, protective-fill detection,
    /// and threshold evaluation that triggers switch-class events.
    async fn cycle_position(&mut self) {
        let Some(position) = self.state.position.clone() else {
            return;
        };
        let symbol = self.state.symbol().to_string();
        let protection_config = self.deps.config.protection.clone();

        match self.state.protection.clone() {
            None => {
                // A fresh position (or one left unprotected by a failed
                // switch) gets a stop-loss first
                let trigger = position.avg_entry_price
                    * (Decimal::ONE - protection_config.stop_loss_pct);
                let Some(_guard) = self.deps.engine.locks().try_acquire(&symbol) else {
                    return;
                };
                match self
                    .deps
                    .switcher
                    .place_initial(&mut self.state, ProtectionKind::StopLoss, trigger)
                    .await
                {
                    Ok(_) => {
                        if let Err(e) = self.deps.snapshots.save(&self.state).await {
                            error!("{}: snapshot after protection placement failed: {}", symbol, e);
                        }
                    }
                    Err(e) => {
                        warn!("{}: initial protection failed: {}", symbol, e);
                    }
                }
            }
            Some(ProtectionState::Active { kind, order_id, .. }) => {
                // Did the protective order execute?
                if let Ok(snap) = self.deps.router.fetch(&order_id).await {
                    if snap.status == crate::domain::OrderStatus::Filled {
                        let event = Event::new(EventKind::ProtectionFilled, &symbol)
                            .with_order_id(order_id)
                            .with_fill(
                                snap.filled_qty,
                                snap.avg_fill_price.unwrap_or(Decimal::ZERO),
                                snap.total_fees,
                            );
                        self.dispatch(event).await;
                        return;
                    }
                }

                // Threshold evaluation: arm to take-profit once the price
                // has moved enough in our favor, otherwise stop-loss
                let Some(ticker) = self
                    .fresh_ticker(self.deps.config.entry.max_ticker_age_secs)
                    .await
                else {
                    return;
                };
                let armed = ticker.last
                    >= position.avg_entry_price
                        * (Decimal::ONE + protection_config.arm_threshold_pct);
                let desired = if armed {
                    ProtectionKind::TakeProfit
                } else {
                    ProtectionKind::StopLoss
                };
                if desired != kind {
                    let (event_kind, trigger) = match desired {
                        ProtectionKind::TakeProfit => (
                            EventKind::SwitchToTakeProfit,
                            position.avg_entry_price
                                * (Decimal::ONE + protection_config.take_profit_pct),
                        ),
                        ProtectionKind::StopLoss => (
                            EventKind::SwitchToStopLoss,
                            position.avg_entry_price
                                * (Decimal::ONE - protection_config.stop_loss_pct),
                        ),
                    };
                    let event = Event::new(event_kind, &symbol).with_price(trigger);
                    self.dispatch(event).await;
                }
            }
            Some(ProtectionState::Switching { .. }) => {
                // A handover is mid-flight; nothing to evaluate against
            }
        }
    }

    async fn cycle_exit_eval(&mut self) {
        let symbol = self.state.symbol().to_string();
        if self
            .fresh_ticker(self.deps.config.exit.max_ticker_age_secs)
            .await
            .is_some()
        {
            let event = Event::new(EventKind::ExitApproved, &symbol);
            self.dispatch(event).await;
        } else {
            let event =
                Event::new(EventKind::ExitRejected, &symbol).with_reason("stale_ticker");
            self.dispatch(event).await;
        }
    }

    /// Cancel the protective order, then hand the close to the exit
    /// executor in a spawned task; its outcome comes back through this
    /// worker's own queue.
    async fn cycle_place_sell(&mut self) {
        let symbol = self.state.symbol().to_string();
        let Some(position) = self.state.position.clone() else {
            let event = Event::new(EventKind::SellRejected, &symbol)
                .with_reason("no position to close");
            self.dispatch(event).await;
            return;
        };

        match self.state.protection.clone() {
            Some(ProtectionState::Active { order_id, .. }) => {
                if let Err(e) = self.deps.router.cancel(&order_id).await {
                    // The protective order still rests; retry next cycle
                    // rather than risk a double sell
                    warn!("{}: protective cancel before exit failed: {}", symbol, e);
                    return;
                }
            }
            Some(ProtectionState::Switching { .. }) => {
                // Wait for the switch to settle
                return;
            }
            None => {}
        }

        let placed = Event::new(EventKind::SellPlaced, &symbol);
        if !self.dispatch(placed).await {
            return;
        }

        let reason = match self.state.exit_reason.as_deref() {
            Some("manual") => ExitReason::Manual,
            Some("shutdown") => ExitReason::Shutdown,
            Some("protective") => ExitReason::Protective,
            _ => ExitReason::Signal,
        };
        let exits = self.deps.exits.clone();
        let tx = self.self_tx.clone();
        let qty = position.qty;
        tokio::spawn(async move {
            let result = exits.execute_exit(&symbol, qty, reason).await;
            if result.success {
                let event = Event::new(EventKind::OrderFilled, &symbol).with_fill(
                    result.filled_qty,
                    result.avg_price.unwrap_or(Decimal::ZERO),
                    result.total_fees,
                );
                let _ = tx.send(event);
            } else {
                if result.filled_qty > Decimal::ZERO {
                    let partial = Event::new(EventKind::OrderPartial, &symbol).with_fill(
                        result.filled_qty,
                        result.avg_price.unwrap_or(Decimal::ZERO),
                        result.total_fees,
                    );
                    let _ = tx.send(partial);
                }
                let event = Event::new(EventKind::SellOrderTimeout, &symbol)
                    .with_reason(result.reason.unwrap_or_else(|| "exit_failed".to_string()));
                let _ = tx.send(event);
            }
        });
    }

    /// Settle the finished trade: portfolio notification, budget return,
    /// then the cooldown transition.
    async fn cycle_post_trade(&mut self) {
        let symbol = self.state.symbol().to_string();

        if let (Some(position), Some(sell_ctx)) =
            (self.state.position.clone(), self.state.sell_order.clone())
        {
            let avg_exit = sell_ctx.avg_fill_price.unwrap_or(Decimal::ZERO);
            let fees = position.entry_fees + sell_ctx.total_fees;
            let realized_pnl = PositionClosed::compute_pnl(
                sell_ctx.cumulative_filled_qty,
                position.avg_entry_price,
                avg_exit,
                fees,
            );
            self.deps
                .portfolio
                .position_closed(PositionClosed {
                    symbol: symbol.clone(),
                    qty: sell_ctx.cumulative_filled_qty,
                    avg_entry_price: position.avg_entry_price,
                    avg_exit_price: avg_exit,
                    fees,
                    realized_pnl,
                    exit_reason: self
                        .state
                        .exit_reason
                        .clone()
                        .unwrap_or_else(|| "signal".to_string()),
                    closed_at: Utc::now(),
                })
                .await;
            self.deps.budget.settle_close(position.cost_basis());
        } else {
            warn!("{}: settling trade without full context", symbol);
        }

        let event = Event::new(EventKind::TradeSettled, &symbol);
        self.dispatch(event).await;
    }

    /// Drain every event currently queued, without blocking. Embedders
    /// driving the worker manually (tests, simulations) call this between
    /// cycles instead of [`SymbolWorker::run`].
    pub async fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle_event(event).await;
            processed += 1;
        }
        processed
    }

    pub fn state(&self) -> &SymbolState {
        &self.state
    }
}
