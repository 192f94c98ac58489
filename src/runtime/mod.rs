//! Runtime wiring
//!
//! Builds the engine and its collaborators, restores snapshots before
//! any event processing, spawns one worker per symbol, and coordinates
//! graceful shutdown.

pub mod worker;

pub use worker::{SymbolWorker, WorkerDeps};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::domain::{Event, EventKind, Fill, Phase, SymbolState};
use crate::engine::{FsmEngine, ProtectionSwitcher, TimeoutManager};
use crate::error::{PylonError, Result};
use crate::exchange::{ExchangeClient, MarketData};
use crate::execution::{ExitExecutor, OrderRouter, RetryPolicy};
use crate::persistence::SnapshotStore;
use crate::portfolio::{BudgetLedger, PortfolioSink};

pub struct Runtime {
    deps: Arc<WorkerDeps>,
    senders: HashMap<String, mpsc::UnboundedSender<Event>>,
    handles: Vec<JoinHandle<SymbolState>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Wire every component. Nothing runs until [`Runtime::start`].
    pub async fn new(
        config: AppConfig,
        exchange: Arc<dyn ExchangeClient>,
        market: Arc<dyn MarketData>,
        portfolio: Arc<dyn PortfolioSink>,
    ) -> Result<Self> {
        let snapshots = Arc::new(SnapshotStore::new(&config.snapshot.dir).await?);
        let router = Arc::new(OrderRouter::new(
            exchange,
            RetryPolicy::from(&config.router),
        ));
        let switcher = Arc::new(ProtectionSwitcher::new(
            router.clone(),
            config.protection.on_replace_failure,
        ));
        let engine = Arc::new(FsmEngine::new(
            &config.engine,
            ProtectionSwitcher::new(router.clone(), config.protection.on_replace_failure),
            snapshots.clone(),
        )?);
        let exits = Arc::new(ExitExecutor::new(
            router.clone(),
            market.clone(),
            config.exit.clone(),
        ));
        let budget = Arc::new(BudgetLedger::new(&config.budget));
        let timeouts = TimeoutManager::new(&config.engine);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let deps = Arc::new(WorkerDeps {
            engine,
            router,
            market,
            exits,
            budget,
            portfolio,
            snapshots,
            switcher,
            timeouts,
            config,
        });

        Ok(Self {
            deps,
            senders: HashMap::new(),
            handles: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Restore every snapshot, rebuild the budget ledger from restored
    /// state, then spawn one worker per configured symbol. Restoration
    /// happens strictly before any event processing.
    pub async fn start(&mut self) -> Result<()> {
        let restored = self.deps.snapshots.load_all().await?;
        let mut restored_by_symbol: HashMap<String, SymbolState> = restored
            .into_iter()
            .map(|s| (s.symbol().to_string(), s))
            .collect();

        for state in restored_by_symbol.values() {
            // Capital deployed in restored positions is committed again;
            // in-flight buys get their reservations back under the same id
            if let Some(position) = &state.position {
                self.deps.budget.restore_committed(position.cost_basis());
            }
            if let (Some(id), Some(ctx)) = (state.reservation_id, &state.buy_order) {
                let remaining = ctx.remaining_qty();
                let price = ctx.limit_price.or(ctx.avg_fill_price);
                match price {
                    Some(price) if remaining > rust_decimal::Decimal::ZERO => {
                        self.deps
                            .budget
                            .restore_reservation(id, state.symbol(), remaining * price);
                    }
                    _ => {}
                }
            }
            info!(
                "{}: restored snapshot in {} (seq {})",
                state.symbol(),
                state.phase(),
                state.transition_seq
            );
        }

        let symbols = self.deps.config.symbols.clone();
        for symbol in symbols {
            let state = restored_by_symbol
                .remove(&symbol)
                .unwrap_or_else(|| SymbolState::new(&symbol));
            self.spawn_worker(state);
        }

        for (symbol, state) in restored_by_symbol {
            if state.phase() != Phase::Idle && state.phase() != Phase::Warmup {
                // A symbol with live state must keep its worker even if
                // the config no longer lists it
                warn!(
                    "{}: not in config but restored in {}; keeping its worker",
                    symbol,
                    state.phase()
                );
                self.spawn_worker(state);
            }
        }

        info!("runtime started with {} workers", self.senders.len());
        Ok(())
    }

    fn spawn_worker(&mut self, state: SymbolState) {
        let symbol = state.symbol().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SymbolWorker::new(
            state,
            self.deps.clone(),
            rx,
            tx.clone(),
            self.shutdown_rx.clone(),
        );
        self.senders.insert(symbol, tx);
        self.handles.push(tokio::spawn(worker.run()));
    }

    /// Route an event to its symbol's worker queue (FIFO per symbol).
    pub fn submit_event(&self, event: Event) -> Result<()> {
        let sender = self
            .senders
            .get(&event.symbol)
            .ok_or_else(|| PylonError::Validation(format!("unknown symbol {}", event.symbol)))?;
        sender
            .send(event)
            .map_err(|_| PylonError::Cancelled)
    }

    /// External entry signal (strategy, operator).
    pub fn on_entry_signal(&self, symbol: &str, reason: &str) -> Result<()> {
        self.submit_event(Event::new(EventKind::EntrySignal, symbol).with_reason(reason))
    }

    /// External exit signal.
    pub fn on_exit_signal(&self, symbol: &str, reason: &str) -> Result<()> {
        self.submit_event(Event::new(EventKind::ExitSignal, symbol).with_reason(reason))
    }

    /// Manual recovery out of ERROR.
    pub fn on_manual_reset(&self, symbol: &str) -> Result<()> {
        self.submit_event(Event::new(EventKind::ManualReset, symbol))
    }

    /// Exchange fill callback. Raw trades are normalized by the worker's
    /// accumulator into ORDER_PARTIAL / ORDER_FILLED.
    pub fn on_fill(&self, symbol: &str, fill: &Fill) -> Result<()> {
        let mut event = Event::new(EventKind::OrderPartial, symbol)
            .with_order_id(fill.order_id.clone())
            .with_trade_id(fill.trade_id.clone())
            .with_fill(fill.qty, fill.price, fill.fee);
        event.timestamp = fill.timestamp;
        self.submit_event(event)
    }

    pub fn engine(&self) -> &Arc<FsmEngine> {
        &self.deps.engine
    }

    pub fn budget(&self) -> &Arc<BudgetLedger> {
        &self.deps.budget
    }

    /// Signal shutdown and wait for every worker to park its final
    /// snapshot, bounded by `drain`.
    pub async fn shutdown(mut self, drain: Duration) -> Result<()> {
        info!("runtime shutdown requested");
        let _ = self.shutdown_tx.send(true);

        for handle in self.handles.drain(..) {
            match timeout(drain, handle).await {
                Ok(Ok(state)) => {
                    info!("{}: worker drained in {}", state.symbol(), state.phase());
                }
                Ok(Err(e)) => warn!("worker task failed: {}", e),
                Err(_) => warn!("worker did not drain within {:?}", drain),
            }
        }
        info!("runtime stopped");
        Ok(())
    }
}
