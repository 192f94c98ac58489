//! Shared harness for the integration suites: every collaborator wired
//! the way the runtime wires them, but with a directly-pumped worker.

use pylon::config::AppConfig;
use pylon::engine::{FsmEngine, ProtectionSwitcher, TimeoutManager};
use pylon::exchange::PaperExchange;
use pylon::execution::{ExitExecutor, OrderRouter, RetryPolicy};
use pylon::persistence::SnapshotStore;
use pylon::portfolio::{BudgetLedger, MemoryPortfolio};
use pylon::runtime::worker::{SymbolWorker, WorkerDeps};
use pylon::SymbolState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub fn fast_config(symbols: Vec<String>) -> AppConfig {
    let mut config = AppConfig::dry_run_defaults(symbols);
    config.engine.cycle_interval_ms = 10;
    config.exit.passive_window_secs = 0;
    config.exit.poll_interval_ms = 1;
    config.router.base_delay_ms = 1;
    config.router.max_delay_ms = 2;
    config
}

pub fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pylon-it-{}-{}", tag, Uuid::new_v4()))
}

pub struct Harness {
    pub exchange: Arc<PaperExchange>,
    pub deps: Arc<WorkerDeps>,
    pub portfolio: Arc<MemoryPortfolio>,
    pub snapshot_dir: PathBuf,
}

impl Harness {
    pub async fn new(tag: &str, config: AppConfig) -> Self {
        Self::with(Arc::new(PaperExchange::new()), temp_dir(tag), config).await
    }

    /// Build against an existing exchange and snapshot directory —
    /// the restart half of crash-recovery tests.
    pub async fn with(
        exchange: Arc<PaperExchange>,
        snapshot_dir: PathBuf,
        config: AppConfig,
    ) -> Self {
        let snapshots = Arc::new(SnapshotStore::new(&snapshot_dir).await.unwrap());
        let router = Arc::new(OrderRouter::new(
            exchange.clone(),
            RetryPolicy::from(&config.router),
        ));
        let switcher = Arc::new(ProtectionSwitcher::new(
            router.clone(),
            config.protection.on_replace_failure,
        ));
        let engine = Arc::new(
            FsmEngine::new(
                &config.engine,
                ProtectionSwitcher::new(router.clone(), config.protection.on_replace_failure),
                snapshots.clone(),
            )
            .unwrap(),
        );
        let exits = Arc::new(ExitExecutor::new(
            router.clone(),
            exchange.clone(),
            config.exit.clone(),
        ));
        let budget = Arc::new(BudgetLedger::new(&config.budget));
        let portfolio = Arc::new(MemoryPortfolio::new());
        let timeouts = TimeoutManager::new(&config.engine);

        let deps = Arc::new(WorkerDeps {
            engine,
            router,
            market: exchange.clone(),
            exits,
            budget,
            portfolio: portfolio.clone(),
            snapshots,
            switcher,
            timeouts,
            config,
        });

        Self {
            exchange,
            deps,
            portfolio,
            snapshot_dir,
        }
    }

    pub fn worker(&self, state: SymbolState) -> SymbolWorker {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        // The sender side stays alive inside the worker for exit tasks
        SymbolWorker::new(state, self.deps.clone(), rx, tx, shutdown_rx)
    }

    pub async fn cleanup(&self) {
        let _ = tokio::fs::remove_dir_all(&self.snapshot_dir).await;
    }
}
