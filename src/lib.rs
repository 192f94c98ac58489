pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod persistence;
pub mod portfolio;
pub mod runtime;

pub use config::{AppConfig, LiquidityPolicy, ReplaceFailurePolicy};
pub use domain::{
    Event, EventKind, Fill, OrderContext, OrderRequest, OrderSide, OrderStatus, Phase,
    ProtectionKind, ProtectionState, SymbolState,
};
pub use engine::{
    FsmEngine, IdempotencyStore, PositionLockRegistry, ProtectionSwitcher, SwitchOutcome,
    TimeoutManager, TransitionTable,
};
pub use error::{PylonError, Result};
pub use exchange::{ExchangeClient, MarketData, PaperExchange, Ticker};
pub use execution::{ExitExecutor, ExitReason, ExitResult, OrderRouter, RetryPolicy};
pub use persistence::SnapshotStore;
pub use portfolio::{BudgetLedger, LogPortfolio, MemoryPortfolio, PortfolioSink};
pub use runtime::Runtime;
