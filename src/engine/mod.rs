//! Order & position lifecycle state machine
//!
//! The transition table, pure actions, idempotency store, per-symbol
//! switch locks, timeout detection and the engine that ties them
//! together.

pub mod actions;
pub mod core;
pub mod idempotency;
pub mod locks;
pub mod switching;
pub mod table;
pub mod timeout;

pub use actions::{Action, ActionError};
pub use core::{EngineStatsSnapshot, FsmEngine};
pub use idempotency::IdempotencyStore;
pub use locks::PositionLockRegistry;
pub use switching::{ProtectionSwitcher, SwitchOutcome};
pub use table::{Transition, TransitionClass, TransitionTable};
pub use timeout::TimeoutManager;
