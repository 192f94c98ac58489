use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::order::OrderContext;

/// Lifecycle phases of one symbol's trading state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Collecting market data; not yet eligible for entries
    Warmup,
    /// Flat, waiting for an entry signal
    Idle,
    /// Entry signal received, guards under evaluation
    EntryEval,
    /// Entry approved, buy order being submitted
    PlaceBuy,
    /// Buy order working on the exchange
    WaitFill,
    /// Position open, protective order resting
    Position,
    /// Exit signal received, guards under evaluation
    ExitEval,
    /// Exit approved, sell escalation being executed
    PlaceSell,
    /// Sell legs working on the exchange
    WaitSellFill,
    /// Position closed, settlement and notifications pending
    PostTrade,
    /// Trade settled, holding off re-entry
    Cooldown,
    /// Action failure; requires manual recovery
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Warmup => "WARMUP",
            Phase::Idle => "IDLE",
            Phase::EntryEval => "ENTRY_EVAL",
            Phase::PlaceBuy => "PLACE_BUY",
            Phase::WaitFill => "WAIT_FILL",
            Phase::Position => "POSITION",
            Phase::ExitEval => "EXIT_EVAL",
            Phase::PlaceSell => "PLACE_SELL",
            Phase::WaitSellFill => "WAIT_SELL_FILL",
            Phase::PostTrade => "POST_TRADE",
            Phase::Cooldown => "COOLDOWN",
            Phase::Error => "ERROR",
        }
    }

    /// All phases, for exhaustive table checks
    pub fn all() -> [Phase; 12] {
        [
            Phase::Warmup,
            Phase::Idle,
            Phase::EntryEval,
            Phase::PlaceBuy,
            Phase::WaitFill,
            Phase::Position,
            Phase::ExitEval,
            Phase::PlaceSell,
            Phase::WaitSellFill,
            Phase::PostTrade,
            Phase::Cooldown,
            Phase::Error,
        ]
    }

    /// Does this phase hold an open position?
    pub fn holds_position(&self) -> bool {
        matches!(
            self,
            Phase::Position | Phase::ExitEval | Phase::PlaceSell | Phase::WaitSellFill
        )
    }

    /// Is there an order working on the exchange in this phase?
    pub fn has_working_order(&self) -> bool {
        matches!(self, Phase::WaitFill | Phase::WaitSellFill)
    }

    /// ERROR is terminal except for the manual-recovery event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Phase {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s.to_uppercase().as_str() {
            "WARMUP" => Ok(Phase::Warmup),
            "IDLE" => Ok(Phase::Idle),
            "ENTRY_EVAL" => Ok(Phase::EntryEval),
            "PLACE_BUY" => Ok(Phase::PlaceBuy),
            "WAIT_FILL" => Ok(Phase::WaitFill),
            "POSITION" => Ok(Phase::Position),
            "EXIT_EVAL" => Ok(Phase::ExitEval),
            "PLACE_SELL" => Ok(Phase::PlaceSell),
            "WAIT_SELL_FILL" => Ok(Phase::WaitSellFill),
            "POST_TRADE" => Ok(Phase::PostTrade),
            "COOLDOWN" => Ok(Phase::Cooldown),
            "ERROR" => Ok(Phase::Error),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// Which protective order guards the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionKind {
    TakeProfit,
    StopLoss,
}

impl ProtectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionKind::TakeProfit => "TP",
            ProtectionKind::StopLoss => "SL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            ProtectionKind::TakeProfit => ProtectionKind::StopLoss,
            ProtectionKind::StopLoss => ProtectionKind::TakeProfit,
        }
    }
}

impl fmt::Display for ProtectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Protection value for an open position. Exactly one of take-profit or
/// stop-loss is active; the Switching marker is visible to every reader
/// while a handover is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtectionState {
    Active {
        kind: ProtectionKind,
        order_id: String,
        trigger_price: Decimal,
    },
    Switching {
        from: ProtectionKind,
        to: ProtectionKind,
    },
}

impl ProtectionState {
    pub fn is_switching(&self) -> bool {
        matches!(self, ProtectionState::Switching { .. })
    }

    pub fn active_kind(&self) -> Option<ProtectionKind> {
        match self {
            ProtectionState::Active { kind, .. } => Some(*kind),
            ProtectionState::Switching { .. } => None,
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            ProtectionState::Active { order_id, .. } => Some(order_id),
            ProtectionState::Switching { .. } => None,
        }
    }
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionState::Active { kind, .. } => write!(f, "{}", kind),
            ProtectionState::Switching { to, .. } => write!(f, "SWITCHING_TO_{}", to),
        }
    }
}

/// Open position bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub entry_fees: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl PositionInfo {
    /// Capital deployed in this position (excluding fees)
    pub fn cost_basis(&self) -> Decimal {
        self.qty * self.avg_entry_price
    }
}

/// Metadata of the signal that started the current cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMeta {
    pub reason: String,
    pub received_at: DateTime<Utc>,
    pub reference_price: Option<Decimal>,
}

/// Per-symbol FSM state. One instance per symbol, exclusively owned by
/// that symbol's worker; the switch lock guards protection handovers.
/// Serialized wholesale into snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolState {
    symbol: String,
    phase: Phase,
    pub buy_order: Option<OrderContext>,
    pub sell_order: Option<OrderContext>,
    pub position: Option<PositionInfo>,
    pub protection: Option<ProtectionState>,
    pub signal: Option<SignalMeta>,
    pub reservation_id: Option<Uuid>,
    pub cooldown_started_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
    /// Monotonic transition counter, assigned by the engine on commit
    pub transition_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl SymbolState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            phase: Phase::Warmup,
            buy_order: None,
            sell_order: None,
            position: None,
            protection: None,
            signal: None,
            reservation_id: None,
            cooldown_started_at: None,
            exit_reason: None,
            error_count: 0,
            last_error: None,
            transition_seq: 0,
            updated_at: Utc::now(),
        }
    }

    /// State pinned to a specific phase, for restore tooling and tests;
    /// live phase changes go through the engine commit path.
    pub fn with_phase(symbol: impl Into<String>, phase: Phase) -> Self {
        let mut state = Self::new(symbol);
        state.phase = phase;
        state
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phase changes go through the engine commit path only.
    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }

    pub fn has_open_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn protection(&self) -> Option<&ProtectionState> {
        self.protection.as_ref()
    }

    /// Clear everything belonging to the finished cycle; position,
    /// protection and order contexts are gone, the symbol is flat.
    pub fn clear_cycle(&mut self) {
        self.buy_order = None;
        self.sell_order = None;
        self.position = None;
        self.protection = None;
        self.signal = None;
        self.reservation_id = None;
        self.exit_reason = None;
        self.updated_at = Utc::now();
    }
}
