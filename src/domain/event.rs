use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Everything that can drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    WarmupComplete,
    EntrySignal,
    EntryApproved,
    EntryRejected,
    BuyPlaced,
    BuyRejected,
    /// One or more trades landed; order not yet complete
    OrderPartial,
    /// Cumulative fills reached the target quantity
    OrderFilled,
    BuyOrderTimeout,
    /// The resting protective order executed, closing the position
    ProtectionFilled,
    SwitchToTakeProfit,
    SwitchToStopLoss,
    ExitSignal,
    ExitApproved,
    ExitRejected,
    SellPlaced,
    SellRejected,
    SellOrderTimeout,
    TradeSettled,
    CooldownExpired,
    ManualReset,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WarmupComplete => "WARMUP_COMPLETE",
            EventKind::EntrySignal => "ENTRY_SIGNAL",
            EventKind::EntryApproved => "ENTRY_APPROVED",
            EventKind::EntryRejected => "ENTRY_REJECTED",
            EventKind::BuyPlaced => "BUY_PLACED",
            EventKind::BuyRejected => "BUY_REJECTED",
            EventKind::OrderPartial => "ORDER_PARTIAL",
            EventKind::OrderFilled => "ORDER_FILLED",
            EventKind::BuyOrderTimeout => "BUY_ORDER_TIMEOUT",
            EventKind::ProtectionFilled => "PROTECTION_FILLED",
            EventKind::SwitchToTakeProfit => "SWITCH_TO_TAKE_PROFIT",
            EventKind::SwitchToStopLoss => "SWITCH_TO_STOP_LOSS",
            EventKind::ExitSignal => "EXIT_SIGNAL",
            EventKind::ExitApproved => "EXIT_APPROVED",
            EventKind::ExitRejected => "EXIT_REJECTED",
            EventKind::SellPlaced => "SELL_PLACED",
            EventKind::SellRejected => "SELL_REJECTED",
            EventKind::SellOrderTimeout => "SELL_ORDER_TIMEOUT",
            EventKind::TradeSettled => "TRADE_SETTLED",
            EventKind::CooldownExpired => "COOLDOWN_EXPIRED",
            EventKind::ManualReset => "MANUAL_RESET",
        }
    }

    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::WarmupComplete,
            EventKind::EntrySignal,
            EventKind::EntryApproved,
            EventKind::EntryRejected,
            EventKind::BuyPlaced,
            EventKind::BuyRejected,
            EventKind::OrderPartial,
            EventKind::OrderFilled,
            EventKind::BuyOrderTimeout,
            EventKind::ProtectionFilled,
            EventKind::SwitchToTakeProfit,
            EventKind::SwitchToStopLoss,
            EventKind::ExitSignal,
            EventKind::ExitApproved,
            EventKind::ExitRejected,
            EventKind::SellPlaced,
            EventKind::SellRejected,
            EventKind::SellOrderTimeout,
            EventKind::TradeSettled,
            EventKind::CooldownExpired,
            EventKind::ManualReset,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable event fed to the state machine. Construct with [`Event::new`]
/// and the `with_*` builders; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub order_id: Option<String>,
    pub trade_id: Option<String>,
    pub filled_qty: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub fee: Option<Decimal>,
    /// Trigger/limit price carried by switch and approval events
    pub price: Option<Decimal>,
    pub reservation_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl Event {
    pub fn new(kind: EventKind, symbol: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            timestamp: Utc::now(),
            order_id: None,
            trade_id: None,
            filled_qty: None,
            avg_price: None,
            fee: None,
            price: None,
            reservation_id: None,
            reason: None,
        }
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_trade_id(mut self, trade_id: impl Into<String>) -> Self {
        self.trade_id = Some(trade_id.into());
        self
    }

    pub fn with_fill(mut self, qty: Decimal, avg_price: Decimal, fee: Decimal) -> Self {
        self.filled_qty = Some(qty);
        self.avg_price = Some(avg_price);
        self.fee = Some(fee);
        self
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_reservation(mut self, id: Uuid) -> Self {
        self.reservation_id = Some(id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Dedup fingerprint: same symbol, kind and order id within the same
    /// one-second bucket is the same logical event. The bucket absorbs
    /// redelivery jitter while keeping distinct fills distinct (their
    /// trade ids differ).
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            symbol: self.symbol.clone(),
            kind: self.kind,
            order_id: self.order_id.clone().unwrap_or_default(),
            trade_id: self.trade_id.clone().unwrap_or_default(),
            ts_bucket: self.timestamp.timestamp(),
        }
    }
}

/// Idempotency fingerprint of one logical event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub symbol: String,
    pub kind: EventKind,
    pub order_id: String,
    pub trade_id: String,
    pub ts_bucket: i64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.symbol, self.kind, self.order_id, self.ts_bucket
        )
    }
}
