use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good Till Cancelled
    GTC,
    /// Fill Or Kill
    FOK,
    /// Immediate Or Cancel
    IOC,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Order created but not yet submitted
    Pending,
    /// Order submitted to exchange
    Submitted,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by exchange
    Rejected,
    /// Order expired
    Expired,
    /// Order failed (internal error)
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Order request (what we want to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    /// Limit price; None for market orders
    pub limit_price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn buy_limit(symbol: impl Into<String>, qty: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: new_client_order_id("buy"),
            symbol: symbol.into(),
            side: OrderSide::Buy,
            qty,
            limit_price: Some(price),
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GTC,
        }
    }

    pub fn sell_limit(symbol: impl Into<String>, qty: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: new_client_order_id("sell"),
            symbol: symbol.into(),
            side: OrderSide::Sell,
            qty,
            limit_price: Some(price),
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::GTC,
        }
    }

    pub fn sell_ioc(symbol: impl Into<String>, qty: Decimal, price: Decimal) -> Self {
        Self {
            client_order_id: new_client_order_id("sell-ioc"),
            symbol: symbol.into(),
            side: OrderSide::Sell,
            qty,
            limit_price: Some(price),
            order_type: OrderType::Limit,
            time_in_force: TimeInForce::IOC,
        }
    }

    pub fn sell_market(symbol: impl Into<String>, qty: Decimal) -> Self {
        Self {
            client_order_id: new_client_order_id("sell-mkt"),
            symbol: symbol.into(),
            side: OrderSide::Sell,
            qty,
            limit_price: None,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::IOC,
        }
    }

    /// Rebuild the request under a specific client order id (used when the
    /// id was minted earlier and persisted in the symbol state).
    pub fn with_client_order_id(mut self, coid: impl Into<String>) -> Self {
        self.client_order_id = coid.into();
        self
    }

    /// Notional value of the request at its limit price (zero for market).
    pub fn value(&self) -> Decimal {
        self.limit_price.map(|p| p * self.qty).unwrap_or(Decimal::ZERO)
    }
}

/// Mint a fresh client order id. The COID is the idempotency key for
/// submission; it must be generated once per logical order and reused
/// across retries.
pub fn new_client_order_id(tag: &str) -> String {
    format!("pylon-{}-{}", tag, Uuid::new_v4())
}

/// Acknowledgement returned by the exchange on submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub accepted_at: DateTime<Utc>,
}

/// Authoritative order state fetched from the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub total_fees: Decimal,
}

/// Fill event from the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub trade_id: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Tracked lifecycle of a single order. Created on placement, updated on
/// every partial fill, archived on terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderContext {
    /// Exchange order id; None until the submission is acknowledged
    pub order_id: Option<String>,
    pub client_order_id: String,
    pub side: OrderSide,
    pub placed_at: DateTime<Utc>,
    pub target_qty: Decimal,
    /// Limit price of the working order, when known
    pub limit_price: Option<Decimal>,
    pub cumulative_filled_qty: Decimal,
    /// Size-weighted average price across all fills
    pub avg_fill_price: Option<Decimal>,
    pub total_fees: Decimal,
    pub status: OrderStatus,
    pub retry_count: u32,
    /// Trade ids already accounted for
    pub fill_trades: Vec<String>,
}

impl OrderContext {
    pub fn new(client_order_id: impl Into<String>, side: OrderSide, target_qty: Decimal) -> Self {
        Self {
            order_id: None,
            client_order_id: client_order_id.into(),
            side,
            placed_at: Utc::now(),
            target_qty,
            limit_price: None,
            cumulative_filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            total_fees: Decimal::ZERO,
            status: OrderStatus::Pending,
            retry_count: 0,
            fill_trades: Vec::new(),
        }
    }

    /// Remaining quantity still working on the exchange
    pub fn remaining_qty(&self) -> Decimal {
        (self.target_qty - self.cumulative_filled_qty).max(Decimal::ZERO)
    }

    /// Cost of everything filled so far (excluding fees)
    pub fn fill_value(&self) -> Decimal {
        match self.avg_fill_price {
            Some(price) => price * self.cumulative_filled_qty,
            None => Decimal::ZERO,
        }
    }

    pub fn has_fill(&self) -> bool {
        self.cumulative_filled_qty > Decimal::ZERO
    }
}
