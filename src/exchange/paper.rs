//! In-memory paper exchange
//!
//! Implements the exchange and market-data traits against an in-memory
//! book, with scriptable fill behavior for dry-run mode and tests.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::domain::{
    Fill, OrderAck, OrderRequest, OrderSide, OrderSnapshot, OrderStatus, OrderType,
};
use crate::error::{OrderError, PylonError, Result};

use super::traits::{ExchangeClient, MarketData, Ticker};

/// How submitted orders fill
#[derive(Debug, Clone)]
pub enum FillMode {
    /// Every order fills completely on submission
    Immediate,
    /// Orders rest unfilled until filled manually or cancelled
    Never,
    /// Each submission consumes the next ratio from the schedule and fills
    /// that fraction; an empty schedule falls back to full fills
    Scripted(VecDeque<Decimal>),
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    client_order_id: String,
    symbol: String,
    side: OrderSide,
    qty: Decimal,
    limit_price: Option<Decimal>,
    status: OrderStatus,
    filled_qty: Decimal,
    avg_fill_price: Option<Decimal>,
    total_fees: Decimal,
}

impl PaperOrder {
    fn snapshot(&self) -> OrderSnapshot {
        OrderSnapshot {
            order_id: self.order_id.clone(),
            client_order_id: self.client_order_id.clone(),
            status: self.status,
            filled_qty: self.filled_qty,
            avg_fill_price: self.avg_fill_price,
            total_fees: self.total_fees,
        }
    }
}

struct Inner {
    tickers: HashMap<String, Ticker>,
    orders: HashMap<String, PaperOrder>,
    by_coid: HashMap<String, String>,
    fill_mode: FillMode,
    reject_submits: bool,
    reject_next_submits: u32,
    fail_cancels: bool,
    fee_rate: Decimal,
    submit_count: u64,
    cancel_count: u64,
    next_seq: u64,
}

/// Scriptable in-memory exchange for dry-run and tests
pub struct PaperExchange {
    inner: Mutex<Inner>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tickers: HashMap::new(),
                orders: HashMap::new(),
                by_coid: HashMap::new(),
                fill_mode: FillMode::Immediate,
                reject_submits: false,
                reject_next_submits: 0,
                fail_cancels: false,
                fee_rate: dec!(0.001),
                submit_count: 0,
                cancel_count: 0,
                next_seq: 1,
            }),
        }
    }

    pub fn set_ticker(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        inner.tickers.insert(
            symbol.to_string(),
            Ticker {
                bid,
                ask,
                last: (bid + ask) / dec!(2),
                timestamp: Utc::now(),
            },
        );
    }

    /// Install a ticker with an explicit timestamp (staleness tests)
    pub fn set_ticker_raw(&self, symbol: &str, ticker: Ticker) {
        let mut inner = self.inner.lock().unwrap();
        inner.tickers.insert(symbol.to_string(), ticker);
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.inner.lock().unwrap().fill_mode = mode;
    }

    pub fn reject_submits(&self, reject: bool) {
        self.inner.lock().unwrap().reject_submits = reject;
    }

    /// Reject the next `n` submissions, then behave normally again
    pub fn reject_next_submits(&self, n: u32) {
        self.inner.lock().unwrap().reject_next_submits = n;
    }

    pub fn fail_cancels(&self, fail: bool) {
        self.inner.lock().unwrap().fail_cancels = fail;
    }

    pub fn submit_count(&self) -> u64 {
        self.inner.lock().unwrap().submit_count
    }

    pub fn cancel_count(&self) -> u64 {
        self.inner.lock().unwrap().cancel_count
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .map(|o| o.order_id.clone())
            .collect()
    }

    /// Apply a manual fill to a resting order and return the trade, so
    /// tests can feed it back through the engine as an exchange callback.
    pub fn fill_order(&self, order_id: &str, qty: Decimal, price: Decimal) -> Result<Fill> {
        let mut inner = self.inner.lock().unwrap();
        let fee_rate = inner.fee_rate;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let order = inner.orders.get_mut(order_id).ok_or_else(|| {
            PylonError::from(OrderError::NotFound {
                order_id: order_id.to_string(),
            })
        })?;
        if order.status.is_terminal() {
            return Err(OrderError::AlreadyFilled.into());
        }

        let fee = qty * price * fee_rate;
        apply_fill(order, qty, price, fee);

        Ok(Fill {
            order_id: order_id.to_string(),
            trade_id: format!("paper-trade-{}", seq),
            qty,
            price,
            fee,
            timestamp: Utc::now(),
        })
    }

    fn execution_price(inner: &Inner, request: &OrderRequest) -> Option<Decimal> {
        match request.order_type {
            OrderType::Limit => request.limit_price,
            OrderType::Market => inner.tickers.get(&request.symbol).map(|t| match request.side {
                OrderSide::Buy => t.ask,
                OrderSide::Sell => t.bid,
            }),
        }
    }
}

fn apply_fill(order: &mut PaperOrder, qty: Decimal, price: Decimal, fee: Decimal) {
    let prev_qty = order.filled_qty;
    let prev_avg = order.avg_fill_price.unwrap_or(Decimal::ZERO);
    let new_qty = prev_qty + qty;
    if !new_qty.is_zero() {
        order.avg_fill_price = Some((prev_qty * prev_avg + qty * price) / new_qty);
    }
    order.filled_qty = new_qty;
    order.total_fees += fee;
    order.status = if order.filled_qty >= order.qty {
        OrderStatus::Filled
    } else {
        OrderStatus::PartiallyFilled
    };
}

#[async_trait]
impl MarketData for PaperExchange {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let inner = self.inner.lock().unwrap();
        inner
            .tickers
            .get(symbol)
            .copied()
            .ok_or_else(|| PylonError::MarketDataUnavailable(symbol.to_string()))
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let mut inner = self.inner.lock().unwrap();
        inner.submit_count += 1;

        if inner.reject_submits {
            return Err(PylonError::OrderRejected("paper: submissions rejected".into()));
        }
        if inner.reject_next_submits > 0 {
            inner.reject_next_submits -= 1;
            return Err(PylonError::OrderRejected("paper: scripted rejection".into()));
        }
        if inner.by_coid.contains_key(&request.client_order_id) {
            return Err(PylonError::DuplicateOrder(request.client_order_id.clone()));
        }

        let price = Self::execution_price(&inner, request);
        if request.order_type == OrderType::Market && price.is_none() {
            return Err(PylonError::MarketDataUnavailable(request.symbol.clone()));
        }

        let order_id = format!("paper-{}", inner.next_seq);
        inner.next_seq += 1;

        let mut order = PaperOrder {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.qty,
            limit_price: request.limit_price,
            status: OrderStatus::Submitted,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            total_fees: Decimal::ZERO,
        };

        let fill_ratio = match &mut inner.fill_mode {
            FillMode::Immediate => Some(Decimal::ONE),
            FillMode::Never => None,
            FillMode::Scripted(schedule) => Some(schedule.pop_front().unwrap_or(Decimal::ONE)),
        };
        // Market orders always take what the book has
        let fill_ratio = if request.order_type == OrderType::Market {
            Some(Decimal::ONE)
        } else {
            fill_ratio
        };

        if let (Some(ratio), Some(px)) = (fill_ratio, price) {
            let qty = (request.qty * ratio).min(request.qty);
            if qty > Decimal::ZERO {
                let fee = qty * px * inner.fee_rate;
                apply_fill(&mut order, qty, px, fee);
            }
        }

        // An unfilled IOC does not rest on the book
        if request.time_in_force == crate::domain::TimeInForce::IOC
            && order.status == OrderStatus::Submitted
        {
            order.status = OrderStatus::Cancelled;
        }

        debug!(
            "paper submit {} {} {} x {:?} -> {} ({})",
            request.symbol, request.side, request.qty, request.limit_price, order_id, order.status
        );

        let ack = OrderAck {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            status: order.status,
            accepted_at: Utc::now(),
        };
        inner
            .by_coid
            .insert(request.client_order_id.clone(), order_id.clone());
        inner.orders.insert(order_id, order);

        Ok(ack)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.cancel_count += 1;

        if inner.fail_cancels {
            return Err(PylonError::ExchangeUnavailable("paper: cancel failed".into()));
        }

        match inner.orders.get_mut(order_id) {
            Some(order) if order.status.is_active() => {
                order.status = OrderStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .orders
            .get(order_id)
            .map(|o| o.snapshot())
            .ok_or_else(|| {
                PylonError::from(OrderError::NotFound {
                    order_id: order_id.to_string(),
                })
            })
    }

    async fn lookup_client_order(&self, client_order_id: &str) -> Result<Option<OrderSnapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_coid
            .get(client_order_id)
            .and_then(|id| inner.orders.get(id))
            .map(|o| o.snapshot()))
    }
}
