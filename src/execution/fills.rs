//! Partial-fill accounting
//!
//! Orders fill in pieces, across reconnects and across exit-ladder legs.
//! The accumulator keeps the running size-weighted average so the final
//! reported price is the aggregate over every trade, not the last one.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::domain::{Event, EventKind, Fill, OrderContext, OrderStatus};

/// Cumulative/target ratio at which an order counts as fully filled.
/// Slightly under one to absorb exchange rounding on the last trade.
pub const FILL_COMPLETE_RATIO: Decimal = dec!(0.999);

/// Outcome of folding one fill into an order context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillProgress {
    Partial,
    Complete,
}

/// Fold a fill into the order context: weighted average price, summed
/// fees, appended trade id. Duplicate trade ids are dropped (the
/// idempotency store upstream should already have absorbed them).
pub fn accumulate_fill(ctx: &mut OrderContext, fill: &Fill) -> FillProgress {
    if ctx.fill_trades.iter().any(|t| t == &fill.trade_id) {
        warn!(
            "duplicate trade {} on order {} ignored",
            fill.trade_id, ctx.client_order_id
        );
        return progress(ctx);
    }

    let prev_qty = ctx.cumulative_filled_qty;
    let prev_avg = ctx.avg_fill_price.unwrap_or(Decimal::ZERO);
    let new_qty = prev_qty + fill.qty;

    if !new_qty.is_zero() {
        ctx.avg_fill_price = Some((prev_qty * prev_avg + fill.qty * fill.price) / new_qty);
    }
    ctx.cumulative_filled_qty = new_qty;
    ctx.total_fees += fill.fee;
    ctx.fill_trades.push(fill.trade_id.clone());

    let result = progress(ctx);
    ctx.status = match result {
        FillProgress::Complete => OrderStatus::Filled,
        FillProgress::Partial => OrderStatus::PartiallyFilled,
    };
    result
}

/// Whether cumulative fills have reached the target quantity
pub fn is_fully_filled(ctx: &OrderContext) -> bool {
    if ctx.target_qty.is_zero() {
        return false;
    }
    ctx.cumulative_filled_qty / ctx.target_qty >= FILL_COMPLETE_RATIO
}

fn progress(ctx: &OrderContext) -> FillProgress {
    if is_fully_filled(ctx) {
        FillProgress::Complete
    } else {
        FillProgress::Partial
    }
}

/// Map accumulated progress to the event the state machine consumes.
/// Callers must not assume one fill per order; this is where a stream of
/// trades becomes ORDER_PARTIAL / ORDER_FILLED.
pub fn progress_event(ctx: &OrderContext, progress: FillProgress, symbol: &str) -> Event {
    let kind = match progress {
        FillProgress::Complete => EventKind::OrderFilled,
        FillProgress::Partial => EventKind::OrderPartial,
    };
    let mut event = Event::new(kind, symbol).with_fill(
        ctx.cumulative_filled_qty,
        ctx.avg_fill_price.unwrap_or(Decimal::ZERO),
        ctx.total_fees,
    );
    if let Some(order_id) = &ctx.order_id {
        event = event.with_order_id(order_id.clone());
    }
    if let Some(trade_id) = ctx.fill_trades.last() {
        event = event.with_trade_id(trade_id.clone());
    }
    event
}
