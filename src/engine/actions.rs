//! Action functions
//!
//! Pure, synchronous mutators of one symbol's state, invoked by the
//! engine during a transition. Everything that touches the exchange or a
//! shared ledger happens outside, in the worker or the protection
//! switcher; an action only ever sees the state and the event.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{
    Event, Fill, OrderContext, OrderSide, OrderStatus, PositionInfo, SignalMeta, SymbolState,
    new_client_order_id,
};
use crate::execution::fills::{accumulate_fill, is_fully_filled};

/// Failure inside an action. The engine turns this into a forced ERROR
/// phase; it must never propagate as a panic.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("missing order context: {0}")]
    MissingContext(&'static str),

    #[error("event is missing field: {0}")]
    MissingField(&'static str),

    #[error("no open position")]
    NoPosition,

    #[error("{0}")]
    Invalid(String),
}

/// Every pure transition action in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    FinishWarmup,
    RecordSignal,
    ArmEntry,
    DiscardSignal,
    TrackBuyOrder,
    AbortEntry,
    AccumulateBuyFill,
    OpenPosition,
    AbandonBuy,
    /// Placeholder for switch-class entries; dispatched to the protection
    /// switcher, never to [`apply`]
    SwitchProtection,
    CloseAtProtection,
    RecordExitSignal,
    ArmExit,
    StayInPosition,
    TrackSellOrder,
    AbortExit,
    AccumulateSellFill,
    CompleteExit,
    StartCooldown,
    FinishCooldown,
    ResetFromError,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::FinishWarmup => "finish_warmup",
            Action::RecordSignal => "record_signal",
            Action::ArmEntry => "arm_entry",
            Action::DiscardSignal => "discard_signal",
            Action::TrackBuyOrder => "track_buy_order",
            Action::AbortEntry => "abort_entry",
            Action::AccumulateBuyFill => "accumulate_buy_fill",
            Action::OpenPosition => "open_position",
            Action::AbandonBuy => "abandon_buy",
            Action::SwitchProtection => "switch_protection",
            Action::CloseAtProtection => "close_at_protection",
            Action::RecordExitSignal => "record_exit_signal",
            Action::ArmExit => "arm_exit",
            Action::StayInPosition => "stay_in_position",
            Action::TrackSellOrder => "track_sell_order",
            Action::AbortExit => "abort_exit",
            Action::AccumulateSellFill => "accumulate_sell_fill",
            Action::CompleteExit => "complete_exit",
            Action::StartCooldown => "start_cooldown",
            Action::FinishCooldown => "finish_cooldown",
            Action::ResetFromError => "reset_from_error",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Apply a pure action. Returns an error instead of panicking; the
/// engine handles the forced-ERROR bookkeeping.
pub fn apply(action: Action, state: &mut SymbolState, event: &Event) -> Result<(), ActionError> {
    match action {
        Action::FinishWarmup => Ok(()),

        Action::RecordSignal => {
            state.signal = Some(SignalMeta {
                reason: event.reason.clone().unwrap_or_else(|| "signal".to_string()),
                received_at: event.timestamp,
                reference_price: event.price,
            });
            Ok(())
        }

        Action::ArmEntry => {
            let qty = event.filled_qty.ok_or(ActionError::MissingField("filled_qty"))?;
            let reservation = event
                .reservation_id
                .ok_or(ActionError::MissingField("reservation_id"))?;
            let mut ctx =
                OrderContext::new(new_client_order_id("buy"), OrderSide::Buy, qty);
            ctx.placed_at = event.timestamp;
            ctx.limit_price = event.price;
            state.buy_order = Some(ctx);
            state.reservation_id = Some(reservation);
            Ok(())
        }

        Action::DiscardSignal => {
            state.signal = None;
            state.reservation_id = None;
            Ok(())
        }

        Action::TrackBuyOrder => {
            let order_id = event
                .order_id
                .clone()
                .ok_or(ActionError::MissingField("order_id"))?;
            let ctx = state
                .buy_order
                .as_mut()
                .ok_or(ActionError::MissingContext("buy_order"))?;
            ctx.order_id = Some(order_id);
            ctx.status = OrderStatus::Submitted;
            ctx.placed_at = event.timestamp;
            if event.price.is_some() {
                ctx.limit_price = event.price;
            }
            Ok(())
        }

        Action::AbortEntry => {
            state.buy_order = None;
            state.reservation_id = None;
            state.signal = None;
            Ok(())
        }

        Action::AccumulateBuyFill => {
            let ctx = state
                .buy_order
                .as_mut()
                .ok_or(ActionError::MissingContext("buy_order"))?;
            apply_fill_event(ctx, event)
        }

        Action::OpenPosition => {
            let ctx = state
                .buy_order
                .as_mut()
                .ok_or(ActionError::MissingContext("buy_order"))?;
            apply_fill_event(ctx, event)?;
            state.position = Some(PositionInfo {
                qty: ctx.cumulative_filled_qty,
                avg_entry_price: ctx.avg_fill_price.unwrap_or(Decimal::ZERO),
                entry_fees: ctx.total_fees,
                opened_at: event.timestamp,
            });
            state.signal = None;
            state.reservation_id = None;
            Ok(())
        }

        Action::AbandonBuy => {
            state.buy_order = None;
            state.reservation_id = None;
            state.signal = None;
            Ok(())
        }

        Action::SwitchProtection => Err(ActionError::Invalid(
            "switch transitions are dispatched to the protection switcher".to_string(),
        )),

        Action::CloseAtProtection => {
            let position = state.position.as_ref().ok_or(ActionError::NoPosition)?;
            let qty = event.filled_qty.ok_or(ActionError::MissingField("filled_qty"))?;
            let avg = event.avg_price.ok_or(ActionError::MissingField("avg_price"))?;

            let mut ctx =
                OrderContext::new(new_client_order_id("protective"), OrderSide::Sell, position.qty);
            ctx.order_id = event.order_id.clone();
            ctx.cumulative_filled_qty = qty;
            ctx.avg_fill_price = Some(avg);
            ctx.total_fees = event.fee.unwrap_or(Decimal::ZERO);
            ctx.status = OrderStatus::Filled;
            state.sell_order = Some(ctx);
            state.exit_reason = Some("protective".to_string());
            state.protection = None;
            Ok(())
        }

        Action::RecordExitSignal => {
            state.exit_reason =
                Some(event.reason.clone().unwrap_or_else(|| "signal".to_string()));
            Ok(())
        }

        Action::ArmExit => {
            let position = state.position.as_ref().ok_or(ActionError::NoPosition)?;
            let ctx =
                OrderContext::new(new_client_order_id("sell"), OrderSide::Sell, position.qty);
            state.sell_order = Some(ctx);
            Ok(())
        }

        Action::StayInPosition => {
            state.exit_reason = None;
            state.sell_order = None;
            Ok(())
        }

        Action::TrackSellOrder => {
            let ctx = state
                .sell_order
                .as_mut()
                .ok_or(ActionError::MissingContext("sell_order"))?;
            if let Some(order_id) = &event.order_id {
                ctx.order_id = Some(order_id.clone());
            }
            ctx.status = OrderStatus::Submitted;
            ctx.placed_at = event.timestamp;
            Ok(())
        }

        Action::AbortExit => {
            // A partially filled exit still reduced the position
            if let (Some(ctx), Some(position)) = (&state.sell_order, state.position.as_mut()) {
                if ctx.has_fill() {
                    position.qty = (position.qty - ctx.cumulative_filled_qty).max(Decimal::ZERO);
                }
            }
            state.sell_order = None;
            state.exit_reason = None;
            // The worker cancelled the protective order before the sell
            // attempt; the marker clears so the next cycle re-protects.
            state.protection = None;
            Ok(())
        }

        Action::AccumulateSellFill => {
            let ctx = state
                .sell_order
                .as_mut()
                .ok_or(ActionError::MissingContext("sell_order"))?;
            apply_fill_event(ctx, event)
        }

        Action::CompleteExit => {
            let ctx = state
                .sell_order
                .as_mut()
                .ok_or(ActionError::MissingContext("sell_order"))?;
            apply_fill_event(ctx, event)?;
            state.protection = None;
            Ok(())
        }

        Action::StartCooldown => {
            state.clear_cycle();
            state.cooldown_started_at = Some(event.timestamp);
            Ok(())
        }

        Action::FinishCooldown => {
            state.cooldown_started_at = None;
            Ok(())
        }

        Action::ResetFromError => {
            state.clear_cycle();
            state.cooldown_started_at = None;
            state.last_error = None;
            Ok(())
        }
    }
}

/// Fold a fill event into an order context. A trade id means a raw
/// per-trade fill to accumulate; no trade id means the event carries the
/// authoritative aggregate (exit ladder result, reconciled snapshot) and
/// overwrites the context totals.
fn apply_fill_event(ctx: &mut OrderContext, event: &Event) -> Result<(), ActionError> {
    let qty = event.filled_qty.ok_or(ActionError::MissingField("filled_qty"))?;
    let price = event.avg_price.ok_or(ActionError::MissingField("avg_price"))?;
    let fee = event.fee.unwrap_or(Decimal::ZERO);

    match &event.trade_id {
        Some(trade_id) => {
            let fill = Fill {
                order_id: event.order_id.clone().unwrap_or_default(),
                trade_id: trade_id.clone(),
                qty,
                price,
                fee,
                timestamp: event.timestamp,
            };
            accumulate_fill(ctx, &fill);
        }
        None => {
            ctx.cumulative_filled_qty = qty;
            ctx.avg_fill_price = Some(price);
            ctx.total_fees = fee;
            if let Some(order_id) = &event.order_id {
                ctx.order_id = Some(order_id.clone());
            }
            ctx.status = if is_fully_filled(ctx) {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        }
    }
    Ok(())
}
