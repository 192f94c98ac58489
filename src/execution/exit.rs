//! Exit escalation
//!
//! Closing a position walks an escalation ladder: a passive limit at the
//! bid, then immediate-or-cancel legs at increasing price concessions,
//! then (optionally) a market order. Every leg's fills accumulate into
//! one aggregate, so the reported price is the size-weighted average
//! across whichever legs filled. A pending-exit registry makes the whole
//! operation single-flight per symbol.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::{ExitConfig, LiquidityPolicy};
use crate::domain::{Fill, OrderContext, OrderRequest, OrderSide, new_client_order_id};
use crate::exchange::MarketData;
use crate::execution::fills::{accumulate_fill, is_fully_filled};
use crate::execution::router::OrderRouter;

/// Why the exit is happening; carried into logs and the portfolio close
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Signal,
    Protective,
    Manual,
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Signal => write!(f, "signal"),
            ExitReason::Protective => write!(f, "protective"),
            ExitReason::Manual => write!(f, "manual"),
            ExitReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Aggregate outcome of one exit attempt
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub success: bool,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub total_fees: Decimal,
    /// Failure/skip reason when not successful
    pub reason: Option<String>,
    /// Number of ladder legs that produced fills
    pub legs_filled: u32,
}

impl ExitResult {
    fn skipped(reason: &str) -> Self {
        Self {
            success: false,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            total_fees: Decimal::ZERO,
            reason: Some(reason.to_string()),
            legs_filled: 0,
        }
    }

    fn from_aggregate(agg: &OrderContext, legs_filled: u32, reason: Option<String>) -> Self {
        Self {
            success: is_fully_filled(agg),
            filled_qty: agg.cumulative_filled_qty,
            avg_price: agg.avg_fill_price,
            total_fees: agg.total_fees,
            reason,
            legs_filled,
        }
    }
}

/// Single-flight registry of symbols with an exit in progress. Entries
/// carry a TTL so a crash mid-exit still frees the slot.
pub struct PendingExitRegistry {
    inner: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: ChronoDuration,
}

impl PendingExitRegistry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl: ChronoDuration::seconds(ttl_secs as i64),
        }
    }

    /// Register the symbol; false means an exit is already in flight.
    pub fn try_register(&self, symbol: &str) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, at| now - *at < self.ttl);
        if inner.contains_key(symbol) {
            return false;
        }
        inner.insert(symbol.to_string(), now);
        true
    }

    pub fn clear(&self, symbol: &str) {
        self.inner.lock().unwrap().remove(symbol);
    }

    pub fn is_pending(&self, symbol: &str) -> bool {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();
        inner
            .get(symbol)
            .map(|at| now - *at < self.ttl)
            .unwrap_or(false)
    }
}

pub struct ExitExecutor {
    router: Arc<OrderRouter>,
    market: Arc<dyn MarketData>,
    registry: PendingExitRegistry,
    config: ExitConfig,
}

impl ExitExecutor {
    pub fn new(router: Arc<OrderRouter>, market: Arc<dyn MarketData>, config: ExitConfig) -> Self {
        let registry = PendingExitRegistry::new(config.pending_exit_ttl_secs);
        Self {
            router,
            market,
            registry,
            config,
        }
    }

    /// Close `qty` of `symbol` through the escalation ladder.
    ///
    /// Liquidity failures and duplicate attempts come back as typed
    /// results, not errors; the caller decides what the phase machine
    /// does with them.
    pub async fn execute_exit(&self, symbol: &str, qty: Decimal, reason: ExitReason) -> ExitResult {
        if !self.registry.try_register(symbol) {
            info!("{}: exit already in progress, skipping", symbol);
            return ExitResult::skipped("exit_already_in_progress");
        }

        let result = self.run_ladder(symbol, qty, reason).await;

        // The slot is freed no matter how the ladder ended
        self.registry.clear(symbol);
        result
    }

    async fn run_ladder(&self, symbol: &str, qty: Decimal, reason: ExitReason) -> ExitResult {
        let now = Utc::now();
        let ticker = match self.market.get_ticker(symbol).await {
            Ok(t) => t,
            Err(e) => {
                warn!("{}: exit blocked, no market data: {}", symbol, e);
                return ExitResult::skipped("market_data_unavailable");
            }
        };
        if ticker.is_stale(self.config.max_ticker_age_secs, now) {
            warn!("{}: exit blocked, stale ticker", symbol);
            return ExitResult::skipped("stale_ticker");
        }

        let spread = ticker.spread_pct();
        let mut force_market = false;
        if spread > self.config.max_spread_pct {
            match self.config.spread_policy {
                LiquidityPolicy::Skip => {
                    warn!(
                        "{}: exit skipped, spread {} above threshold {}",
                        symbol, spread, self.config.max_spread_pct
                    );
                    return ExitResult::skipped("low_liquidity");
                }
                LiquidityPolicy::Requeue => {
                    return ExitResult::skipped("requeue");
                }
                LiquidityPolicy::ForceMarket => {
                    warn!(
                        "{}: spread {} above threshold, forcing market exit",
                        symbol, spread
                    );
                    force_market = true;
                }
            }
        }

        info!(
            "{}: exit start qty={} reason={} bid={} ask={}",
            symbol, qty, reason, ticker.bid, ticker.ask
        );

        let mut agg = OrderContext::new(new_client_order_id("exit"), OrderSide::Sell, qty);
        let mut legs_filled = 0u32;
        let mut bid = ticker.bid;

        if !force_market {
            // (a) passive limit at the bid
            if let Some(leg) = self.passive_leg(symbol, agg.remaining_qty(), bid).await {
                legs_filled += self.fold_leg(&mut agg, leg);
            }
            if is_fully_filled(&agg) {
                return self.finish(symbol, &agg, legs_filled, None);
            }

            // (b) aggressive IOC legs at escalating concessions
            for premium in &self.config.ioc_premiums {
                if let Ok(fresh) = self.market.get_ticker(symbol).await {
                    if !fresh.is_stale(self.config.max_ticker_age_secs, Utc::now()) {
                        bid = fresh.bid;
                    }
                }
                let price = bid * (Decimal::ONE - premium);
                if let Some(leg) = self.ioc_leg(symbol, agg.remaining_qty(), price).await {
                    legs_filled += self.fold_leg(&mut agg, leg);
                }
                if is_fully_filled(&agg) {
                    return self.finish(symbol, &agg, legs_filled, None);
                }
            }
        }

        // (c) market fallback
        if self.config.market_fallback || force_market {
            if let Some(leg) = self.market_leg(symbol, agg.remaining_qty()).await {
                legs_filled += self.fold_leg(&mut agg, leg);
            }
            if is_fully_filled(&agg) {
                return self.finish(symbol, &agg, legs_filled, None);
            }
        }

        self.finish(symbol, &agg, legs_filled, Some("ladder_exhausted".to_string()))
    }

    /// Submit the passive limit leg and let it rest for the configured
    /// window, then cancel the remainder and take the final state.
    async fn passive_leg(&self, symbol: &str, qty: Decimal, price: Decimal) -> Option<LegFill> {
        let request = OrderRequest::sell_limit(symbol, qty, price);
        let ack = match self.router.submit(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("{}: passive exit leg rejected: {}", symbol, e);
                return None;
            }
        };

        let deadline = Utc::now() + ChronoDuration::seconds(self.config.passive_window_secs as i64);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.router.fetch(&ack.order_id).await {
                Ok(snap) if snap.status.is_terminal() => break,
                Ok(snap) if snap.filled_qty >= qty => break,
                Ok(_) if Utc::now() >= deadline => break,
                Ok(_) => sleep(poll).await,
                Err(e) => {
                    warn!("{}: passive leg poll failed: {}", symbol, e);
                    break;
                }
            }
        }

        let _ = self.router.cancel(&ack.order_id).await;
        self.leg_final(symbol, &ack.order_id).await
    }

    async fn ioc_leg(&self, symbol: &str, qty: Decimal, price: Decimal) -> Option<LegFill> {
        let request = OrderRequest::sell_ioc(symbol, qty, price);
        let ack = match self.router.submit(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("{}: IOC exit leg rejected: {}", symbol, e);
                return None;
            }
        };
        self.leg_final(symbol, &ack.order_id).await
    }

    async fn market_leg(&self, symbol: &str, qty: Decimal) -> Option<LegFill> {
        let request = OrderRequest::sell_market(symbol, qty);
        let ack = match self.router.submit(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!("{}: market exit leg rejected: {}", symbol, e);
                return None;
            }
        };
        self.leg_final(symbol, &ack.order_id).await
    }

    async fn leg_final(&self, symbol: &str, order_id: &str) -> Option<LegFill> {
        match self.router.fetch(order_id).await {
            Ok(snap) if snap.filled_qty > Decimal::ZERO => Some(LegFill {
                order_id: snap.order_id,
                qty: snap.filled_qty,
                avg_price: snap.avg_fill_price.unwrap_or(Decimal::ZERO),
                fees: snap.total_fees,
            }),
            Ok(_) => None,
            Err(e) => {
                warn!("{}: could not fetch exit leg {}: {}", symbol, order_id, e);
                None
            }
        }
    }

    /// Fold one leg's final fill into the aggregate. Returns 1 when the
    /// leg contributed quantity.
    fn fold_leg(&self, agg: &mut OrderContext, leg: LegFill) -> u32 {
        let fill = Fill {
            order_id: leg.order_id.clone(),
            // The leg's order id doubles as the aggregate's trade id
            trade_id: leg.order_id,
            qty: leg.qty,
            price: leg.avg_price,
            fee: leg.fees,
            timestamp: Utc::now(),
        };
        accumulate_fill(agg, &fill);
        1
    }

    fn finish(
        &self,
        symbol: &str,
        agg: &OrderContext,
        legs_filled: u32,
        reason: Option<String>,
    ) -> ExitResult {
        let result = ExitResult::from_aggregate(agg, legs_filled, reason);
        info!(
            "{}: exit done success={} filled={} avg={:?} legs={} reason={:?}",
            symbol, result.success, result.filled_qty, result.avg_price, legs_filled, result.reason
        );
        result
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &PendingExitRegistry {
        &self.registry
    }
}

/// Final fill of one ladder leg
#[derive(Debug, Clone)]
struct LegFill {
    order_id: String,
    qty: Decimal,
    avg_price: Decimal,
    fees: Decimal,
}
