use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{OrderAck, OrderRequest, OrderSnapshot};
use crate::error::Result;

/// Top-of-book quote for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    /// Relative spread (ask - bid) / bid
    pub fn spread_pct(&self) -> Decimal {
        if self.bid.is_zero() {
            return Decimal::MAX;
        }
        (self.ask - self.bid) / self.bid
    }

    /// Callers enforce a max-age threshold; stale data is unavailable data.
    pub fn is_stale(&self, max_age_secs: u64, now: DateTime<Utc>) -> bool {
        now - self.timestamp > Duration::seconds(max_age_secs as i64)
    }
}

/// Market data collaborator (price feed). The cache/transport behind it is
/// out of scope; the engine only ever asks for the current ticker.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;
}

/// Exchange order-entry collaborator. Client order ids are idempotency
/// keys: resubmitting after a timeout must surface the original order or a
/// recognizable duplicate error, never a second order.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    /// Returns true if the order was cancelled, false if it was already
    /// terminal (filled/cancelled) on the exchange.
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot>;

    /// Authoritative lookup by client order id, used to resolve duplicate
    /// submissions after ambiguous failures.
    async fn lookup_client_order(&self, client_order_id: &str) -> Result<Option<OrderSnapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn spread_pct() {
        let ticker = Ticker {
            bid: dec!(100),
            ask: dec!(101),
            last: dec!(100.5),
            timestamp: Utc::now(),
        };
        assert_eq!(ticker.spread_pct(), dec!(0.01));
    }

    #[test]
    fn staleness_threshold() {
        let now = Utc::now();
        let ticker = Ticker {
            bid: dec!(100),
            ask: dec!(100.1),
            last: dec!(100),
            timestamp: now - Duration::seconds(30),
        };
        assert!(ticker.is_stale(10, now));
        assert!(!ticker.is_stale(60, now));
    }
}
