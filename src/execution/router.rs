//! Idempotent order router
//!
//! Wraps the exchange client's mutating calls in the uniform retry
//! wrapper and resolves duplicate submissions through the client order
//! id: a retried submission that already landed is reconciled by fetching
//! the authoritative order, never by submitting again blind.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::domain::{OrderAck, OrderRequest, OrderSnapshot};
use crate::error::{PylonError, Result};
use crate::exchange::ExchangeClient;

use super::retry::{retry_with_backoff, RetryPolicy};

/// How long a request hash is remembered per client order id
const REQUEST_HASH_TTL_SECS: i64 = 3600;

pub struct OrderRouter {
    exchange: Arc<dyn ExchangeClient>,
    policy: RetryPolicy,
    /// COID -> (request hash, first seen); guards against reusing a COID
    /// for a different order
    seen_requests: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl OrderRouter {
    pub fn new(exchange: Arc<dyn ExchangeClient>, policy: RetryPolicy) -> Self {
        Self {
            exchange,
            policy,
            seen_requests: Mutex::new(HashMap::new()),
        }
    }

    /// Submit an order. The request's client order id is the idempotency
    /// key: retries reuse it, and a duplicate-order response resolves to
    /// the original order's authoritative state.
    pub async fn submit(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.check_request_hash(request)?;

        let exchange = self.exchange.clone();
        let result = retry_with_backoff(&self.policy, "submit_order", || {
            let exchange = exchange.clone();
            async move { exchange.submit_order(request).await }
        })
        .await;

        match result {
            Ok(ack) => Ok(ack),
            Err(PylonError::DuplicateOrder(coid)) => {
                warn!(
                    "duplicate submission for {}; resolving via authoritative lookup",
                    coid
                );
                match self.exchange.lookup_client_order(&coid).await? {
                    Some(snapshot) => {
                        info!(
                            "resolved duplicate {} to order {} ({})",
                            coid, snapshot.order_id, snapshot.status
                        );
                        Ok(ack_from_snapshot(&snapshot))
                    }
                    None => Err(PylonError::DuplicateOrder(coid)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel an order, retried. Returns false when the order was already
    /// terminal on the exchange.
    pub async fn cancel(&self, order_id: &str) -> Result<bool> {
        let exchange = self.exchange.clone();
        retry_with_backoff(&self.policy, "cancel_order", || {
            let exchange = exchange.clone();
            let order_id = order_id.to_string();
            async move { exchange.cancel_order(&order_id).await }
        })
        .await
    }

    /// Fetch authoritative order state, retried.
    pub async fn fetch(&self, order_id: &str) -> Result<OrderSnapshot> {
        let exchange = self.exchange.clone();
        retry_with_backoff(&self.policy, "fetch_order", || {
            let exchange = exchange.clone();
            let order_id = order_id.to_string();
            async move { exchange.fetch_order(&order_id).await }
        })
        .await
    }

    /// Authoritative lookup by client order id.
    pub async fn lookup_client_order(&self, coid: &str) -> Result<Option<OrderSnapshot>> {
        self.exchange.lookup_client_order(coid).await
    }

    /// Reject reuse of a client order id for a materially different
    /// request; replays of the identical request are allowed through so
    /// the exchange's own dedup can answer.
    fn check_request_hash(&self, request: &OrderRequest) -> Result<()> {
        let hash = hash_request(request);
        let now = Utc::now();
        let mut seen = self.seen_requests.lock().unwrap();
        seen.retain(|_, (_, at)| now - *at < Duration::seconds(REQUEST_HASH_TTL_SECS));

        match seen.get(&request.client_order_id) {
            Some((existing, _)) if *existing != hash => Err(PylonError::Validation(format!(
                "client order id {} reused for a different request",
                request.client_order_id
            ))),
            Some(_) => Ok(()),
            None => {
                seen.insert(request.client_order_id.clone(), (hash, now));
                Ok(())
            }
        }
    }
}

/// Deterministic hash of the order parameters
fn hash_request(request: &OrderRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.symbol.as_bytes());
    hasher.update(request.side.to_string().as_bytes());
    hasher.update(request.qty.to_string().as_bytes());
    if let Some(price) = request.limit_price {
        hasher.update(price.to_string().as_bytes());
    }
    hasher.update(format!("{:?}", request.order_type).as_bytes());
    hasher.update(format!("{:?}", request.time_in_force).as_bytes());
    hex::encode(hasher.finalize())
}

fn ack_from_snapshot(snapshot: &OrderSnapshot) -> OrderAck {
    OrderAck {
        order_id: snapshot.order_id.clone(),
        client_order_id: snapshot.client_order_id.clone(),
        status: snapshot.status,
        accepted_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderStatus;
    use crate::exchange::{FillMode, PaperExchange};
    use mockall::mock;
    use rust_decimal_macros::dec;

    mock! {
        Exchange {}

        #[async_trait::async_trait]
        impl ExchangeClient for Exchange {
            async fn submit_order(&self, request: &OrderRequest) -> Result<OrderAck>;
            async fn cancel_order(&self, order_id: &str) -> Result<bool>;
            async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot>;
            async fn lookup_client_order(
                &self,
                client_order_id: &str,
            ) -> Result<Option<OrderSnapshot>>;
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn submit_retries_transient_errors() {
        let mut mock = MockExchange::new();
        let mut calls = 0;
        mock.expect_submit_order().times(3).returning(move |req| {
            calls += 1;
            if calls < 3 {
                Err(PylonError::ExchangeUnavailable("blip".into()))
            } else {
                Ok(OrderAck {
                    order_id: "o-1".into(),
                    client_order_id: req.client_order_id.clone(),
                    status: OrderStatus::Submitted,
                    accepted_at: Utc::now(),
                })
            }
        });

        let router = OrderRouter::new(Arc::new(mock), fast_policy());
        let request = OrderRequest::buy_limit("BTC-USD", dec!(1), dec!(100));
        let ack = router.submit(&request).await.unwrap();
        assert_eq!(ack.order_id, "o-1");
    }

    #[tokio::test]
    async fn duplicate_resolves_to_original_order() {
        let mut mock = MockExchange::new();
        mock.expect_submit_order()
            .times(1)
            .returning(|req| Err(PylonError::DuplicateOrder(req.client_order_id.clone())));
        mock.expect_lookup_client_order().times(1).returning(|coid| {
            Ok(Some(OrderSnapshot {
                order_id: "o-original".into(),
                client_order_id: coid.to_string(),
                status: OrderStatus::Filled,
                filled_qty: dec!(1),
                avg_fill_price: Some(dec!(100)),
                total_fees: dec!(0.1),
            }))
        });

        let router = OrderRouter::new(Arc::new(mock), fast_policy());
        let request = OrderRequest::buy_limit("BTC-USD", dec!(1), dec!(100));
        let ack = router.submit(&request).await.unwrap();
        assert_eq!(ack.order_id, "o-original");
        assert_eq!(ack.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn coid_reuse_for_different_request_is_rejected() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_fill_mode(FillMode::Never);
        let router = OrderRouter::new(exchange, fast_policy());

        let first = OrderRequest::buy_limit("BTC-USD", dec!(1), dec!(100));
        router.submit(&first).await.unwrap();

        let conflicting =
            OrderRequest::buy_limit("BTC-USD", dec!(2), dec!(90)).with_client_order_id(first.client_order_id.clone());
        let err = router.submit(&conflicting).await.unwrap_err();
        assert!(matches!(err, PylonError::Validation(_)));
    }

    #[tokio::test]
    async fn identical_replay_resolves_through_exchange_dedup() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_fill_mode(FillMode::Never);
        let router = OrderRouter::new(exchange.clone(), fast_policy());

        let request = OrderRequest::buy_limit("BTC-USD", dec!(1), dec!(100));
        let first = router.submit(&request).await.unwrap();
        let replay = router.submit(&request).await.unwrap();
        assert_eq!(first.order_id, replay.order_id);
        // Only one order ever landed on the book
        assert_eq!(exchange.open_order_ids().len(), 1);
    }

    #[tokio::test]
    async fn cancel_passes_through() {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_fill_mode(FillMode::Never);
        let router = OrderRouter::new(exchange.clone(), fast_policy());

        let request = OrderRequest::buy_limit("BTC-USD", dec!(1), dec!(100));
        let ack = router.submit(&request).await.unwrap();
        assert!(router.cancel(&ack.order_id).await.unwrap());
        assert!(!router.cancel(&ack.order_id).await.unwrap());
    }

    #[test]
    fn request_hash_is_parameter_sensitive() {
        let a = OrderRequest::buy_limit("BTC-USD", dec!(1), dec!(100));
        let mut b = a.clone();
        assert_eq!(hash_request(&a), hash_request(&b));
        b.qty = dec!(2);
        assert_ne!(hash_request(&a), hash_request(&b));
    }
}
