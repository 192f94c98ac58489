//! Event idempotency store
//!
//! Exchange callbacks and retried acknowledgements can arrive more than
//! once; the store dedupes logical events by fingerprint. A one-second
//! timestamp bucket absorbs redelivery jitter of the same event while
//! distinct fills stay distinct through their trade ids.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::domain::{Event, Fingerprint};

pub struct IdempotencyStore {
    inner: Mutex<HashMap<Fingerprint, DateTime<Utc>>>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// Has this logical event already been processed within the TTL?
    /// Expired fingerprints are purged on the way.
    pub fn is_duplicate(&self, event: &Event) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, expires| *expires > now);
        inner.contains_key(&event.fingerprint())
    }

    /// Record the event as processed.
    pub fn mark_processed(&self, event: &Event) {
        let fingerprint = event.fingerprint();
        debug!("fingerprint processed: {}", fingerprint);
        let mut inner = self.inner.lock().unwrap();
        inner.insert(fingerprint, Utc::now() + self.ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;

    #[test]
    fn first_delivery_is_not_duplicate() {
        let store = IdempotencyStore::new(300);
        let event = Event::new(EventKind::OrderFilled, "BTC-USD").with_order_id("o-1");
        assert!(!store.is_duplicate(&event));
        store.mark_processed(&event);
        assert!(store.is_duplicate(&event));
    }

    #[test]
    fn redelivery_in_same_bucket_is_duplicate() {
        let store = IdempotencyStore::new(300);
        let event = Event::new(EventKind::BuyPlaced, "BTC-USD").with_order_id("o-1");
        store.mark_processed(&event);

        let redelivery = event.clone();
        assert!(store.is_duplicate(&redelivery));
    }

    #[test]
    fn different_order_is_distinct() {
        let store = IdempotencyStore::new(300);
        let a = Event::new(EventKind::OrderFilled, "BTC-USD").with_order_id("o-1");
        store.mark_processed(&a);

        let b = Event::new(EventKind::OrderFilled, "BTC-USD").with_order_id("o-2");
        assert!(!store.is_duplicate(&b));
    }

    #[test]
    fn expired_fingerprints_are_purged() {
        let store = IdempotencyStore::new(0);
        let event = Event::new(EventKind::OrderFilled, "BTC-USD").with_order_id("o-1");
        store.mark_processed(&event);
        // TTL zero: the next check purges it
        assert!(!store.is_duplicate(&event));
        assert!(store.is_empty());
    }
}
