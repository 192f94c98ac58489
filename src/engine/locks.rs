//! Per-symbol position locks
//!
//! Switch-class transitions can be triggered from more than one
//! evaluation path at once; each symbol gets a lazily-created lock and a
//! busy lock means a switch is already in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub struct PositionLockRegistry {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Default for PositionLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionLockRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The symbol's lock handle, created on first use.
    pub fn handle(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Try to take the symbol's switch lock without waiting. None means
    /// another switch holds it right now.
    pub fn try_acquire(&self, symbol: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(symbol).try_lock_owned().ok()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
