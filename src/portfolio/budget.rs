//! Budget reservation ledger
//!
//! Capital is reserved before an order is placed, committed when it
//! fills, and released on failure or timeout. The ledger invariant:
//! reserved + committed + free == total, and a reservation can never
//! push the sum past the total.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::BudgetConfig;
use crate::error::{PylonError, Result};

pub type ReservationId = Uuid;

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub symbol: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    total: Decimal,
    committed: Decimal,
    reservations: HashMap<ReservationId, Reservation>,
}

impl Inner {
    fn reserved(&self) -> Decimal {
        self.reservations.values().map(|r| r.amount).sum()
    }

    fn free(&self) -> Decimal {
        self.total - self.committed - self.reserved()
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let before = self.reservations.len();
        self.reservations.retain(|_, r| r.expires_at > now);
        let purged = before - self.reservations.len();
        if purged > 0 {
            warn!("released {} expired budget reservations", purged);
        }
    }
}

pub struct BudgetLedger {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl BudgetLedger {
    pub fn new(config: &BudgetConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                total: config.total,
                committed: Decimal::ZERO,
                reservations: HashMap::new(),
            }),
            ttl: Duration::seconds(config.reservation_ttl_secs as i64),
        }
    }

    /// Reserve `amount` for a buy attempt. Denied before any order is
    /// placed when the amount exceeds free budget.
    pub fn reserve(&self, symbol: &str, amount: Decimal) -> Result<ReservationId> {
        if amount <= Decimal::ZERO {
            return Err(PylonError::Validation(format!(
                "reservation amount must be positive, got {}",
                amount
            )));
        }

        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(now);

        let free = inner.free();
        if amount > free {
            return Err(PylonError::InsufficientBudget {
                requested: amount,
                free,
            });
        }

        let id = Uuid::new_v4();
        inner.reservations.insert(
            id,
            Reservation {
                id,
                symbol: symbol.to_string(),
                amount,
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
        info!("{}: reserved {} (free now {})", symbol, amount, inner.free());
        Ok(id)
    }

    /// Commit a reservation on fill. The actual cost may be below the
    /// reserved amount (partial fill, better price); only the actual
    /// cost stays committed.
    pub fn commit(&self, id: ReservationId, actual_cost: Decimal) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let reservation = inner
            .reservations
            .remove(&id)
            .ok_or(PylonError::UnknownReservation(id))?;

        let cost = actual_cost.min(reservation.amount).max(Decimal::ZERO);
        if actual_cost > reservation.amount {
            warn!(
                "{}: fill cost {} above reservation {}, clamping",
                reservation.symbol, actual_cost, reservation.amount
            );
        }
        inner.committed += cost;
        info!(
            "{}: committed {} of reservation {}",
            reservation.symbol, cost, id
        );
        Ok(())
    }

    /// Release a reservation on failure/timeout. Unknown ids are fine:
    /// the reservation may have expired already.
    pub fn release(&self, id: ReservationId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.reservations.remove(&id) {
            Some(r) => {
                info!("{}: released reservation {} ({})", r.symbol, id, r.amount);
                true
            }
            None => false,
        }
    }

    /// Rebuild committed capital from restored snapshots on startup; the
    /// ledger itself is in-memory and does not survive a restart.
    pub fn restore_committed(&self, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.committed += amount;
    }

    /// Re-create a reservation restored from a snapshot, keeping its id
    /// so the in-flight order can still commit or release it.
    pub fn restore_reservation(&self, id: ReservationId, symbol: &str, amount: Decimal) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        inner.reservations.insert(
            id,
            Reservation {
                id,
                symbol: symbol.to_string(),
                amount,
                created_at: now,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Return capital when a position closes.
    pub fn settle_close(&self, cost_basis: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        let settled = cost_basis.min(inner.committed).max(Decimal::ZERO);
        inner.committed -= settled;
    }

    pub fn free(&self) -> Decimal {
        let mut inner = self.inner.lock().unwrap();
        inner.purge_expired(Utc::now());
        inner.free()
    }

    pub fn committed(&self) -> Decimal {
        self.inner.lock().unwrap().committed
    }

    pub fn reserved(&self) -> Decimal {
        self.inner.lock().unwrap().reserved()
    }

    pub fn total(&self) -> Decimal {
        self.inner.lock().unwrap().total
    }

    /// Ledger invariant, checked by tests and health reporting.
    pub fn balances(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.reserved() + inner.committed + inner.free() == inner.total
    }
}
