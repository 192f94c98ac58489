//! FSM core engine
//!
//! `process_event` is the single funnel every state change goes through:
//! idempotency check, transition lookup, action execution, then the
//! commit (phase update, fingerprint, snapshot, audit log). Unexpected
//! events never mutate state; action failures park the symbol in ERROR
//! instead of crashing the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::{Event, EventKind, Phase, ProtectionKind, SymbolState};
use crate::persistence::SnapshotStore;

use super::actions::{self, ActionError};
use super::idempotency::IdempotencyStore;
use super::locks::PositionLockRegistry;
use super::switching::{ProtectionSwitcher, SwitchOutcome};
use super::table::{TransitionClass, TransitionTable};

/// Engine counters, exposed for health reporting
#[derive(Debug, Default)]
pub struct EngineStats {
    pub transitions: AtomicU64,
    pub invalid_events: AtomicU64,
    pub duplicate_events: AtomicU64,
    pub action_failures: AtomicU64,
    pub switches_completed: AtomicU64,
    pub switches_skipped: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct EngineStatsSnapshot {
    pub transitions: u64,
    pub invalid_events: u64,
    pub duplicate_events: u64,
    pub action_failures: u64,
    pub switches_completed: u64,
    pub switches_skipped: u64,
}

impl EngineStats {
    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            transitions: self.transitions.load(Ordering::Relaxed),
            invalid_events: self.invalid_events.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            action_failures: self.action_failures.load(Ordering::Relaxed),
            switches_completed: self.switches_completed.load(Ordering::Relaxed),
            switches_skipped: self.switches_skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct FsmEngine {
    table: TransitionTable,
    idempotency: IdempotencyStore,
    locks: PositionLockRegistry,
    switcher: ProtectionSwitcher,
    snapshots: Arc<SnapshotStore>,
    seq: AtomicU64,
    stats: EngineStats,
}

impl FsmEngine {
    pub fn new(
        config: &EngineConfig,
        switcher: ProtectionSwitcher,
        snapshots: Arc<SnapshotStore>,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            table: TransitionTable::build()?,
            idempotency: IdempotencyStore::new(config.idempotency_ttl_secs),
            locks: PositionLockRegistry::new(),
            switcher,
            snapshots,
            seq: AtomicU64::new(0),
            stats: EngineStats::default(),
        })
    }

    /// Process one event against one symbol's state. Returns true when a
    /// transition committed.
    pub async fn process_event(&self, state: &mut SymbolState, event: &Event) -> bool {
        // 1. Duplicate deliveries are no-ops
        if self.idempotency.is_duplicate(event) {
            debug!(
                "{}: duplicate {} ignored (order {:?})",
                event.symbol, event.kind, event.order_id
            );
            self.stats.duplicate_events.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // 2. Unknown (phase, event) pairs never mutate state
        let from = state.phase();
        let Some(transition) = self.table.lookup(from, event.kind) else {
            let valid: Vec<&str> = self
                .table
                .valid_events(from)
                .iter()
                .map(|k| k.as_str())
                .collect();
            warn!(
                "{}: invalid transition: {} in phase {} (valid: {})",
                event.symbol,
                event.kind,
                from,
                valid.join(", ")
            );
            self.stats.invalid_events.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let transition = transition.clone();

        // 3. Execute
        match transition.class {
            TransitionClass::Switch => self.process_switch(state, event, from).await,
            TransitionClass::Standard => {
                match actions::apply(transition.action, state, event) {
                    Ok(()) => {
                        self.commit(state, event, from, transition.to).await;
                        true
                    }
                    Err(e) => {
                        self.force_error(state, event, from, &e).await;
                        false
                    }
                }
            }
        }
    }

    /// Switch-class transitions additionally take the per-symbol lock;
    /// a busy lock means another switch is mid-flight and this attempt
    /// is a no-op.
    async fn process_switch(&self, state: &mut SymbolState, event: &Event, from: Phase) -> bool {
        let Some(_guard) = self.locks.try_acquire(state.symbol()) else {
            info!(
                "{}: switch lock busy, {} skipped",
                event.symbol, event.kind
            );
            self.stats.switches_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let target = match event.kind {
            EventKind::SwitchToTakeProfit => ProtectionKind::TakeProfit,
            EventKind::SwitchToStopLoss => ProtectionKind::StopLoss,
            _ => {
                warn!("{}: {} is not a switch event", event.symbol, event.kind);
                return false;
            }
        };
        let Some(price) = event.price else {
            let err = ActionError::MissingField("price");
            self.force_error(state, event, from, &err).await;
            return false;
        };

        match self.switcher.execute(state, target, price).await {
            Ok(SwitchOutcome::Switched { .. }) => {
                self.stats.switches_completed.fetch_add(1, Ordering::Relaxed);
                self.commit(state, event, from, from).await;
                true
            }
            Ok(outcome) => {
                info!("{}: switch to {} not applied: {:?}", event.symbol, target, outcome);
                self.stats.switches_skipped.fetch_add(1, Ordering::Relaxed);
                // Reverted/no-op switches still changed the protection
                // marker transiently; persist the final value we settled on.
                self.persist(state).await;
                false
            }
            Err(e) => {
                self.force_error_msg(state, event, from, &e.to_string()).await;
                false
            }
        }
    }

    /// 4. Commit: phase, fingerprint, snapshot, audit log.
    async fn commit(&self, state: &mut SymbolState, event: &Event, from: Phase, to: Phase) {
        state.set_phase(to);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        state.transition_seq = seq;
        self.idempotency.mark_processed(event);
        self.stats.transitions.fetch_add(1, Ordering::Relaxed);
        self.persist(state).await;

        info!(
            symbol = %event.symbol,
            from = %from,
            to = %to,
            event = %event.kind,
            order_id = event.order_id.as_deref().unwrap_or(""),
            seq,
            "transition"
        );
    }

    async fn force_error(
        &self,
        state: &mut SymbolState,
        event: &Event,
        from: Phase,
        err: &ActionError,
    ) {
        self.force_error_msg(state, event, from, &err.to_string()).await
    }

    /// Action failures must neither crash the engine nor half-apply a
    /// transition: the phase goes to ERROR and stays there until the
    /// manual-recovery event.
    async fn force_error_msg(
        &self,
        state: &mut SymbolState,
        event: &Event,
        from: Phase,
        message: &str,
    ) {
        state.error_count += 1;
        state.last_error = Some(message.to_string());
        state.set_phase(Phase::Error);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        state.transition_seq = seq;
        self.stats.action_failures.fetch_add(1, Ordering::Relaxed);
        self.persist(state).await;

        warn!(
            symbol = %event.symbol,
            from = %from,
            to = %Phase::Error,
            event = %event.kind,
            error = message,
            seq,
            "action failed, symbol parked in ERROR"
        );
    }

    /// Snapshot failures are logged, not fatal: the in-memory state is
    /// still authoritative and the next commit retries the write.
    async fn persist(&self, state: &SymbolState) {
        if let Err(e) = self.snapshots.save(state).await {
            tracing::error!("{}: snapshot save failed: {}", state.symbol(), e);
        }
    }

    pub fn valid_events(&self, phase: Phase) -> Vec<EventKind> {
        self.table.valid_events(phase)
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn locks(&self) -> &PositionLockRegistry {
        &self.locks
    }
}
