//! Crash recovery and concurrency properties: restarts never duplicate
//! orders, unknown events never mutate state, and concurrent protection
//! switches have exactly one winner.

mod common;

use common::{fast_config, Harness};
use pylon::config::ReplaceFailurePolicy;
use pylon::domain::{
    Event, EventKind, OrderRequest, Phase, PositionInfo, ProtectionKind, ProtectionState,
};
use pylon::engine::{PositionLockRegistry, ProtectionSwitcher, SwitchOutcome};
use pylon::exchange::{ExchangeClient, FillMode, PaperExchange};
use pylon::execution::{OrderRouter, RetryPolicy};
use pylon::persistence::SnapshotStore;
use pylon::SymbolState;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Drive a fresh worker to WAIT_FILL against a book that never fills.
async fn advance_to_wait_fill(worker: &mut pylon::runtime::worker::SymbolWorker) {
    worker.run_cycle().await;
    let symbol = worker.state().symbol().to_string();
    worker
        .handle_event(Event::new(EventKind::EntrySignal, &symbol))
        .await;
    worker.run_cycle().await;
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::WaitFill);
}

#[tokio::test]
async fn restart_in_wait_fill_never_duplicates_the_buy() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("restart-wf", config.clone()).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));
    harness.exchange.set_fill_mode(FillMode::Never);

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    advance_to_wait_fill(&mut worker).await;
    let order_id = worker.state().buy_order.clone().unwrap().order_id.unwrap();
    assert_eq!(harness.exchange.submit_count(), 1);

    // Kill the process: the worker is gone, the snapshot and the resting
    // exchange order survive
    drop(worker);

    let restart = Harness::with(
        harness.exchange.clone(),
        harness.snapshot_dir.clone(),
        config,
    )
    .await;
    let store = SnapshotStore::new(&restart.snapshot_dir).await.unwrap();
    let restored = store.load("BTC-USD").await.unwrap().unwrap();
    assert_eq!(restored.phase(), Phase::WaitFill);
    assert_eq!(
        restored.buy_order.as_ref().unwrap().order_id.as_deref(),
        Some(order_id.as_str())
    );

    let mut worker = restart.worker(restored);
    worker.reconcile_startup().await;
    worker.run_cycle().await;

    // Still polling the same order; no second submission
    assert_eq!(worker.state().phase(), Phase::WaitFill);
    assert_eq!(restart.exchange.submit_count(), 1);

    // The order finally fills and the position opens
    restart.exchange.fill_order(&order_id, dec!(1), dec!(100.05)).unwrap();
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::Position);
    assert_eq!(restart.exchange.submit_count(), 1);

    harness.cleanup().await;
}

#[tokio::test]
async fn restart_in_place_buy_adopts_the_inflight_order() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("restart-pb", config.clone()).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));
    harness.exchange.set_fill_mode(FillMode::Never);

    // Reach PLACE_BUY: the buy context (and its client order id) exists
    // but no acknowledgement was recorded before the crash
    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    worker.run_cycle().await;
    worker
        .handle_event(Event::new(EventKind::EntrySignal, "BTC-USD"))
        .await;
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::PlaceBuy);
    let coid = worker
        .state()
        .buy_order
        .clone()
        .unwrap()
        .client_order_id;
    drop(worker);

    // The submission actually landed on the exchange before the crash
    let request = OrderRequest::buy_limit("BTC-USD", dec!(1), dec!(100.05))
        .with_client_order_id(coid.clone());
    let ack = harness.exchange.submit_order(&request).await.unwrap();

    let restart = Harness::with(
        harness.exchange.clone(),
        harness.snapshot_dir.clone(),
        config,
    )
    .await;
    let store = SnapshotStore::new(&restart.snapshot_dir).await.unwrap();
    let restored = store.load("BTC-USD").await.unwrap().unwrap();
    assert_eq!(restored.phase(), Phase::PlaceBuy);

    let mut worker = restart.worker(restored);
    worker.reconcile_startup().await;

    // Reconciliation adopted the in-flight order instead of resubmitting
    assert_eq!(worker.state().phase(), Phase::WaitFill);
    assert_eq!(
        worker.state().buy_order.as_ref().unwrap().order_id.as_deref(),
        Some(ack.order_id.as_str())
    );
    assert_eq!(restart.exchange.submit_count(), 1);

    harness.cleanup().await;
}

#[tokio::test]
async fn snapshot_survives_every_transition() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("snap-seq", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    worker.run_cycle().await; // WARMUP -> IDLE

    let store = SnapshotStore::new(&harness.snapshot_dir).await.unwrap();
    let on_disk = store.load("BTC-USD").await.unwrap().unwrap();
    assert_eq!(on_disk.phase(), Phase::Idle);
    assert_eq!(on_disk.transition_seq, worker.state().transition_seq);

    harness.cleanup().await;
}

#[tokio::test]
async fn unknown_events_never_mutate_any_phase() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("table-prop", config).await;
    let engine = &harness.deps.engine;

    for phase in Phase::all() {
        let valid = engine.valid_events(phase);
        for kind in EventKind::all() {
            if valid.contains(kind) {
                continue;
            }
            let mut state = SymbolState::with_phase("BTC-USD", phase);
            let event = Event::new(*kind, "BTC-USD");
            let applied = engine.process_event(&mut state, &event).await;
            assert!(
                !applied,
                "({}, {}) should be rejected",
                phase, kind
            );
            assert_eq!(state.phase(), phase, "({}, {}) mutated phase", phase, kind);
            assert_eq!(state.transition_seq, 0);
        }
    }

    harness.cleanup().await;
}

#[tokio::test]
async fn concurrent_switch_attempts_have_one_winner() {
    let exchange = Arc::new(PaperExchange::new());
    exchange.set_fill_mode(FillMode::Never);
    let router = Arc::new(OrderRouter::new(
        exchange.clone(),
        RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
    ));
    let switcher = Arc::new(ProtectionSwitcher::new(
        router,
        ReplaceFailurePolicy::LeaveUnprotected,
    ));
    let locks = Arc::new(PositionLockRegistry::new());

    let mut state = SymbolState::new("BTC-USD");
    state.position = Some(PositionInfo {
        qty: dec!(1),
        avg_entry_price: dec!(100),
        entry_fees: dec!(0),
        opened_at: chrono::Utc::now(),
    });
    switcher
        .place_initial(&mut state, ProtectionKind::StopLoss, dec!(98))
        .await
        .unwrap();
    let state = Arc::new(Mutex::new(state));

    // Two evaluation paths observe the same threshold cross at once
    let attempt = |state: Arc<Mutex<SymbolState>>,
                   locks: Arc<PositionLockRegistry>,
                   switcher: Arc<ProtectionSwitcher>| async move {
        let Some(_guard) = locks.try_acquire("BTC-USD") else {
            return None;
        };
        let mut state = state.lock().await;
        Some(
            switcher
                .execute(&mut state, ProtectionKind::TakeProfit, dec!(103))
                .await
                .unwrap(),
        )
    };

    let (a, b) = tokio::join!(
        attempt(state.clone(), locks.clone(), switcher.clone()),
        attempt(state.clone(), locks.clone(), switcher.clone())
    );

    let switched = [&a, &b]
        .iter()
        .filter(|o| matches!(o, Some(SwitchOutcome::Switched { .. })))
        .count();
    assert_eq!(switched, 1, "exactly one switch must complete: {:?} {:?}", a, b);

    // The loser was a no-op: lock busy, already active, or in flight
    for outcome in [a, b] {
        assert!(matches!(
            outcome,
            None
                | Some(SwitchOutcome::Switched { .. })
                | Some(SwitchOutcome::AlreadyActive)
                | Some(SwitchOutcome::InFlight)
        ));
    }

    // Invariant: exactly one protective order rests, protection is a
    // final value naming it
    let state = state.lock().await;
    match state.protection.as_ref().unwrap() {
        ProtectionState::Active { kind, order_id, .. } => {
            assert_eq!(*kind, ProtectionKind::TakeProfit);
            assert_eq!(exchange.open_order_ids(), vec![order_id.clone()]);
        }
        other => panic!("expected Active protection, got {:?}", other),
    }
}

#[tokio::test]
async fn error_phase_requires_manual_reset() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("error", config).await;
    let engine = &harness.deps.engine;

    // An action failure parks the symbol in ERROR
    let mut state = SymbolState::with_phase("BTC-USD", Phase::WaitFill);
    let event = Event::new(EventKind::OrderPartial, "BTC-USD")
        .with_trade_id("t-1")
        .with_fill(dec!(1), dec!(100), dec!(0));
    assert!(!engine.process_event(&mut state, &event).await);
    assert_eq!(state.phase(), Phase::Error);

    // Everything except the reset bounces
    for kind in [
        EventKind::EntrySignal,
        EventKind::OrderFilled,
        EventKind::CooldownExpired,
    ] {
        let stray = Event::new(kind, "BTC-USD");
        assert!(!engine.process_event(&mut state, &stray).await);
        assert_eq!(state.phase(), Phase::Error);
    }

    let reset = Event::new(EventKind::ManualReset, "BTC-USD");
    assert!(engine.process_event(&mut state, &reset).await);
    assert_eq!(state.phase(), Phase::Idle);

    harness.cleanup().await;
}
