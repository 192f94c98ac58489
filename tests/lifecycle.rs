//! Full-lifecycle integration tests driven through a directly-pumped
//! symbol worker against the paper exchange.

mod common;

use common::{fast_config, Harness};
use pylon::domain::{Event, EventKind, Phase, ProtectionKind};
use pylon::exchange::FillMode;
use pylon::runtime::worker::SymbolWorker;
use pylon::SymbolState;
use rust_decimal_macros::dec;

/// Walk a fresh worker to POSITION against an immediately-filling book.
async fn advance_to_position(worker: &mut SymbolWorker) {
    // WARMUP -> IDLE
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::Idle);

    worker
        .handle_event(Event::new(EventKind::EntrySignal, "BTC-USD").with_reason("test"))
        .await;
    assert_eq!(worker.state().phase(), Phase::EntryEval);

    // ENTRY_EVAL -> PLACE_BUY (budget reserved)
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::PlaceBuy);

    // PLACE_BUY -> WAIT_FILL (order submitted)
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::WaitFill);

    // WAIT_FILL -> POSITION (poll sees the immediate fill)
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::Position);
}

#[tokio::test]
async fn entry_to_position_commits_budget_and_notifies_portfolio() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("entry", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    advance_to_position(&mut worker).await;

    let position = worker.state().position.clone().unwrap();
    assert_eq!(position.qty, dec!(1));
    assert_eq!(position.avg_entry_price, dec!(100.05));

    // Reservation became committed capital
    assert_eq!(harness.deps.budget.reserved(), dec!(0));
    assert_eq!(harness.deps.budget.committed(), dec!(100.05));
    assert!(harness.deps.budget.balances());

    assert_eq!(harness.portfolio.opened().len(), 1);
    harness.cleanup().await;
}

#[tokio::test]
async fn position_gets_initial_stop_loss_then_arms_to_take_profit() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("protect", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    advance_to_position(&mut worker).await;

    // Fills from here on are manual so protective orders rest
    harness.exchange.set_fill_mode(FillMode::Never);

    // First position cycle places the stop-loss
    worker.run_cycle().await;
    let protection = worker.state().protection.clone().unwrap();
    assert_eq!(protection.active_kind(), Some(ProtectionKind::StopLoss));

    // Price moves up past the arming threshold -> switch to take-profit
    harness.exchange.set_ticker("BTC-USD", dec!(102), dec!(102.05));
    worker.run_cycle().await;
    let protection = worker.state().protection.clone().unwrap();
    assert_eq!(protection.active_kind(), Some(ProtectionKind::TakeProfit));
    assert_eq!(worker.state().phase(), Phase::Position);

    // Exactly one protective order rests on the book
    assert_eq!(harness.exchange.open_order_ids().len(), 1);

    // Price falls back -> switch returns to stop-loss
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));
    worker.run_cycle().await;
    let protection = worker.state().protection.clone().unwrap();
    assert_eq!(protection.active_kind(), Some(ProtectionKind::StopLoss));
    assert_eq!(harness.exchange.open_order_ids().len(), 1);

    harness.cleanup().await;
}

#[tokio::test]
async fn exit_signal_walks_ladder_and_settles() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("exit", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    advance_to_position(&mut worker).await;

    // Let the stop-loss rest, then ask for an exit
    harness.exchange.set_fill_mode(FillMode::Never);
    worker.run_cycle().await;

    harness.exchange.set_fill_mode(FillMode::Immediate);
    harness.exchange.set_ticker("BTC-USD", dec!(104), dec!(104.05));
    worker
        .handle_event(Event::new(EventKind::ExitSignal, "BTC-USD").with_reason("signal"))
        .await;
    assert_eq!(worker.state().phase(), Phase::ExitEval);

    // EXIT_EVAL -> PLACE_SELL -> WAIT_SELL_FILL (ladder task spawned)
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::PlaceSell);
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::WaitSellFill);

    // Let the spawned ladder finish, then drain its completion event
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    worker.pump().await;
    assert_eq!(worker.state().phase(), Phase::PostTrade);

    // Settlement: portfolio notified, budget freed, cooldown entered
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::Cooldown);

    let closed = harness.portfolio.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].qty, dec!(1));
    assert_eq!(closed[0].avg_exit_price, dec!(104));
    assert!(closed[0].realized_pnl > dec!(3.5));

    assert_eq!(harness.deps.budget.committed(), dec!(0));
    assert!(harness.deps.budget.balances());
    assert!(worker.state().position.is_none());

    harness.cleanup().await;
}

#[tokio::test]
async fn protective_fill_closes_position_through_post_trade() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("protfill", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    advance_to_position(&mut worker).await;

    harness.exchange.set_fill_mode(FillMode::Never);
    worker.run_cycle().await;
    let order_id = worker
        .state()
        .protection
        .clone()
        .unwrap()
        .order_id()
        .unwrap()
        .to_string();

    // The resting stop-loss executes on the venue
    let fill = harness.exchange.fill_order(&order_id, dec!(1), dec!(98)).unwrap();
    let raw = Event::new(EventKind::OrderPartial, "BTC-USD")
        .with_order_id(fill.order_id.clone())
        .with_trade_id(fill.trade_id.clone())
        .with_fill(fill.qty, fill.price, fill.fee);
    worker.handle_event(raw).await;
    assert_eq!(worker.state().phase(), Phase::PostTrade);

    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::Cooldown);

    let closed = harness.portfolio.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, "protective");
    assert_eq!(closed[0].avg_exit_price, dec!(98));

    harness.cleanup().await;
}

#[tokio::test]
async fn duplicate_fill_delivery_mutates_state_once() {
    let config = fast_config(vec!["BTC-USD".into()]);
    let harness = Harness::new("dup", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));
    harness.exchange.set_fill_mode(FillMode::Never);

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    worker.run_cycle().await;
    worker
        .handle_event(Event::new(EventKind::EntrySignal, "BTC-USD"))
        .await;
    worker.run_cycle().await;
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::WaitFill);

    let order_id = worker.state().buy_order.clone().unwrap().order_id.unwrap();
    let fill = harness
        .exchange
        .fill_order(&order_id, dec!(0.4), dec!(100))
        .unwrap();
    let raw = Event::new(EventKind::OrderPartial, "BTC-USD")
        .with_order_id(fill.order_id.clone())
        .with_trade_id(fill.trade_id.clone())
        .with_fill(fill.qty, fill.price, fill.fee);

    worker.handle_event(raw.clone()).await;
    let after_first = worker.state().buy_order.clone().unwrap();
    assert_eq!(after_first.cumulative_filled_qty, dec!(0.4));

    // Exchange redelivers the same trade
    worker.handle_event(raw).await;
    let after_second = worker.state().buy_order.clone().unwrap();
    assert_eq!(after_second.cumulative_filled_qty, dec!(0.4));
    assert_eq!(after_second.fill_trades.len(), 1);
    assert_eq!(worker.state().phase(), Phase::WaitFill);

    harness.cleanup().await;
}

#[tokio::test]
async fn budget_contention_admits_exactly_one_entry() {
    let mut config = fast_config(vec!["BTC-USD".into(), "ETH-USD".into()]);
    config.budget.total = dec!(150);
    let harness = Harness::new("budget", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));
    harness.exchange.set_ticker("ETH-USD", dec!(100), dec!(100.05));
    harness.exchange.set_fill_mode(FillMode::Never);

    let mut btc = harness.worker(SymbolState::new("BTC-USD"));
    let mut eth = harness.worker(SymbolState::new("ETH-USD"));

    for worker in [&mut btc, &mut eth] {
        worker.run_cycle().await;
        let symbol = worker.state().symbol().to_string();
        worker
            .handle_event(Event::new(EventKind::EntrySignal, &symbol))
            .await;
    }

    // Both evaluate entries against a budget that fits only one
    btc.run_cycle().await;
    eth.run_cycle().await;

    assert_eq!(btc.state().phase(), Phase::PlaceBuy);
    // Denied before reaching order placement
    assert_eq!(eth.state().phase(), Phase::Idle);
    assert_eq!(harness.exchange.submit_count(), 0);
    assert!(harness.deps.budget.balances());

    harness.cleanup().await;
}

#[tokio::test]
async fn buy_timeout_with_partial_fill_adopts_position() {
    let mut config = fast_config(vec!["BTC-USD".into()]);
    config.engine.buy_timeout_secs = 0;
    let harness = Harness::new("salvage", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));
    harness.exchange.set_fill_mode(FillMode::Never);

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    worker.run_cycle().await;
    worker
        .handle_event(Event::new(EventKind::EntrySignal, "BTC-USD"))
        .await;
    worker.run_cycle().await;
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::WaitFill);

    // Half the order trades on the venue, then the timeout fires
    let order_id = worker.state().buy_order.clone().unwrap().order_id.unwrap();
    harness.exchange.fill_order(&order_id, dec!(0.5), dec!(100)).unwrap();

    // Zero timeout: the next cycle's timeout check fires immediately
    worker.run_cycle().await;

    assert_eq!(worker.state().phase(), Phase::Position);
    let position = worker.state().position.clone().unwrap();
    assert_eq!(position.qty, dec!(0.5));
    assert_eq!(harness.deps.budget.committed(), dec!(50));
    assert!(harness.deps.budget.balances());

    harness.cleanup().await;
}

#[tokio::test]
async fn buy_timeout_without_fill_returns_to_idle_and_releases() {
    let mut config = fast_config(vec!["BTC-USD".into()]);
    config.engine.buy_timeout_secs = 0;
    let harness = Harness::new("timeout", config).await;
    harness.exchange.set_ticker("BTC-USD", dec!(100), dec!(100.05));
    harness.exchange.set_fill_mode(FillMode::Never);

    let mut worker = harness.worker(SymbolState::new("BTC-USD"));
    worker.run_cycle().await;
    worker
        .handle_event(Event::new(EventKind::EntrySignal, "BTC-USD"))
        .await;
    worker.run_cycle().await;
    worker.run_cycle().await;
    assert_eq!(worker.state().phase(), Phase::WaitFill);
    assert_eq!(harness.deps.budget.free(), dec!(1000) - dec!(100.05));

    worker.run_cycle().await;

    assert_eq!(worker.state().phase(), Phase::Idle);
    assert!(worker.state().buy_order.is_none());
    assert_eq!(harness.deps.budget.free(), dec!(1000));
    // The resting order was cancelled on the venue
    assert!(harness.exchange.open_order_ids().is_empty());

    harness.cleanup().await;
}
