// ===============================
// tests/engine_tests.rs
// ===============================
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use krw_exec_bot::config::{EngineConfig, RiskConfig};
use krw_exec_bot::domain::{Candle, ExecMode, Fill, Position, Side, Signal};
use krw_exec_bot::executor::{EscapeOutcome, ExecError, OrderExecutor};
use krw_exec_bot::gateway::{BrokerClient, PaperBroker};
use krw_exec_bot::notifier::Notifier;
use krw_exec_bot::positions::ExitOutcome;
use krw_exec_bot::recorder::{MemoryTradeStore, TradeHistoryStore};
use krw_exec_bot::risk::PositionSizer;
use krw_exec_bot::runner::ExecutionLoop;
use krw_exec_bot::strategy::SignalSource;

fn candles(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| Candle { timestamp: i as i64, open: *c, high: *c, low: *c, close: *c, volume: 1.0 })
        .collect()
}

fn engine_cfg(dry_run: bool) -> EngineConfig {
    EngineConfig {
        dry_run,
        poll_interval: Duration::from_millis(10),
        fill_poll_interval: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

fn relaxed_risk() -> RiskConfig {
    RiskConfig { max_daily_loss_pct: 50.0, max_open_positions: 10, ..RiskConfig::default() }
}

async fn executor(
    broker: &Arc<PaperBroker>,
    store: &Arc<MemoryTradeStore>,
    cfg: EngineConfig,
    risk: RiskConfig,
) -> OrderExecutor {
    let broker: Arc<dyn BrokerClient> = broker.clone();
    let store: Arc<dyn TradeHistoryStore> = store.clone();
    OrderExecutor::new(broker, store, risk, Notifier::default(), cfg, "test").await.unwrap()
}

async fn seed_open_position(store: &MemoryTradeStore, market: &str, price: f64, volume: f64) {
    let p = Position::open(market, "test", Fill::for_volume(price, volume), Utc::now());
    store.save_position(&p).await.unwrap();
}

fn close_to(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

// ---------------------------------------------------------------------------
// Dry-run
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dry_run_round_trip_never_touches_broker_orders() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(true), relaxed_risk()).await;

    let buy = ex.execute("KRW-BTC", Signal::Buy, &candles(&[50_000.0])).await.unwrap().unwrap();
    assert_eq!(buy.side, Side::Buy);
    assert_eq!(buy.mode, ExecMode::DryRun);
    assert!(buy.order_id.is_none());
    // 3% of 1,000,000
    assert!(close_to(buy.amount, 30_000.0));
    assert!(close_to(buy.volume, 0.6));
    assert!(ex.ledger().is_open("KRW-BTC"));

    let sell = ex.execute("KRW-BTC", Signal::Sell, &candles(&[55_000.0])).await.unwrap().unwrap();
    assert!(close_to(sell.pnl_pct.unwrap(), 10.0));
    assert!(!ex.ledger().is_open("KRW-BTC"));
    assert!(broker.placed_orders().is_empty());
    assert_eq!(broker.balance("KRW"), 1_000_000.0);

    let trades = store.recent_trades(10).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert!(trades.iter().all(|t| t.dry_run));
    assert!(store.get_open_positions(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn recovered_position_sells_with_exact_pnl() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    seed_open_position(&store, "KRW-BTC", 10_000.0, 1.0).await;
    let mut ex = executor(&broker, &store, engine_cfg(true), relaxed_risk()).await;

    let sell = ex.execute("KRW-BTC", Signal::Sell, &candles(&[11_000.0])).await.unwrap().unwrap();
    assert_eq!(sell.pnl_pct, Some(10.0));
    assert_eq!(sell.amount, 11_000.0);
    assert!(ex.ledger().get("KRW-BTC").is_none());

    let closed = store.statistics(Some("KRW-BTC"), false).await.unwrap();
    assert_eq!(closed.closed_positions, 1);
    assert_eq!(closed.total_pnl, 1_000.0);
}

#[tokio::test]
async fn hold_and_unmatched_signals_are_no_ops() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(true), relaxed_risk()).await;

    assert!(ex.execute("KRW-BTC", Signal::Hold, &[]).await.unwrap().is_none());
    assert!(ex.execute("KRW-BTC", Signal::Sell, &candles(&[100.0])).await.unwrap().is_none());
    assert!(matches!(ex.execute("KRW-BTC", Signal::Buy, &[]).await, Err(ExecError::NoCandles(_))));
    assert!(store.recent_trades(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_buy_keeps_a_single_position() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(true), relaxed_risk()).await;

    assert!(ex.execute("KRW-BTC", Signal::Buy, &candles(&[1_000.0])).await.unwrap().is_some());
    assert!(ex.execute("KRW-BTC", Signal::Buy, &candles(&[900.0])).await.unwrap().is_none());
    assert_eq!(ex.ledger().total_open(), 1);
    assert_eq!(ex.ledger().get("KRW-BTC").unwrap().entry_price, 1_000.0);
    assert_eq!(store.get_open_positions(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_live_buy_places_a_single_order() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_price("KRW-BTC", 50_000.0);
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(false), relaxed_risk()).await;

    assert!(ex.execute("KRW-BTC", Signal::Buy, &candles(&[50_000.0])).await.unwrap().is_some());
    assert!(ex.execute("KRW-BTC", Signal::Buy, &candles(&[48_000.0])).await.unwrap().is_none());
    assert_eq!(broker.placed_orders().len(), 1);
    assert_eq!(ex.ledger().total_open(), 1);
    assert_eq!(store.recent_trades(10).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Capacity, liquidation, daily risk
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_portfolio_liquidates_worst_before_new_entry() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(true), relaxed_risk()).await;

    let markets = ["KRW-A", "KRW-B", "KRW-C", "KRW-D", "KRW-E"];
    for m in markets {
        broker.set_price(m, 1_000.0);
        ex.execute(m, Signal::Buy, &candles(&[1_000.0])).await.unwrap().unwrap();
    }
    assert_eq!(ex.ledger().total_open(), 5);
    assert!(!ex.ledger().can_open_new_position());

    broker.set_price("KRW-C", 800.0);
    broker.set_price("KRW-D", 1_100.0);
    broker.set_price("KRW-NEW", 1_000.0);

    let report = ex.execute("KRW-NEW", Signal::Buy, &candles(&[1_000.0])).await.unwrap();
    assert!(report.is_some());
    assert_eq!(ex.ledger().total_open(), 5);
    assert!(!ex.ledger().is_open("KRW-C"));
    assert!(ex.ledger().is_open("KRW-NEW"));
    assert!(close_to(ex.risk().state().realized_pnl_pct, -20.0));

    let liquidation = store
        .recent_trades(10)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.reason.as_deref() == Some("liquidation"))
        .unwrap();
    assert_eq!(liquidation.market, "KRW-C");
}

#[tokio::test]
async fn refused_liquidation_aborts_the_buy() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    // 1,000 KRW positions are below the 5,000 minimum sell
    let cfg = EngineConfig { order_amount_pct: 0.1, min_order_amount: 1_000.0, ..engine_cfg(true) };
    let mut ex = executor(&broker, &store, cfg, relaxed_risk()).await;

    for m in ["KRW-A", "KRW-B", "KRW-C", "KRW-D", "KRW-E"] {
        broker.set_price(m, 1_000.0);
        ex.execute(m, Signal::Buy, &candles(&[1_000.0])).await.unwrap().unwrap();
    }
    let report = ex.execute("KRW-NEW", Signal::Buy, &candles(&[1_000.0])).await.unwrap();
    assert!(report.is_none());
    assert_eq!(ex.ledger().total_open(), 5);
    assert!(!ex.ledger().is_open("KRW-NEW"));
}

#[tokio::test]
async fn full_portfolio_with_default_risk_rotates_worst_position() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(true), RiskConfig::default()).await;

    for m in ["KRW-A", "KRW-B", "KRW-C", "KRW-D", "KRW-E"] {
        broker.set_price(m, 1_000.0);
        assert!(ex.execute(m, Signal::Buy, &candles(&[1_000.0])).await.unwrap().is_some(), "{m} rejected");
    }
    broker.set_price("KRW-C", 990.0);
    broker.set_price("KRW-D", 1_100.0);

    let report = ex.execute("KRW-NEW", Signal::Buy, &candles(&[1_000.0])).await.unwrap();
    assert!(report.is_some());
    assert_eq!(ex.ledger().total_open(), 5);
    assert!(!ex.ledger().is_open("KRW-C"));
    assert!(ex.ledger().is_open("KRW-NEW"));
    assert!(close_to(ex.risk().state().realized_pnl_pct, -1.0));
}

#[tokio::test]
async fn risk_rejection_on_full_portfolio_sells_nothing() {
    // 5,000 KRW free is below the 10,000 minimum balance
    let broker = Arc::new(PaperBroker::new(5_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    for (m, price) in [("KRW-A", 1_000.0), ("KRW-B", 1_000.0), ("KRW-C", 960.0), ("KRW-D", 1_000.0), ("KRW-E", 1_000.0)] {
        seed_open_position(&store, m, 1_000.0, 10.0).await;
        broker.set_price(m, price);
    }
    let mut ex = executor(&broker, &store, engine_cfg(true), relaxed_risk()).await;

    let report = ex.execute("KRW-NEW", Signal::Buy, &candles(&[1_000.0])).await.unwrap();
    assert!(report.is_none());
    assert_eq!(ex.ledger().total_open(), 5);
    assert!(ex.ledger().is_open("KRW-C"));
    assert_eq!(ex.risk().state().realized_pnl_pct, 0.0);
    assert_eq!(store.get_open_positions(None).await.unwrap().len(), 5);
    assert!(store.recent_trades(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn liquidation_that_would_spend_daily_budget_is_not_taken() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    for m in ["KRW-A", "KRW-B", "KRW-C", "KRW-D", "KRW-E"] {
        seed_open_position(&store, m, 1_000.0, 10.0).await;
        broker.set_price(m, 1_000.0);
    }
    // -20% would blow through the default 3% daily loss limit
    broker.set_price("KRW-C", 800.0);
    let mut ex = executor(&broker, &store, engine_cfg(true), RiskConfig::default()).await;

    assert!(ex.execute("KRW-NEW", Signal::Buy, &candles(&[1_000.0])).await.unwrap().is_none());
    assert_eq!(ex.ledger().total_open(), 5);
    assert!(ex.ledger().is_open("KRW-C"));
    assert_eq!(ex.risk().state().realized_pnl_pct, 0.0);
}

#[tokio::test]
async fn daily_loss_limit_blocks_further_entries() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let risk = RiskConfig { max_daily_loss_pct: 3.0, max_open_positions: 10, ..RiskConfig::default() };
    let mut ex = executor(&broker, &store, engine_cfg(true), risk).await;

    ex.execute("KRW-BTC", Signal::Buy, &candles(&[10_000.0])).await.unwrap().unwrap();
    let sell = ex.execute("KRW-BTC", Signal::Sell, &candles(&[9_000.0])).await.unwrap().unwrap();
    assert!(close_to(sell.pnl_pct.unwrap(), -10.0));

    assert!(ex.execute("KRW-ETH", Signal::Buy, &candles(&[2_000.0])).await.unwrap().is_none());
    assert!(!ex.ledger().is_open("KRW-ETH"));
}

#[tokio::test]
async fn sizer_stake_respects_minimum_order() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let ex = executor(&broker, &store, engine_cfg(true), relaxed_risk())
        .await
        .with_sizer(PositionSizer { max_position_pct: 5.0 });
    let (amount, balance) = ex.determine_order_amount().await.unwrap();
    assert!(close_to(amount, 50_000.0));
    assert_eq!(balance, Some(1_000_000.0));

    broker.set_balance("KRW", 100_000.0);
    let (amount, _) = ex.determine_order_amount().await.unwrap();
    assert!(close_to(amount, 6_000.0));
}

// ---------------------------------------------------------------------------
// Escape
// ---------------------------------------------------------------------------

async fn undersized_position(krw: f64) -> (Arc<PaperBroker>, Arc<MemoryTradeStore>, OrderExecutor) {
    let broker = Arc::new(PaperBroker::new(krw));
    broker.set_balance("BTC", 0.5);
    broker.set_price("KRW-BTC", 8_000.0);
    let store = Arc::new(MemoryTradeStore::new());
    seed_open_position(&store, "KRW-BTC", 10_000.0, 0.5).await;
    let ex = executor(&broker, &store, engine_cfg(false), relaxed_risk()).await;
    (broker, store, ex)
}

#[tokio::test]
async fn escape_blends_then_sells_everything() {
    let (broker, store, mut ex) = undersized_position(6_000.0).await;

    let report = ex.execute("KRW-BTC", Signal::Sell, &candles(&[8_000.0])).await.unwrap().unwrap();
    let escape = report.escape.unwrap();
    assert!(close_to(escape.amount, 5_000.0));
    assert!(close_to(escape.volume, 0.625));
    assert!(close_to(report.volume, 1.125));
    assert!(close_to(report.pnl_pct.unwrap(), -10.0));

    let placed = broker.placed_orders();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[0].side, Side::Buy);
    assert_eq!(placed[1].side, Side::Sell);
    assert!(close_to(broker.balance("BTC"), 0.0));
    assert!(close_to(broker.balance("KRW"), 1_000.0 + 9_000.0));
    assert!(!ex.ledger().is_open("KRW-BTC"));
    assert!(store.get_open_positions(None).await.unwrap().is_empty());
    assert!(store.recent_trades(10).await.unwrap().iter().any(|t| t.reason.as_deref() == Some("escape")));
}

#[tokio::test]
async fn escape_refused_when_krw_short() {
    let (broker, _store, mut ex) = undersized_position(4_999.0).await;

    assert!(ex.execute("KRW-BTC", Signal::Sell, &candles(&[8_000.0])).await.unwrap().is_none());
    assert!(broker.placed_orders().is_empty());
    let p = ex.ledger().get("KRW-BTC").unwrap();
    assert_eq!(p.entry_volume, 0.5);
    assert_eq!(p.entry_price, 10_000.0);
}

#[tokio::test]
async fn escape_allowed_at_exact_minimum() {
    let (broker, _store, mut ex) = undersized_position(5_000.0).await;

    let outcome = ex.escape("KRW-BTC", 8_000.0).await.unwrap();
    match outcome {
        EscapeOutcome::Blended { position, .. } => {
            assert!(close_to(position.entry_volume, 1.125));
            assert!(close_to(position.entry_amount, 10_000.0));
        }
        other => panic!("expected blend, got {other:?}"),
    }
    assert!(close_to(broker.balance("KRW"), 0.0));
}

// ---------------------------------------------------------------------------
// Live plumbing: fills, failures, reconcile, recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_buy_waits_for_delayed_fill() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0).with_fill_delay(2));
    broker.set_price("KRW-BTC", 50_000.0);
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(false), relaxed_risk()).await;

    let report = ex.execute("KRW-BTC", Signal::Buy, &candles(&[49_000.0])).await.unwrap().unwrap();
    assert_eq!(report.mode, ExecMode::Live);
    assert!(report.order_id.is_some());
    // venue filled at its own price, not the candle close
    assert_eq!(report.price, 50_000.0);
    assert_eq!(ex.ledger().get("KRW-BTC").unwrap().entry_price, 50_000.0);
    assert!(broker.balance("BTC") > 0.0);
}

#[tokio::test]
async fn broker_failure_leaves_no_partial_state() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_price("KRW-BTC", 50_000.0);
    broker.fail_orders(Some("maintenance"));
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(false), relaxed_risk()).await;

    let err = ex.execute("KRW-BTC", Signal::Buy, &candles(&[50_000.0])).await.unwrap_err();
    assert!(matches!(err, ExecError::Broker(_)));
    assert!(!ex.ledger().is_open("KRW-BTC"));
    assert!(ex.risk().state().open_positions.is_empty());
    assert!(store.recent_trades(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn portfolio_status_reconciles_orphans_in_live_mode() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.set_price("KRW-BTC", 10_000.0);
    broker.set_price("KRW-ETH", 1_000.0);
    broker.set_balance("ETH", 3.0);
    let store = Arc::new(MemoryTradeStore::new());
    seed_open_position(&store, "KRW-BTC", 10_000.0, 1.0).await;
    seed_open_position(&store, "KRW-ETH", 1_000.0, 3.0).await;
    let mut ex = executor(&broker, &store, engine_cfg(false), relaxed_risk()).await;
    assert_eq!(ex.risk().state().open_positions.len(), 2);

    let snapshot = ex.get_portfolio_status().await.unwrap();
    assert_eq!(snapshot.total_open, 1);
    assert_eq!(snapshot.positions[0].position.market, "KRW-ETH");
    assert_eq!(ex.risk().state().open_positions.len(), 1);
    assert_eq!(ex.risk().state().realized_pnl_pct, 0.0);
    assert_eq!(store.get_open_positions(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn startup_recovers_newest_position_per_market() {
    let broker = Arc::new(PaperBroker::new(100_000.0));
    let store = Arc::new(MemoryTradeStore::new());
    let older = Position::open("KRW-BTC", "test", Fill::for_volume(9_000.0, 1.0), Utc::now() - chrono::Duration::minutes(5));
    store.save_position(&older).await.unwrap();
    seed_open_position(&store, "KRW-BTC", 10_000.0, 1.0).await;
    seed_open_position(&store, "KRW-ETH", 1_000.0, 1.0).await;

    let ex = executor(&broker, &store, engine_cfg(true), relaxed_risk()).await;
    assert_eq!(ex.ledger().total_open(), 2);
    assert_eq!(ex.ledger().get("KRW-BTC").unwrap().entry_price, 10_000.0);
}

#[tokio::test]
async fn force_exit_sells_holdings_and_books_pnl() {
    let broker = Arc::new(PaperBroker::new(0.0));
    broker.set_price("KRW-BTC", 11_000.0);
    broker.set_balance("BTC", 1.0);
    let store = Arc::new(MemoryTradeStore::new());
    seed_open_position(&store, "KRW-BTC", 10_000.0, 1.0).await;
    let mut ex = executor(&broker, &store, engine_cfg(false), relaxed_risk()).await;

    let report = ex.force_exit_all().await.unwrap();
    assert_eq!(report.sold(), 1);
    assert!(close_to(ex.risk().state().realized_pnl_pct, 10.0));
    assert_eq!(broker.balance("KRW"), 11_000.0);
    assert_eq!(ex.ledger().total_open(), 0);
}

#[tokio::test]
async fn force_exit_reports_each_holding_independently() {
    let broker = Arc::new(PaperBroker::new(20_000.0));
    broker.set_price("KRW-ETH", 4_000_000.0);
    broker.set_balance("ETH", 0.01);
    broker.set_price("KRW-XRP", 700.0);
    broker.set_balance("XRP", 5.0);
    let store = Arc::new(MemoryTradeStore::new());
    let mut ex = executor(&broker, &store, engine_cfg(false), relaxed_risk()).await;

    let report = ex.force_exit_all().await.unwrap();
    assert_eq!(report.entries.len(), 2);
    let eth = report.entries.iter().find(|e| e.market == "KRW-ETH").unwrap();
    let xrp = report.entries.iter().find(|e| e.market == "KRW-XRP").unwrap();
    assert!(matches!(eth.outcome, ExitOutcome::Sold { .. }));
    match &xrp.outcome {
        ExitOutcome::Skipped { reason } => assert!(reason.contains("below minimum")),
        other => panic!("expected skip, got {other:?}"),
    }
    assert_eq!(broker.balance("XRP"), 5.0);
    assert_eq!(broker.balance("ETH"), 0.0);
}

// ---------------------------------------------------------------------------
// Execution loop
// ---------------------------------------------------------------------------

/// Replays a fixed list of signals, then holds.
struct Scripted(VecDeque<Signal>);

#[async_trait]
impl SignalSource for Scripted {
    fn name(&self) -> &str { "scripted" }

    async fn evaluate(&mut self, _market: &str, _candles: &[Candle]) -> Signal {
        self.0.pop_front().unwrap_or(Signal::Hold)
    }
}

async fn engine(broker: &Arc<PaperBroker>, signals: &[Signal], poll: Duration) -> ExecutionLoop {
    let store = Arc::new(MemoryTradeStore::new());
    let cfg = EngineConfig { poll_interval: poll, ..engine_cfg(true) };
    let ex = executor(broker, &store, cfg, relaxed_risk()).await;
    ExecutionLoop::new(ex, Box::new(Scripted(signals.iter().copied().collect())))
}

#[tokio::test]
async fn run_once_updates_status() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_candles("KRW-BTC", candles(&[100.0, 101.0, 102.0]));
    let engine = engine(&broker, &[Signal::Buy], Duration::from_secs(60)).await;

    let report = engine.run_once().await.unwrap().unwrap();
    assert_eq!(report.side, Side::Buy);
    let status = engine.status();
    assert_eq!(status.last_signal, Some(Signal::Buy));
    assert!(status.last_run_at.is_some());
    assert!(status.last_error.is_none());
    assert_eq!(status.open_positions.len(), 1);
    assert!(!status.running);
}

#[tokio::test]
async fn failed_cycle_is_recorded_and_loop_keeps_going() {
    // no candles for KRW-BTC yet -> every cycle fails
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    let mut engine = engine(&broker, &[], Duration::from_millis(5)).await;

    assert!(engine.run_once().await.is_err());
    assert!(engine.status().last_error.is_some());

    assert!(engine.start_async());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(engine.is_running());

    broker.set_candles("KRW-BTC", candles(&[100.0]));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(engine.status().last_error.is_none());

    engine.stop(true, Some(Duration::from_secs(2))).await;
    assert!(!engine.is_running());
}

#[tokio::test]
async fn start_is_idempotent_and_stop_interrupts_sleep() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_candles("KRW-BTC", candles(&[100.0]));
    let mut engine = engine(&broker, &[], Duration::from_secs(3_600)).await;
    let mut updates = engine.subscribe();

    assert!(engine.start_async());
    assert!(!engine.start_async());
    assert!(engine.is_running());

    // first cycle published
    tokio::time::timeout(Duration::from_secs(2), updates.changed()).await.unwrap().unwrap();
    assert!(updates.borrow().last_run_at.is_some());

    // worker is now parked in an hour-long sleep; stop must wake it
    let started = std::time::Instant::now();
    engine.stop(true, Some(Duration::from_secs(2))).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!engine.is_running());
    assert!(!engine.status().running);

    // restart after stop works
    assert!(engine.start_async());
    engine.stop(true, Some(Duration::from_secs(2))).await;
}

#[tokio::test]
async fn loop_force_exit_and_status_share_the_engine() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_candles("KRW-BTC", candles(&[100_000.0]));
    let engine = engine(&broker, &[Signal::Buy], Duration::from_secs(60)).await;

    engine.run_once().await.unwrap();
    let snap = engine.get_portfolio_status().await.unwrap();
    assert_eq!(snap.total_open, 1);

    let report = engine.force_exit_all().await.unwrap();
    assert_eq!(report.sold(), 1);
    assert!(engine.status().open_positions.is_empty());
}

#[tokio::test]
async fn portfolio_snapshot_is_published_without_locking() {
    let broker = Arc::new(PaperBroker::new(1_000_000.0));
    broker.set_candles("KRW-BTC", candles(&[100_000.0]));
    broker.set_price("KRW-BTC", 110_000.0);
    let engine = engine(&broker, &[Signal::Buy], Duration::from_secs(60)).await;
    assert_eq!(engine.portfolio_snapshot().total_open, 0);

    engine.run_once().await.unwrap().unwrap();
    let snap = engine.portfolio_snapshot();
    assert_eq!(snap.total_open, 1);
    assert_eq!(snap.max_positions, 5);
    let worst = snap.worst.unwrap();
    assert_eq!(worst.position.market, "KRW-BTC");
    assert_eq!(worst.current_price, 110_000.0);
    assert_eq!(engine.status().portfolio.total_open, 1);
}
