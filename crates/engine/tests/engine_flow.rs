use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use common::{
    AssetBalance, BotStatus, CanonicalMarket, MarketKind, PositionStatus, Side, SignalData,
    TradeMode, TradeSignal,
};
use engine::{BlockReason, Execution, ExecutionEngine};
use exchange::{ExchangeHub, MockExchange};
use notify::NotificationBus;
use store::{AppConfig, BotInstance, Store};

const EPS: f64 = 1e-6;

async fn setup() -> (Arc<ExecutionEngine>, Store, Arc<ExchangeHub>, Arc<NotificationBus>) {
    let store = Store::in_memory().await.unwrap();
    let hub = Arc::new(ExchangeHub::new(Arc::new(store.clone())));
    let bus = Arc::new(NotificationBus::new());
    let engine = Arc::new(ExecutionEngine::new(store.clone(), hub.clone(), bus.clone()));
    (engine, store, hub, bus)
}

fn simulated_bot(user_id: &str, amount: f64) -> BotInstance {
    BotInstance {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        name: "BTC swing".into(),
        symbol: "BTC/USDT".into(),
        timeframe: "15m".into(),
        market_type: MarketKind::Spot,
        exchange_id: "binance".into(),
        strategy_name: "RsiReversion".into(),
        mode: TradeMode::Simulated,
        status: BotStatus::Active,
        amount,
        side: None,
        position_qty: 0.0,
        position_avg_price: 0.0,
        wallet_allocated: 0.0,
        wallet_available: 0.0,
        wallet_realized_pnl: 0.0,
        total_pnl: 0.0,
        last_candle_ts: None,
        last_execution: None,
        created_at: Utc::now(),
    }
}

async fn balance(store: &Store, user: &str) -> f64 {
    store
        .virtual_balance(user, CanonicalMarket::Cex, "USDT")
        .await
        .unwrap()
        .map(|row| row.amount)
        .unwrap_or(0.0)
}

#[tokio::test]
async fn accumulation_then_flip_keeps_the_books_straight() {
    let (engine, store, _hub, _bus) = setup().await;
    let bot = simulated_bot("u1", 100.0);
    store.create_bot(&bot).await.unwrap();
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
        .await
        .unwrap();

    // OPEN long at 100
    let open = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    assert!(open.is_executed());
    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, Some(Side::Buy));
    assert!((loaded.position_qty - 1.0).abs() < EPS);
    assert!((loaded.position_avg_price - 100.0).abs() < EPS);
    assert!((balance(&store, "u1").await - 900.0).abs() < EPS);

    // DCA long at 90: qty = 1 + 100/90, avg = 200 / qty
    let dca = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 90.0))
        .await
        .unwrap();
    assert!(dca.is_executed());
    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    let expected_qty = 1.0 + 100.0 / 90.0;
    let expected_avg = 200.0 / expected_qty;
    assert!((loaded.position_qty - expected_qty).abs() < EPS);
    assert!((loaded.position_avg_price - expected_avg).abs() < 1e-4);
    assert!((balance(&store, "u1").await - 800.0).abs() < EPS);

    // FLIP to short at 110: realized = (110 - avg) * qty, alert needed? No —
    // the position is in profit, the guard allows it.
    let flip = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Sell, 110.0))
        .await
        .unwrap();
    let Execution::Executed(report) = flip else {
        panic!("flip should execute")
    };
    let expected_realized = (110.0 - expected_avg) * expected_qty;
    assert!(
        (report.realized_pnl - expected_realized).abs() < 1e-4,
        "realized {} vs expected {expected_realized}",
        report.realized_pnl
    );

    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, Some(Side::Sell));
    assert!((loaded.position_qty - 100.0 / 110.0).abs() < EPS);
    assert!((loaded.position_avg_price - 110.0).abs() < EPS);
    assert!((loaded.total_pnl - expected_realized).abs() < 1e-4);

    // Cash: 1000 - 100 - 100 + (200 + realized) - 100
    let expected_balance = 900.0 + expected_realized;
    let cash = balance(&store, "u1").await;
    assert!((cash - expected_balance).abs() < 1e-4, "cash {cash}");

    // Conservation: cash + invested == initial + realized
    let invested = loaded.position_qty * loaded.position_avg_price;
    assert!((cash + invested - (1000.0 + expected_realized)).abs() < 1e-4);

    // Audit: three trades in execution order, old position closed.
    let trades = store.trades_for_bot(&bot.id).await.unwrap();
    assert_eq!(trades.len(), 3);
    assert_eq!(
        trades.iter().map(|t| t.side).collect::<Vec<_>>(),
        vec![Side::Buy, Side::Buy, Side::Sell]
    );

    let positions = store.positions_for_bot(&bot.id).await.unwrap();
    let closed: Vec<_> = positions
        .iter()
        .filter(|p| p.status == PositionStatus::Closed)
        .collect();
    assert_eq!(closed.len(), 1);
    assert!((closed[0].final_pnl.unwrap() - expected_realized).abs() < 1e-4);
}

#[tokio::test]
async fn profit_guard_blocks_losing_flip_but_not_alerts() {
    let (engine, store, _hub, _bus) = setup().await;
    let bot = simulated_bot("u1", 100.0);
    store.create_bot(&bot).await.unwrap();
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
        .await
        .unwrap();

    engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    let balance_before = balance(&store, "u1").await;
    let trades_before = store.trades_for_bot(&bot.id).await.unwrap().len();

    // -5% flip on an automatic signal: blocked, nothing written.
    let blocked = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Sell, 95.0))
        .await
        .unwrap();
    assert!(
        matches!(blocked, Execution::Blocked { reason: BlockReason::ProfitGuard }),
        "expected profit guard, got {blocked:?}"
    );
    assert_eq!(store.trades_for_bot(&bot.id).await.unwrap().len(), trades_before);
    assert!((balance(&store, "u1").await - balance_before).abs() < EPS);
    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, Some(Side::Buy));

    // Same signal as a trusted alert executes the flip.
    let flipped = engine
        .process_signal(&bot.id, SignalData::alert(TradeSignal::Sell, 95.0))
        .await
        .unwrap();
    assert!(flipped.is_executed());
    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, Some(Side::Sell));
}

#[tokio::test]
async fn profit_guard_is_symmetric_for_short_positions() {
    let (engine, store, _hub, _bus) = setup().await;
    let bot = simulated_bot("u1", 100.0);
    store.create_bot(&bot).await.unwrap();
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
        .await
        .unwrap();

    // Open short at 100; price rising to 101 puts the short -1% under water.
    engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Sell, 100.0))
        .await
        .unwrap();
    let blocked = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 101.0))
        .await
        .unwrap();
    assert!(matches!(
        blocked,
        Execution::Blocked { reason: BlockReason::ProfitGuard }
    ));

    // A profitable reversal (price fell) passes the guard on the same side.
    let flipped = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 98.0))
        .await
        .unwrap();
    assert!(flipped.is_executed());
}

#[tokio::test]
async fn flip_closure_law_realizes_spread_times_qty() {
    let (engine, store, _hub, _bus) = setup().await;
    let bot = simulated_bot("u1", 200.0);
    store.create_bot(&bot).await.unwrap();
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 10_000.0)
        .await
        .unwrap();

    engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 50.0))
        .await
        .unwrap();
    let q = 200.0 / 50.0;

    let flip = engine
        .process_signal(&bot.id, SignalData::alert(TradeSignal::Sell, 60.0))
        .await
        .unwrap();
    let Execution::Executed(report) = flip else { panic!() };
    assert!((report.realized_pnl - (60.0 - 50.0) * q).abs() < EPS);

    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, Some(Side::Sell));
    assert!((loaded.position_qty - 200.0 / 60.0).abs() < EPS);
    assert!(loaded.position_invariant_holds());
}

#[tokio::test]
async fn insufficient_balance_blocks_without_side_effects() {
    let (engine, store, _hub, _bus) = setup().await;
    let bot = simulated_bot("u1", 100.0);
    store.create_bot(&bot).await.unwrap();
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 50.0)
        .await
        .unwrap();

    let blocked = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    assert!(matches!(
        blocked,
        Execution::Blocked { reason: BlockReason::InsufficientBalance }
    ));
    assert!(store.trades_for_bot(&bot.id).await.unwrap().is_empty());
    assert!((balance(&store, "u1").await - 50.0).abs() < EPS);
}

#[tokio::test]
async fn inactive_bot_and_wait_signal_are_refused() {
    let (engine, store, _hub, _bus) = setup().await;
    let mut bot = simulated_bot("u1", 100.0);
    bot.status = BotStatus::Paused;
    store.create_bot(&bot).await.unwrap();

    let blocked = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    assert!(matches!(
        blocked,
        Execution::Blocked { reason: BlockReason::BotInactive }
    ));

    store.set_bot_status(&bot.id, BotStatus::Active).await.unwrap();
    let blocked = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Wait, 100.0))
        .await
        .unwrap();
    assert!(matches!(
        blocked,
        Execution::Blocked { reason: BlockReason::NoActionableSignal }
    ));
}

#[tokio::test]
async fn unknown_symbol_is_refused() {
    let (engine, store, _hub, _bus) = setup().await;
    let mut bot = simulated_bot("u1", 100.0);
    bot.symbol = "GIBBERISH".into();
    store.create_bot(&bot).await.unwrap();

    let blocked = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    assert!(matches!(
        blocked,
        Execution::Blocked { reason: BlockReason::UnknownSymbol }
    ));
}

#[tokio::test]
async fn manual_close_returns_to_idle_and_credits_pnl() {
    let (engine, store, _hub, _bus) = setup().await;
    let bot = simulated_bot("u1", 100.0);
    store.create_bot(&bot).await.unwrap();
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
        .await
        .unwrap();

    engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    let closed = engine.manual_close("u1", &bot.id, 105.0).await.unwrap();
    assert!(closed.is_executed());

    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, None);
    assert_eq!(loaded.position_qty, 0.0);
    assert!(loaded.position_invariant_holds());
    // 1000 - 100 + (100 + 5)
    assert!((balance(&store, "u1").await - 1005.0).abs() < EPS);

    // Ownership is enforced.
    let err = engine.manual_close("intruder", &bot.id, 100.0).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn partial_close_keeps_remaining_position() {
    let (engine, store, _hub, _bus) = setup().await;
    let bot = simulated_bot("u1", 100.0);
    store.create_bot(&bot).await.unwrap();
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
        .await
        .unwrap();

    engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    engine
        .close_fraction("u1", &bot.id, 50.0, 110.0)
        .await
        .unwrap();

    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, Some(Side::Buy));
    assert!((loaded.position_qty - 0.5).abs() < EPS);
    // 900 + (0.5 * 100 + 0.5 * 10)
    assert!((balance(&store, "u1").await - 955.0).abs() < EPS);
}

#[tokio::test]
async fn real_mode_flip_submits_close_then_open() {
    let (engine, store, hub, _bus) = setup().await;
    let mut bot = simulated_bot("u1", 100.0);
    bot.mode = TradeMode::Real;
    bot.exchange_id = "mock".into();
    store.create_bot(&bot).await.unwrap();

    let mock = Arc::new(MockExchange::new("mock"));
    mock.set_balances(vec![AssetBalance {
        asset: "USDT".into(),
        free: 10_000.0,
        used: 0.0,
        total: 10_000.0,
    }])
    .await;
    mock.set_price("BTC/USDT", 100.0).await;
    hub.register_for_user("u1", "mock", MarketKind::Spot, mock.clone())
        .await;

    engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();

    mock.set_price("BTC/USDT", 110.0).await;
    let flip = engine
        .process_signal(&bot.id, SignalData::alert(TradeSignal::Sell, 110.0))
        .await
        .unwrap();
    let Execution::Executed(report) = flip else { panic!() };
    assert!((report.realized_pnl - 10.0).abs() < EPS);

    let orders = mock.recorded_orders().await;
    assert_eq!(orders.len(), 3);
    assert_eq!(orders[0].side, Side::Buy); // open long
    assert_eq!(orders[1].side, Side::Sell); // flip close
    assert_eq!(orders[2].side, Side::Sell); // open short

    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.side, Some(Side::Sell));
    assert!((loaded.total_pnl - 10.0).abs() < EPS);
}

#[tokio::test]
async fn real_mode_order_failure_blocks_with_reason() {
    let (engine, store, hub, _bus) = setup().await;
    let mut bot = simulated_bot("u1", 100.0);
    bot.mode = TradeMode::Real;
    bot.exchange_id = "mock".into();
    store.create_bot(&bot).await.unwrap();

    let mock = Arc::new(MockExchange::new("mock"));
    mock.set_balances(vec![AssetBalance {
        asset: "USDT".into(),
        free: 10_000.0,
        used: 0.0,
        total: 10_000.0,
    }])
    .await;
    // No price seeded: the market order cannot fill.
    hub.register_for_user("u1", "mock", MarketKind::Spot, mock.clone())
        .await;

    let result = engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    assert!(matches!(
        result,
        Execution::Blocked { reason: BlockReason::OrderFailed(_) }
    ));
    assert!(store.trades_for_bot(&bot.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn sub_wallet_allocation_and_spending_stay_isolated() {
    let (engine, store, _hub, _bus) = setup().await;
    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
        .await
        .unwrap();

    let mut config = AppConfig::default();
    config.bot_wallet_policy.enabled = true;
    config.bot_wallet_policy.per_bot_allocation_pct = 20.0;
    config.bot_wallet_policy.min_allocation_usdt = 50.0;
    config.bot_wallet_policy.max_allocation_usdt = 500.0;

    let bot = engine
        .activate_bot(simulated_bot("u1", 100.0), &config)
        .await
        .unwrap();
    assert!((bot.wallet_allocated - 200.0).abs() < EPS);
    assert!((bot.wallet_available - 200.0).abs() < EPS);
    assert!((balance(&store, "u1").await - 800.0).abs() < EPS);

    // Spending comes out of the sub-wallet, not the global balance.
    engine
        .process_signal(&bot.id, SignalData::auto(TradeSignal::Buy, 100.0))
        .await
        .unwrap();
    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert!((loaded.wallet_available - 100.0).abs() < EPS);
    assert!((balance(&store, "u1").await - 800.0).abs() < EPS);

    // Closing in profit returns the principal to the sub-wallet and books
    // the realized PnL separately.
    engine.manual_close("u1", &bot.id, 110.0).await.unwrap();
    let loaded = store.bot(&bot.id).await.unwrap().unwrap();
    assert!((loaded.wallet_available - 200.0).abs() < EPS);
    assert!((loaded.wallet_realized_pnl - 10.0).abs() < EPS);

    // Deleting the bot returns wallet funds and PnL to the global balance.
    engine.delete_bot("u1", &bot.id).await.unwrap();
    assert!((balance(&store, "u1").await - 1010.0).abs() < EPS);
    assert!(store.bot(&bot.id).await.unwrap().is_none());
}

#[tokio::test]
async fn activate_bot_enforces_limits() {
    let (engine, _store, _hub, _bus) = setup().await;

    let mut config = AppConfig::default();
    config.investment_limits.cex_max_amount = Some(150.0);

    let err = engine
        .activate_bot(simulated_bot("u1", 500.0), &config)
        .await
        .unwrap_err();
    assert!(matches!(err, common::Error::Validation(_)));

    config.bot_strategy.max_active_bots = 1;
    engine
        .activate_bot(simulated_bot("u1", 100.0), &config)
        .await
        .unwrap();
    let err = engine
        .activate_bot(simulated_bot("u1", 100.0), &config)
        .await
        .unwrap_err();
    assert!(matches!(err, common::Error::Validation(_)));
}
