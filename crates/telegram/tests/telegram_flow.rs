use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use common::{
    CanonicalMarket, Direction, MarketKind, Result, SignalStatus, TgBotStatus, TradeItemKind,
    TradeItemStatus, TradeMode,
};
use engine::ExecutionEngine;
use exchange::{ExchangeHub, MockExchange};
use notify::NotificationBus;
use store::{Store, TakeProfitLevel, TelegramBot, TgBotConfig};
use stream::MarketStreamService;
use telegram_sig::{
    AnalysisDecision, ExpirySweeper, SignalAnalysis, SignalAnalyst, SignalOrchestrator,
    TickOutcome, TpTarget, TradePlan,
};

const EPS: f64 = 1e-6;

/// Scripted analyst: fixed analyses for messages, fixed raw JSON for expiry.
struct FakeAnalyst {
    analyses: Mutex<Vec<Vec<SignalAnalysis>>>,
    expiry_response: String,
}

impl FakeAnalyst {
    fn new(batches: Vec<Vec<SignalAnalysis>>, expiry_response: &str) -> Arc<Self> {
        Arc::new(Self {
            analyses: Mutex::new(batches),
            expiry_response: expiry_response.to_string(),
        })
    }
}

#[async_trait]
impl SignalAnalyst for FakeAnalyst {
    async fn analyze_signal(&self, _user_id: &str, _raw: &str) -> Result<Vec<SignalAnalysis>> {
        let mut batches = self.analyses.lock().await;
        if batches.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(batches.remove(0))
        }
    }

    async fn decide_expiry(&self, _bot: &TelegramBot, _price: f64) -> Result<String> {
        Ok(self.expiry_response.clone())
    }
}

fn long_analysis(symbol: &str, entry: f64, sl: f64, tps: &[(f64, f64)]) -> SignalAnalysis {
    SignalAnalysis {
        decision: AnalysisDecision::Approved,
        symbol: symbol.to_string(),
        market_type: MarketKind::Spot,
        direction: Direction::Long,
        plan: TradePlan {
            entry_price: entry,
            stop_loss: sl,
            take_profits: tps
                .iter()
                .map(|&(price, percent)| TpTarget {
                    price,
                    percent,
                    qty: None,
                })
                .collect(),
            leverage: None,
            investment: Some(100.0),
            valid_for_minutes: None,
            exchange_id: Some("mock".into()),
        },
        confidence: 0.9,
        is_safe: true,
        reasoning: Some("test".into()),
    }
}

struct Harness {
    store: Store,
    orchestrator: Arc<SignalOrchestrator>,
    #[allow(dead_code)]
    mock: Arc<MockExchange>,
}

async fn harness(analyst: Arc<FakeAnalyst>) -> Harness {
    let store = Store::in_memory().await.unwrap();
    let hub = Arc::new(ExchangeHub::new(Arc::new(store.clone())));
    let mock = Arc::new(MockExchange::new("mock"));
    mock.list_market("BTC/USDT").await;
    mock.list_market("ETH/USDT").await;
    hub.register_public("mock", MarketKind::Spot, mock.clone())
        .await;

    let bus = Arc::new(NotificationBus::new());
    let engine = Arc::new(ExecutionEngine::new(store.clone(), hub.clone(), bus.clone()));
    let streams = Arc::new(MarketStreamService::new(hub.clone()));
    let orchestrator =
        SignalOrchestrator::new(store.clone(), engine, streams, bus, analyst, hub);

    store
        .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
        .await
        .unwrap();

    Harness {
        store,
        orchestrator,
        mock,
    }
}

async fn only_live_bot(store: &Store) -> TelegramBot {
    let bots = store.live_tg_bots().await.unwrap();
    assert_eq!(bots.len(), 1);
    bots.into_iter().next().unwrap()
}

#[tokio::test]
async fn tp_ladder_runs_to_completion() {
    let analyst = FakeAnalyst::new(
        vec![vec![long_analysis(
            "BTC/USDT",
            100.0,
            95.0,
            &[(101.0, 50.0), (102.0, 50.0)],
        )]],
        "{}",
    );
    let h = harness(analyst).await;

    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "LONG BTC entry 100")
        .await
        .unwrap();

    let bot = only_live_bot(&h.store).await;
    assert_eq!(bot.status, TgBotStatus::WaitingEntry);

    // 99: below entry, still waiting.
    let outcome = h.orchestrator.handle_price_tick(&bot.id, 99.0).await.unwrap();
    assert_eq!(outcome, TickOutcome::Waiting);

    // 100.5: entry fills, position opens via the engine at the observed price.
    let outcome = h.orchestrator.handle_price_tick(&bot.id, 100.5).await.unwrap();
    assert_eq!(outcome, TickOutcome::Entered);
    let loaded = h.store.tg_bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TgBotStatus::Active);
    assert_eq!(loaded.actual_entry_price, Some(100.5));
    let companion = h.store.bot(&bot.id).await.unwrap().unwrap();
    let opened_qty = 100.0 / 100.5;
    assert!((companion.position_qty - opened_qty).abs() < EPS);

    // 101.3: first TP (50%) hits.
    let outcome = h.orchestrator.handle_price_tick(&bot.id, 101.3).await.unwrap();
    assert_eq!(outcome, TickOutcome::Monitoring);
    let companion = h.store.bot(&bot.id).await.unwrap().unwrap();
    assert!((companion.position_qty - opened_qty / 2.0).abs() < EPS);
    let loaded = h.store.tg_bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.config.take_profits[0].status, TradeItemStatus::Hit);
    assert_eq!(loaded.config.take_profits[1].status, TradeItemStatus::Pending);

    // 101.8: between the two TP rungs, nothing new fires.
    let outcome = h.orchestrator.handle_price_tick(&bot.id, 101.8).await.unwrap();
    assert_eq!(outcome, TickOutcome::Monitoring);

    // 102.1: second TP hits and the bot closes.
    let outcome = h.orchestrator.handle_price_tick(&bot.id, 102.1).await.unwrap();
    assert_eq!(outcome, TickOutcome::Closed { reason: "all_tps_hit".into() });

    let loaded = h.store.tg_bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TgBotStatus::Closed);
    assert_eq!(loaded.exit_reason.as_deref(), Some("all_tps_hit"));

    let companion = h.store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(companion.position_qty, 0.0);
    assert_eq!(companion.side, None);

    // Entry + two partial closes.
    let trades = h.store.trades_for_bot(&bot.id).await.unwrap();
    assert_eq!(trades.len(), 3);

    // Books: 1000 - 100 invested, both halves returned with profit.
    let expected_pnl = (101.3 - 100.5) * opened_qty / 2.0 + (102.1 - 100.5) * opened_qty / 2.0;
    let balance = h
        .store
        .virtual_balance("u1", CanonicalMarket::Cex, "USDT")
        .await
        .unwrap()
        .unwrap()
        .amount;
    assert!((balance - (1000.0 + expected_pnl)).abs() < 1e-4, "balance {balance}");
}

#[tokio::test]
async fn stop_loss_closes_the_position() {
    let analyst = FakeAnalyst::new(
        vec![vec![long_analysis("BTC/USDT", 100.0, 95.0, &[(110.0, 100.0)])]],
        "{}",
    );
    let h = harness(analyst).await;
    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "LONG BTC")
        .await
        .unwrap();
    let bot = only_live_bot(&h.store).await;

    h.orchestrator.handle_price_tick(&bot.id, 100.2).await.unwrap();
    let outcome = h.orchestrator.handle_price_tick(&bot.id, 94.5).await.unwrap();
    assert_eq!(outcome, TickOutcome::Closed { reason: "stop_loss".into() });

    let loaded = h.store.tg_bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TgBotStatus::Closed);
    assert_eq!(loaded.exit_reason.as_deref(), Some("stop_loss"));

    let companion = h.store.bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(companion.position_qty, 0.0);
    assert!(companion.total_pnl < 0.0);

    // All remaining items are cancelled or consumed.
    let items = h.store.trade_items(&bot.id).await.unwrap();
    assert!(items
        .iter()
        .all(|i| i.status != TradeItemStatus::Pending && i.status != TradeItemStatus::Active));
}

#[tokio::test]
async fn duplicate_pair_signal_is_rejected() {
    let analyst = FakeAnalyst::new(
        vec![
            vec![long_analysis("BTC/USDT", 100.0, 95.0, &[(110.0, 100.0)])],
            vec![long_analysis("BTC/USDT", 101.0, 96.0, &[(111.0, 100.0)])],
        ],
        "{}",
    );
    let h = harness(analyst).await;

    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "first")
        .await
        .unwrap();
    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "second")
        .await
        .unwrap();

    assert_eq!(h.store.count_live_tg_bots("u1").await.unwrap(), 1);
    let signals = h.store.signals_for_user("u1", 10).await.unwrap();
    assert!(signals.iter().any(|s| {
        s.status == SignalStatus::Rejected
            && s.execution_message
                .as_deref()
                .map(|m| m.contains("Duplicate"))
                .unwrap_or(false)
    }));
}

#[tokio::test]
async fn max_active_telegram_bots_is_enforced() {
    let analyst = FakeAnalyst::new(
        vec![
            vec![long_analysis("BTC/USDT", 100.0, 95.0, &[(110.0, 100.0)])],
            vec![long_analysis("ETH/USDT", 50.0, 45.0, &[(55.0, 100.0)])],
        ],
        "{}",
    );
    let h = harness(analyst).await;

    let mut config = store::AppConfig::default();
    config.bot_strategy.max_active_telegram_bots = 1;
    h.store.save_app_config("u1", &config).await.unwrap();

    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "first")
        .await
        .unwrap();
    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "second")
        .await
        .unwrap();

    assert_eq!(h.store.count_live_tg_bots("u1").await.unwrap(), 1);
    let signals = h.store.signals_for_user("u1", 10).await.unwrap();
    assert!(signals.iter().any(|s| {
        s.execution_message
            .as_deref()
            .map(|m| m.contains("Max active telegram bots"))
            .unwrap_or(false)
    }));
}

#[tokio::test]
async fn unsafe_analysis_is_rejected_unsafe() {
    let mut analysis = long_analysis("BTC/USDT", 100.0, 95.0, &[(110.0, 100.0)]);
    analysis.is_safe = false;
    let analyst = FakeAnalyst::new(vec![vec![analysis]], "{}");
    let h = harness(analyst).await;

    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "sketchy")
        .await
        .unwrap();

    assert_eq!(h.store.count_live_tg_bots("u1").await.unwrap(), 0);
    let signals = h.store.signals_for_user("u1", 10).await.unwrap();
    assert_eq!(signals[0].status, SignalStatus::RejectedUnsafe);
}

#[tokio::test]
async fn unsupported_symbol_is_rejected() {
    let analyst = FakeAnalyst::new(
        vec![vec![long_analysis("DOGE/USDT", 0.1, 0.09, &[(0.2, 100.0)])]],
        "{}",
    );
    let h = harness(analyst).await;
    // DOGE/USDT is not listed on the mock exchange.

    h.orchestrator
        .process_raw_signal("u1", "telegram_-1001", "DOGE moon")
        .await
        .unwrap();

    assert_eq!(h.store.count_live_tg_bots("u1").await.unwrap(), 0);
    let signals = h.store.signals_for_user("u1", 10).await.unwrap();
    assert!(signals[0]
        .execution_message
        .as_deref()
        .unwrap()
        .contains("not supported"));
}

fn expired_bot(user_id: &str, symbol: &str) -> TelegramBot {
    let now = Utc::now();
    TelegramBot {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        source: "telegram_-1001".into(),
        chat_id: Some("-1001".into()),
        symbol: symbol.to_string(),
        side: Direction::Long,
        market_type: MarketKind::Spot,
        exchange_id: "mock".into(),
        mode: TradeMode::Simulated,
        status: TgBotStatus::WaitingEntry,
        config: TgBotConfig {
            entry_price: 100.0,
            stop_loss: 95.0,
            take_profits: vec![TakeProfitLevel {
                price: 110.0,
                percent: 100.0,
                qty: None,
                status: TradeItemStatus::Pending,
            }],
            leverage: None,
            investment: Some(100.0),
        },
        actual_entry_price: None,
        current_price: None,
        pnl: 0.0,
        exit_price: None,
        exit_reason: None,
        expires_at: Some(now - Duration::minutes(2)),
        expiry_handled_at: None,
        executed_at: None,
        closed_at: None,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn expiry_update_decision_replaces_stop_loss() {
    let analyst = FakeAnalyst::new(
        vec![],
        r#"{"action":"update","reason":"still valid","newStopLoss":98.0}"#,
    );
    let h = harness(analyst.clone()).await;

    let bot = expired_bot("u1", "BTC/USDT");
    h.store.insert_tg_bot(&bot).await.unwrap();
    h.store
        .insert_trade_items(&[store::telegram::new_trade_item(
            &bot.id,
            "u1",
            TradeItemKind::Sl,
            0,
            95.0,
            None,
            TradeItemStatus::Active,
        )])
        .await
        .unwrap();

    let hub = Arc::new(ExchangeHub::new(Arc::new(h.store.clone())));
    let sweeper = ExpirySweeper::new(
        h.store.clone(),
        analyst,
        hub,
        Arc::new(NotificationBus::new()),
    );
    let handled = sweeper.sweep(20).await.unwrap();
    assert_eq!(handled, 1);

    let loaded = h.store.tg_bot(&bot.id).await.unwrap().unwrap();
    // Updated, not closed: the bot keeps waiting with the new stop.
    assert_eq!(loaded.status, TgBotStatus::WaitingEntry);
    assert_eq!(loaded.config.stop_loss, 98.0);
    assert!(loaded.expiry_handled_at.is_some());

    // Second sweep finds nothing to do.
    assert_eq!(sweeper.sweep(20).await.unwrap(), 0);
}

#[tokio::test]
async fn garbled_expiry_response_falls_back_to_close() {
    let analyst = FakeAnalyst::new(vec![], "not json at all");
    let h = harness(analyst.clone()).await;

    let bot = expired_bot("u1", "BTC/USDT");
    h.store.insert_tg_bot(&bot).await.unwrap();

    let hub = Arc::new(ExchangeHub::new(Arc::new(h.store.clone())));
    let sweeper = ExpirySweeper::new(
        h.store.clone(),
        analyst,
        hub,
        Arc::new(NotificationBus::new()),
    );
    sweeper.sweep(20).await.unwrap();

    let loaded = h.store.tg_bot(&bot.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TgBotStatus::Expired);
}
