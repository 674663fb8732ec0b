use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use common::{
    Direction, Error, Result, SignalData, SignalStatus, TgBotStatus, TradeItemKind,
    TradeItemStatus, TradeSignal,
};
use engine::ExecutionEngine;
use exchange::{normalize_symbol, ExchangeHub};
use notify::{NotificationBus, UserEvent};
use store::signals::SignalAnalysisUpdate;
use store::telegram::new_trade_item;
use store::{
    BotInstance, SignalRow, Store, TakeProfitLevel, TelegramBot, TelegramTradeItem, TgBotConfig,
};
use stream::MarketStreamService;

use crate::analyst::{AnalysisDecision, SignalAnalysis, SignalAnalyst};
use crate::workflow;

/// What one price tick did to a telegram bot. Returned for observability and
/// tests; the workflow only cares about the terminal variants.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Bot is gone or no longer live.
    Inactive,
    /// Still waiting for the entry trigger.
    Waiting,
    /// Entry filled on this tick.
    Entered,
    /// Active and monitored; possibly TPs hit on this tick.
    Monitoring,
    Closed {
        reason: String,
    },
}

/// Drives external signals end to end: persist, analyze, validate, create a
/// per-signal bot with its trade-item ladder, and run one workflow task per
/// live bot through `waiting_entry → active → closed|expired`.
pub struct SignalOrchestrator {
    store: Store,
    engine: Arc<ExecutionEngine>,
    streams: Arc<MarketStreamService>,
    bus: Arc<NotificationBus>,
    analyst: Arc<dyn SignalAnalyst>,
    hub: Arc<ExchangeHub>,
    pub(crate) workflows: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SignalOrchestrator {
    pub fn new(
        store: Store,
        engine: Arc<ExecutionEngine>,
        streams: Arc<MarketStreamService>,
        bus: Arc<NotificationBus>,
        analyst: Arc<dyn SignalAnalyst>,
        hub: Arc<ExchangeHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            streams,
            bus,
            analyst,
            hub,
            workflows: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn streams(&self) -> &MarketStreamService {
        &self.streams
    }

    /// Ingest one raw signal for one user. Every failure leaves a terminal
    /// `signals` row with a readable message; nothing is silently dropped.
    pub async fn process_raw_signal(
        self: &Arc<Self>,
        user_id: &str,
        source: &str,
        raw_text: &str,
    ) -> Result<()> {
        let config = self.store.app_config(user_id).await?;
        let signal = self.store.insert_signal(user_id, source, raw_text).await?;
        self.emit_signal(user_id, UserEvent::SignalNew, &signal).await;

        if !config.is_auto_enabled {
            self.store
                .set_signal_status(
                    &signal.id,
                    SignalStatus::Cancelled,
                    Some("Auto-processing disabled by user"),
                    None,
                )
                .await?;
            return Ok(());
        }

        let analyses = match self.analyst.analyze_signal(user_id, raw_text).await {
            Ok(analyses) => analyses,
            Err(e) => {
                error!(user = user_id, error = %e, "Signal analysis failed");
                self.store
                    .set_signal_status(&signal.id, SignalStatus::Failed, Some(&e.to_string()), None)
                    .await?;
                return Ok(());
            }
        };

        for (index, analysis) in analyses.iter().enumerate() {
            let signal_id = if index == 0 {
                signal.id.clone()
            } else {
                // Multi-signal messages get one row per analysis.
                self.store.insert_signal(user_id, source, raw_text).await?.id
            };
            if let Err(e) = self
                .handle_analysis(user_id, source, &signal_id, analysis, &config)
                .await
            {
                error!(signal = %signal_id, error = %e, "Signal execution failed");
                self.store
                    .set_signal_status(&signal_id, SignalStatus::Failed, Some(&e.to_string()), None)
                    .await?;
            }
            if let Ok(Some(updated)) = self.store.signal(&signal_id).await {
                self.emit_signal(user_id, UserEvent::SignalUpdate, &updated).await;
            }
        }
        Ok(())
    }

    async fn handle_analysis(
        self: &Arc<Self>,
        user_id: &str,
        source: &str,
        signal_id: &str,
        analysis: &SignalAnalysis,
        config: &store::AppConfig,
    ) -> Result<()> {
        let symbol = normalize_symbol(&analysis.symbol);

        // Duplicate gate: one live bot per (user, symbol).
        if self.store.has_live_tg_bot(user_id, &symbol).await? {
            info!(user = user_id, symbol = %symbol, "Duplicate signal skipped");
            self.store
                .set_signal_status(
                    signal_id,
                    SignalStatus::Rejected,
                    Some(&format!(
                        "Duplicate trade: {symbol} already has an active operation"
                    )),
                    None,
                )
                .await?;
            return Ok(());
        }

        let status = match analysis.decision {
            AnalysisDecision::Approved => SignalStatus::Accepted,
            AnalysisDecision::Rejected => SignalStatus::Rejected,
        };
        self.store
            .set_signal_analysis(
                signal_id,
                &SignalAnalysisUpdate {
                    symbol: Some(symbol.clone()),
                    market_type: Some(analysis.market_type.to_string()),
                    direction: Some(analysis.direction),
                    decision: Some(format!("{:?}", analysis.decision).to_uppercase()),
                    confidence: Some(analysis.confidence),
                    reasoning: analysis.reasoning.clone(),
                },
                status,
            )
            .await?;
        if status == SignalStatus::Rejected {
            return Ok(());
        }

        if !analysis.is_safe {
            self.store
                .set_signal_status(signal_id, SignalStatus::RejectedUnsafe, None, None)
                .await?;
            return Ok(());
        }

        // Hard cap on concurrent telegram bots (0 = unlimited).
        let max_bots = config.bot_strategy.max_active_telegram_bots;
        if max_bots > 0 {
            let live = self.store.count_live_tg_bots(user_id).await?;
            if live >= max_bots as i64 {
                self.store
                    .set_signal_status(
                        signal_id,
                        SignalStatus::Rejected,
                        Some(&format!("Max active telegram bots reached ({max_bots})")),
                        None,
                    )
                    .await?;
                return Ok(());
            }
        }

        let exchange_id = analysis
            .plan
            .exchange_id
            .clone()
            .unwrap_or_else(|| "binance".to_string())
            .to_lowercase();

        // Validate the symbol actually trades on the chosen exchange/market.
        if let Err(reason) = self
            .validate_symbol(&exchange_id, analysis.market_type, &symbol)
            .await
        {
            self.store
                .set_signal_status(signal_id, SignalStatus::Rejected, Some(&reason), None)
                .await?;
            return Ok(());
        }

        let bot = self
            .create_tg_bot(user_id, source, signal_id, analysis, config, &exchange_id, &symbol)
            .await?;

        self.store
            .set_signal_status(signal_id, SignalStatus::Executing, None, Some(&bot.id))
            .await?;

        if let Ok(doc) = serde_json::to_value(&bot) {
            self.bus
                .emit_to_user(user_id, &UserEvent::TelegramTradeNew(doc))
                .await;
        }

        self.spawn_workflow(&bot.id).await;
        Ok(())
    }

    async fn validate_symbol(
        &self,
        exchange_id: &str,
        market: common::MarketKind,
        symbol: &str,
    ) -> std::result::Result<(), String> {
        if symbol.starts_with("UNKNOWN/") {
            return Err(format!("Unrecognized symbol '{symbol}'"));
        }
        match self.hub.public(exchange_id, market).await {
            Ok(adapter) => match adapter.load_markets().await {
                Ok(markets) => match markets.get(symbol) {
                    Some(info) if info.active => Ok(()),
                    _ => Err(format!(
                        "Symbol {symbol} not supported on {exchange_id} ({market})"
                    )),
                },
                Err(e) => {
                    // Markets unreachable: let the trade proceed rather than
                    // reject on infrastructure noise.
                    warn!(exchange = exchange_id, error = %e, "Symbol validation skipped");
                    Ok(())
                }
            },
            Err(e) => Err(format!("Exchange {exchange_id} unavailable: {e}")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_tg_bot(
        &self,
        user_id: &str,
        source: &str,
        signal_id: &str,
        analysis: &SignalAnalysis,
        config: &store::AppConfig,
        exchange_id: &str,
        symbol: &str,
    ) -> Result<TelegramBot> {
        let mode = config.trading_mode.mode();
        let entry = analysis.plan.entry_price;
        if entry <= 0.0 {
            return Err(Error::Validation("analysis has no entry price".into()));
        }

        // Direction-sane TPs only, ordered by closeness to entry.
        let mut targets: Vec<_> = analysis
            .plan
            .take_profits
            .iter()
            .filter(|tp| tp.price > 0.0 && tp.percent > 0.0)
            .filter(|tp| match analysis.direction {
                Direction::Long => tp.price > entry,
                Direction::Short => tp.price < entry,
            })
            .cloned()
            .collect();
        targets.sort_by(|a, b| {
            (a.price - entry)
                .abs()
                .partial_cmp(&(b.price - entry).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let take_profits: Vec<TakeProfitLevel> = targets
            .iter()
            .map(|tp| TakeProfitLevel {
                price: tp.price,
                percent: tp.percent,
                qty: tp.qty,
                status: TradeItemStatus::Pending,
            })
            .collect();

        let now = Utc::now();
        let chat_id = source.strip_prefix("telegram_").map(|s| s.to_string());
        let bot = TelegramBot {
            id: signal_id.to_string(),
            user_id: user_id.to_string(),
            source: source.to_string(),
            chat_id,
            symbol: symbol.to_string(),
            side: analysis.direction,
            market_type: analysis.market_type,
            exchange_id: exchange_id.to_string(),
            mode,
            status: TgBotStatus::WaitingEntry,
            config: TgBotConfig {
                entry_price: entry,
                stop_loss: analysis.plan.stop_loss,
                take_profits,
                leverage: analysis.plan.leverage,
                investment: analysis.plan.investment,
            },
            actual_entry_price: None,
            current_price: None,
            pnl: 0.0,
            exit_price: None,
            exit_reason: None,
            expires_at: analysis
                .plan
                .valid_for_minutes
                .filter(|&mins| mins > 0)
                .map(|mins| now + Duration::minutes(mins)),
            expiry_handled_at: None,
            executed_at: None,
            closed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_tg_bot(&bot).await?;

        // Companion execution bot, 1:1 by id, fed through the same engine.
        let companion = BotInstance {
            id: bot.id.clone(),
            user_id: user_id.to_string(),
            name: format!("TG {symbol}"),
            symbol: symbol.to_string(),
            timeframe: "1m".into(),
            market_type: analysis.market_type,
            exchange_id: exchange_id.to_string(),
            strategy_name: "TelegramSignal".into(),
            mode,
            status: common::BotStatus::Active,
            amount: bot.config.investment_or_default(),
            side: None,
            position_qty: 0.0,
            position_avg_price: 0.0,
            wallet_allocated: 0.0,
            wallet_available: 0.0,
            wallet_realized_pnl: 0.0,
            total_pnl: 0.0,
            last_candle_ts: None,
            last_execution: None,
            created_at: now,
        };
        self.store.create_bot(&companion).await?;

        // One item per monitored price level, TPs by ascending closeness.
        let mut items: Vec<TelegramTradeItem> = vec![
            new_trade_item(&bot.id, user_id, TradeItemKind::Entry, 0, entry, None, TradeItemStatus::Active),
            new_trade_item(&bot.id, user_id, TradeItemKind::Sl, 0, analysis.plan.stop_loss, None, TradeItemStatus::Active),
        ];
        for (idx, tp) in bot.config.take_profits.iter().enumerate() {
            items.push(new_trade_item(
                &bot.id,
                user_id,
                TradeItemKind::Tp,
                (idx + 1) as i64,
                tp.price,
                Some(tp.percent),
                TradeItemStatus::Pending,
            ));
        }
        self.store.insert_trade_items(&items).await?;

        info!(bot = %bot.id, symbol = %symbol, side = %bot.side, mode = %mode, "Telegram bot created");
        Ok(bot)
    }

    // ── Workflow management ──────────────────────────────────────────────────

    /// Start the per-bot workflow unless one is already running.
    pub async fn spawn_workflow(self: &Arc<Self>, bot_id: &str) {
        let mut workflows = self.workflows.lock().await;
        if workflows.contains_key(bot_id) {
            return;
        }
        let orchestrator = self.clone();
        let id = bot_id.to_string();
        workflows.insert(
            bot_id.to_string(),
            tokio::spawn(workflow::run(orchestrator, id)),
        );
    }

    /// Rebuild workflows for every live bot (boot recovery). Idempotent.
    pub async fn resume_active(self: &Arc<Self>) -> Result<usize> {
        let bots = self.store.live_tg_bots().await?;
        let count = bots.len();
        for bot in bots {
            self.spawn_workflow(&bot.id).await;
        }
        info!(workflows = count, "Telegram trade workflows resumed");
        Ok(count)
    }

    pub async fn active_workflows(&self) -> usize {
        self.workflows.lock().await.len()
    }

    pub async fn shutdown(&self) {
        let mut workflows = self.workflows.lock().await;
        for (bot_id, handle) in workflows.drain() {
            handle.abort();
            info!(bot = %bot_id, "Telegram workflow cancelled");
        }
    }

    // ── Price monitoring ─────────────────────────────────────────────────────

    /// Apply one observed price to a bot: entry trigger, PnL refresh,
    /// stop-loss and the TP ladder. Loads fresh state so it composes with
    /// the expiry sweeper's concurrent updates.
    pub async fn handle_price_tick(&self, bot_id: &str, price: f64) -> Result<TickOutcome> {
        let Some(bot) = self.store.tg_bot(bot_id).await? else {
            return Ok(TickOutcome::Inactive);
        };
        if !bot.status.is_live() {
            return Ok(TickOutcome::Inactive);
        }
        if price <= 0.0 {
            return Ok(TickOutcome::Waiting);
        }

        match bot.status {
            TgBotStatus::WaitingEntry => self.try_entry(&bot, price).await,
            TgBotStatus::Active => self.monitor_active(&bot, price).await,
            _ => Ok(TickOutcome::Inactive),
        }
    }

    async fn try_entry(&self, bot: &TelegramBot, price: f64) -> Result<TickOutcome> {
        if !bot.side.target_reached(price, bot.config.entry_price) {
            return Ok(TickOutcome::Waiting);
        }

        info!(bot = %bot.id, price, entry = bot.config.entry_price, "Entry triggered");
        let signal = match bot.side {
            Direction::Long => TradeSignal::Buy,
            Direction::Short => TradeSignal::Sell,
        };
        // Alert signal: validated entry triggers bypass the profit guard.
        let execution = self
            .engine
            .process_signal(&bot.id, SignalData::alert(signal, price))
            .await?;
        if !execution.is_executed() {
            warn!(bot = %bot.id, ?execution, "Entry execution blocked");
            return Ok(TickOutcome::Waiting);
        }

        self.store.set_tg_bot_entry(&bot.id, price).await?;
        for item in self.store.trade_items(&bot.id).await? {
            if item.kind == TradeItemKind::Entry && item.status == TradeItemStatus::Active {
                self.store.mark_trade_item_hit(&item.id).await?;
            }
        }
        self.emit_trade_update(&bot.user_id, &bot.id).await;
        Ok(TickOutcome::Entered)
    }

    async fn monitor_active(&self, bot: &TelegramBot, price: f64) -> Result<TickOutcome> {
        let entry = bot.actual_entry_price.unwrap_or(bot.config.entry_price);
        let pnl = bot.side.pnl_pct(price, entry);
        self.store.update_tg_bot_tick(&bot.id, price, pnl).await?;

        // Stop-loss beats the ladder.
        if bot.side.stop_reached(price, bot.config.stop_loss) {
            info!(bot = %bot.id, price, sl = bot.config.stop_loss, "Stop-loss hit");
            if let Err(e) = self.engine.manual_close(&bot.user_id, &bot.id, price).await {
                error!(bot = %bot.id, error = %e, "Stop-loss close failed");
            }
            self.store.close_tg_bot(&bot.id, price, "stop_loss").await?;
            self.store.cancel_open_trade_items(&bot.id).await?;
            self.emit_trade_update(&bot.user_id, &bot.id).await;
            return Ok(TickOutcome::Closed {
                reason: "stop_loss".into(),
            });
        }

        // Pending TPs, closest first. `remaining` tracks the percent of the
        // original position still open so each partial close converts its
        // ladder percent into a fraction of the current position.
        let items = self.store.trade_items(&bot.id).await?;
        let pending: Vec<&TelegramTradeItem> = items
            .iter()
            .filter(|i| i.kind == TradeItemKind::Tp && i.status == TradeItemStatus::Pending)
            .collect();
        let mut remaining: f64 = pending.iter().filter_map(|i| i.percent).sum();
        let mut hit_any = false;

        for item in &pending {
            if !bot.side.target_reached(price, item.target_price) {
                continue;
            }
            let percent = item.percent.unwrap_or(remaining);
            let fraction_of_current = if remaining > 0.0 {
                (percent / remaining * 100.0).min(100.0)
            } else {
                100.0
            };
            info!(bot = %bot.id, level = item.level, price, target = item.target_price, "Take-profit hit");
            if let Err(e) = self
                .engine
                .close_fraction(&bot.user_id, &bot.id, fraction_of_current, price)
                .await
            {
                error!(bot = %bot.id, error = %e, "Take-profit close failed");
                continue;
            }
            self.store.mark_trade_item_hit(&item.id).await?;
            remaining -= percent;
            hit_any = true;
        }

        if hit_any {
            self.sync_ladder_snapshot(&bot.id).await?;

            let still_pending = self
                .store
                .trade_items(&bot.id)
                .await?
                .iter()
                .any(|i| i.kind == TradeItemKind::Tp && i.status == TradeItemStatus::Pending);
            if !still_pending {
                info!(bot = %bot.id, "All take-profits hit");
                self.store.close_tg_bot(&bot.id, price, "all_tps_hit").await?;
                self.store.cancel_open_trade_items(&bot.id).await?;
                self.emit_trade_update(&bot.user_id, &bot.id).await;
                return Ok(TickOutcome::Closed {
                    reason: "all_tps_hit".into(),
                });
            }
            self.emit_trade_update(&bot.user_id, &bot.id).await;
        } else {
            self.emit_trade_update(&bot.user_id, &bot.id).await;
        }

        Ok(TickOutcome::Monitoring)
    }

    /// Mirror hit items back into the config's TP snapshot.
    async fn sync_ladder_snapshot(&self, bot_id: &str) -> Result<()> {
        let Some(bot) = self.store.tg_bot(bot_id).await? else {
            return Ok(());
        };
        let items = self.store.trade_items(bot_id).await?;
        let mut config = bot.config.clone();
        for tp in &mut config.take_profits {
            let hit = items.iter().any(|i| {
                i.kind == TradeItemKind::Tp
                    && i.status == TradeItemStatus::Hit
                    && (i.target_price - tp.price).abs() < 1e-9
            });
            if hit {
                tp.status = TradeItemStatus::Hit;
            }
        }
        self.store.set_tg_bot_config(bot_id, &config).await
    }

    pub(crate) async fn emit_trade_update(&self, user_id: &str, bot_id: &str) {
        if let Ok(Some(bot)) = self.store.tg_bot(bot_id).await {
            if let Ok(doc) = serde_json::to_value(&bot) {
                self.bus
                    .emit_to_user(user_id, &UserEvent::TelegramTradeUpdate(doc))
                    .await;
            }
        }
    }

    async fn emit_signal(
        &self,
        user_id: &str,
        wrap: fn(serde_json::Value) -> UserEvent,
        signal: &SignalRow,
    ) {
        if let Ok(doc) = serde_json::to_value(signal) {
            self.bus.emit_to_user(user_id, &wrap(doc)).await;
        }
    }
}
