use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use common::{Error, SignalData, StreamEvent, TradeSignal};
use engine::ExecutionEngine;
use exchange::ExchangeHub;
use features::FeatureStateService;
use notify::{price_topic, NotificationBus, UserEvent};
use store::{BotInstance, Store};
use strategy::StrategyRegistry;
use stream::{BufferUpdate, DataBuffer, MarketStreamService};

/// Cadence of the per-bot strategy evaluation loop.
const AUTOTRADE_INTERVAL: Duration = Duration::from_secs(60);
/// Cadence of the shared live-price push.
const PRICE_STREAM_INTERVAL: Duration = Duration::from_secs(5);

/// Brings the platform back to life after a restart: rehydrates every ACTIVE
/// bot into the engine, re-subscribes its streams, and resumes monitoring
/// without duplicate side effects.
pub struct BootManager {
    store: Store,
    hub: Arc<ExchangeHub>,
    streams: Arc<MarketStreamService>,
    buffer: Arc<DataBuffer>,
    features: Arc<FeatureStateService>,
    registry: Arc<StrategyRegistry>,
    engine: Arc<ExecutionEngine>,
    bus: Arc<NotificationBus>,
    autotrade_loops: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BootManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        hub: Arc<ExchangeHub>,
        streams: Arc<MarketStreamService>,
        buffer: Arc<DataBuffer>,
        features: Arc<FeatureStateService>,
        registry: Arc<StrategyRegistry>,
        engine: Arc<ExecutionEngine>,
        bus: Arc<NotificationBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            streams,
            buffer,
            features,
            registry,
            engine,
            bus,
            autotrade_loops: Mutex::new(HashMap::new()),
        })
    }

    /// Rehydrate every ACTIVE bot. Idempotent: a second call re-registers
    /// stream interest but spawns no duplicate loops.
    pub async fn recover(self: &Arc<Self>) -> common::Result<usize> {
        info!("Boot recovery started");
        let bots = self.store.active_bots().await?;
        if bots.is_empty() {
            info!("No active bots to recover");
            return Ok(0);
        }

        let mut recovered = 0;
        for bot in bots {
            // Strategy-less bots (e.g. telegram companions) are monitored by
            // their own workflows, not the autotrade loop.
            if self.registry.get(bot.market_type, &bot.strategy_name).is_none() {
                continue;
            }
            if let Err(e) = self.attach_bot(&bot).await {
                match e {
                    Error::SymbolNotFound(_) | Error::Market(_) => {
                        // Drop this stream, keep the rest of the exchange alive.
                        info!(bot = %bot.id, symbol = %bot.symbol, error = %e, "Skipping unsupported market");
                    }
                    e => error!(bot = %bot.id, error = %e, "Bot recovery failed"),
                }
                continue;
            }
            recovered += 1;
        }

        info!(bots = recovered, "Boot recovery finished");
        Ok(recovered)
    }

    async fn attach_bot(self: &Arc<Self>, bot: &BotInstance) -> common::Result<()> {
        info!(bot = %bot.id, symbol = %bot.symbol, timeframe = %bot.timeframe, "Reactivating bot");

        // Warm-up may fail on a cold exchange; streams still attach and the
        // buffer retries on the next ensure call.
        if let Err(e) = self
            .buffer
            .ensure_buffer(&bot.exchange_id, bot.market_type, &bot.symbol, &bot.timeframe)
            .await
        {
            warn!(bot = %bot.id, error = %e, "Buffer warm-up failed during recovery");
        }

        self.streams
            .subscribe_ticker(&bot.exchange_id, bot.market_type, &bot.symbol)
            .await;
        self.streams
            .subscribe_candles(&bot.exchange_id, bot.market_type, &bot.symbol, &bot.timeframe)
            .await;

        // Every recovered bot must own a feature-state document.
        if self.store.feature_state(&bot.id).await?.is_none() {
            let init = self.features.initialize_for_bot(bot).await?;
            if !init.ok {
                warn!(bot = %bot.id, reason = ?init.reason, "Feature bootstrap incomplete");
            }
        }

        let mut loops = self.autotrade_loops.lock().await;
        if !loops.contains_key(&bot.id) {
            let manager = self.clone();
            let bot_id = bot.id.clone();
            loops.insert(bot.id.clone(), tokio::spawn(manager.autotrade_loop(bot_id)));
        }
        Ok(())
    }

    /// Periodic strategy evaluation for one bot: pull the latest window,
    /// decide on the last closed candle, feed the engine.
    async fn autotrade_loop(self: Arc<Self>, bot_id: String) {
        info!(bot = %bot_id, "Autotrade loop started");
        loop {
            if let Err(e) = self.autotrade_once(&bot_id).await {
                error!(bot = %bot_id, error = %e, "Autotrade iteration failed");
            }

            // Stop silently once the bot is gone or paused.
            match self.store.bot(&bot_id).await {
                Ok(Some(bot)) if bot.status == common::BotStatus::Active => {}
                _ => break,
            }
            tokio::time::sleep(AUTOTRADE_INTERVAL).await;
        }
        info!(bot = %bot_id, "Autotrade loop stopped");
        self.autotrade_loops.lock().await.remove(&bot_id);
    }

    async fn autotrade_once(&self, bot_id: &str) -> common::Result<()> {
        let Some(bot) = self.store.bot(bot_id).await? else {
            return Ok(());
        };
        if bot.status != common::BotStatus::Active {
            return Ok(());
        }

        // Global per-user kill switch.
        let config = self.store.app_config(&bot.user_id).await?;
        if !config.is_auto_enabled {
            return Ok(());
        }

        let mut window = self
            .buffer
            .latest(&bot.exchange_id, &bot.symbol, &bot.timeframe)
            .await;
        if window.is_empty() {
            // Buffer still cold: go straight to REST once.
            let adapter = self.hub.public(&bot.exchange_id, bot.market_type).await?;
            window = adapter
                .fetch_ohlcv(&bot.symbol, &bot.timeframe, 100, None)
                .await?;
        }
        if window.is_empty() {
            return Ok(());
        }

        let Some(strategy) = self.registry.get(bot.market_type, &bot.strategy_name) else {
            return Ok(());
        };
        let position = bot.position();
        let frame = strategy.apply(&window, Some(&position));
        let signal = frame.last_signal();
        if signal == TradeSignal::Wait {
            return Ok(());
        }

        let price = window.last().map(|c| c.close).unwrap_or(0.0);
        info!(bot = %bot.id, symbol = %bot.symbol, ?signal, price, "Strategy decision");
        let mut data = SignalData::auto(signal, price);
        data.reasoning = Some(format!("Strategy: {}", bot.strategy_name));
        self.engine.process_signal(&bot.id, data).await?;
        Ok(())
    }

    /// Candle pump: merge live candles into the buffer and refresh feature
    /// state whenever a candle closes.
    pub fn spawn_candle_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut candles = manager.streams.candles();
            loop {
                match candles.recv().await {
                    Ok(StreamEvent::Candle { exchange, symbol, timeframe, candle, .. }) => {
                        let update = manager
                            .buffer
                            .apply_candle(&exchange, &symbol, &timeframe, candle)
                            .await;
                        if matches!(update, BufferUpdate::Appended { closed: Some(_) }) {
                            manager
                                .on_candle_closed(&exchange, &symbol, &timeframe)
                                .await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(dropped = n, "Candle pump lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn on_candle_closed(&self, exchange: &str, symbol: &str, timeframe: &str) {
        let window = self.buffer.latest(exchange, symbol, timeframe).await;
        if window.is_empty() {
            return;
        }
        let bots = match self.store.active_bots().await {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "Active bot lookup failed in candle pump");
                return;
            }
        };
        for bot in bots.iter().filter(|b| {
            b.exchange_id == exchange && b.symbol == symbol && b.timeframe == timeframe
        }) {
            if self.registry.get(bot.market_type, &bot.strategy_name).is_none() {
                continue;
            }
            if let Err(e) = self.features.update_on_candle_close(bot, &window).await {
                error!(bot = %bot.id, error = %e, "Feature update on candle close failed");
            }
        }
    }

    /// Forward throttled ticker events onto their price topics for
    /// `PRICES_SUBSCRIBE` clients.
    pub fn spawn_ticker_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tickers = manager.streams.tickers();
            loop {
                match tickers.recv().await {
                    Ok(StreamEvent::Ticker { exchange, market, symbol, last, ts }) => {
                        let topic = price_topic(&exchange, market, &symbol);
                        manager
                            .bus
                            .emit_to_topic(
                                &topic,
                                &UserEvent::PriceUpdate {
                                    exchange_id: exchange,
                                    market_type: market,
                                    symbol,
                                    price: last,
                                    ts,
                                    bot_id: None,
                                },
                            )
                            .await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Shared price stream: every few seconds push a `price_update` per bot,
    /// grouped by (symbol, exchange) so each pair is priced once.
    pub fn spawn_price_stream(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!("Live price streaming started");
            loop {
                if let Err(e) = manager.price_stream_once().await {
                    error!(error = %e, "Price streaming pass failed");
                }
                tokio::time::sleep(PRICE_STREAM_INTERVAL).await;
            }
        })
    }

    async fn price_stream_once(&self) -> common::Result<()> {
        let bots = self.store.active_bots().await?;
        if bots.is_empty() {
            return Ok(());
        }

        let mut groups: HashMap<(String, String), Vec<&BotInstance>> = HashMap::new();
        for bot in &bots {
            groups
                .entry((bot.symbol.clone(), bot.exchange_id.clone()))
                .or_default()
                .push(bot);
        }

        for ((symbol, exchange_id), group) in groups {
            let kind = group[0].market_type;
            let key = stream::StreamKey::ticker(&exchange_id, kind, &symbol);
            let price = match self.streams.latest_ticker(&key).await {
                Some(ticker) => ticker.last,
                None => match self.hub.public(&exchange_id, kind).await {
                    Ok(adapter) => match adapter.fetch_ticker(&symbol).await {
                        Ok(ticker) => ticker.last,
                        Err(Error::SymbolNotFound(_)) | Err(Error::Market(_)) => {
                            info!(symbol = %symbol, exchange = %exchange_id, "Symbol unavailable, skipping price push");
                            continue;
                        }
                        Err(e) => {
                            error!(symbol = %symbol, exchange = %exchange_id, error = %e, "Price fetch failed");
                            continue;
                        }
                    },
                    Err(_) => continue,
                },
            };
            if price <= 0.0 {
                continue;
            }

            for bot in group {
                self.bus
                    .emit_to_user(
                        &bot.user_id,
                        &UserEvent::PriceUpdate {
                            exchange_id: exchange_id.clone(),
                            market_type: bot.canonical_market(),
                            symbol: symbol.clone(),
                            price,
                            ts: Utc::now(),
                            bot_id: Some(bot.id.clone()),
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }
}
