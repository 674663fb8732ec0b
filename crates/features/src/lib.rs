use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use common::{Candle, PositionSnapshot, Result, Side};
use exchange::ExchangeHub;
use store::{BotInstance, FeatureState, Store, WindowCandle};
use strategy::{StrategyFrame, StrategyRegistry};

/// History pulled for the initial snapshot.
const BOOTSTRAP_CANDLES: u32 = 200;
/// Tail kept in the state document's window.
const WINDOW_KEEP: usize = 120;

/// Position-context columns appended after the strategy's own features; the
/// classifier is trained against this exact ordering.
const CONTEXT_FEATURES: [&str; 2] = ["in_position", "current_pnl"];

/// Outcome of a bootstrap attempt. A state document exists afterwards even
/// when `ok` is false, so runtime updates can fill it later.
#[derive(Debug, Clone)]
pub struct FeatureInit {
    pub ok: bool,
    pub reason: Option<String>,
    pub rows: usize,
}

impl FeatureInit {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
            rows: 0,
        }
    }
}

/// Maintains the per-bot strategy feature snapshots: bootstrap from REST
/// history on bot creation, incremental refresh on every closed candle.
///
/// Runtime updates write only the state document; the append-only history
/// collection is written by the bootstrap/backfill pass alone.
pub struct FeatureStateService {
    store: Store,
    hub: Arc<ExchangeHub>,
    registry: Arc<StrategyRegistry>,
}

impl FeatureStateService {
    pub fn new(store: Store, hub: Arc<ExchangeHub>, registry: Arc<StrategyRegistry>) -> Self {
        Self { store, hub, registry }
    }

    /// Build the initial snapshot for a new bot. Any failure still persists
    /// an empty state document keyed by the bot.
    pub async fn initialize_for_bot(&self, bot: &BotInstance) -> Result<FeatureInit> {
        let Some(strategy) = self.registry.get(bot.market_type, &bot.strategy_name) else {
            self.persist_empty(bot).await?;
            return Ok(FeatureInit::failed("strategy_class_not_found"));
        };

        // Public history only: bootstrap must not depend on user credentials.
        let candles = match self.hub.public(&bot.exchange_id, bot.market_type).await {
            Ok(adapter) => match adapter
                .fetch_ohlcv(&bot.symbol, &bot.timeframe, BOOTSTRAP_CANDLES, None)
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    warn!(bot = %bot.id, error = %e, "Feature bootstrap history fetch failed");
                    self.persist_empty(bot).await?;
                    return Ok(FeatureInit::failed(format!("history_fetch: {e}")));
                }
            },
            Err(e) => {
                self.persist_empty(bot).await?;
                return Ok(FeatureInit::failed(format!("exchange_unavailable: {e}")));
            }
        };
        if candles.is_empty() {
            self.persist_empty(bot).await?;
            return Ok(FeatureInit::failed("empty_history"));
        }

        let frame = strategy.apply(&candles, Some(&PositionSnapshot::default()));
        if frame.rows.is_empty() {
            self.persist_empty(bot).await?;
            return Ok(FeatureInit::failed("empty_processed"));
        }

        let state = build_state(bot, &frame, &PositionSnapshot::default(), None);
        let rows = state.window_candles.len();
        self.store.upsert_feature_state(&state).await?;
        let written = self
            .store
            .backfill_feature_history(&bot.id, &state.window_candles)
            .await?;

        info!(
            bot = %bot.id, strategy = %bot.strategy_name, rows,
            history = written, "Feature state initialized"
        );
        Ok(FeatureInit {
            ok: true,
            reason: None,
            rows,
        })
    }

    /// Refresh the snapshot from a closed-candle window. Called by the
    /// candle pump whenever a bot's stream finalizes a candle.
    pub async fn update_on_candle_close(
        &self,
        bot: &BotInstance,
        candles: &[Candle],
    ) -> Result<()> {
        if candles.is_empty() {
            return Ok(());
        }
        let Some(strategy) = self.registry.get(bot.market_type, &bot.strategy_name) else {
            return Err(common::Error::Validation(format!(
                "unknown strategy {} for {}",
                bot.strategy_name, bot.market_type
            )));
        };

        let position = bot.position();
        let frame = strategy.apply(candles, Some(&position));
        if frame.rows.is_empty() {
            return Ok(());
        }

        let last_close = candles.last().map(|c| c.close);
        let state = build_state(bot, &frame, &position, last_close);
        self.store.upsert_feature_state(&state).await?;
        if let Some(ts) = state.last_candle_ts {
            self.store.set_bot_last_candle(&bot.id, ts).await?;
        }
        Ok(())
    }

    async fn persist_empty(&self, bot: &BotInstance) -> Result<()> {
        self.store
            .upsert_feature_state(&FeatureState {
                bot_id: bot.id.clone(),
                user_id: bot.user_id.clone(),
                strategy_name: bot.strategy_name.clone(),
                symbol: bot.symbol.clone(),
                exchange_id: bot.exchange_id.clone(),
                timeframe: bot.timeframe.clone(),
                market_type: bot.market_type,
                features: Vec::new(),
                latest_features: BTreeMap::new(),
                window_candles: Vec::new(),
                last_candle_ts: None,
                feature_rows: 0,
            })
            .await
    }
}

fn build_state(
    bot: &BotInstance,
    frame: &StrategyFrame,
    position: &PositionSnapshot,
    last_close: Option<f64>,
) -> FeatureState {
    let mut features = frame.features.clone();
    features.extend(CONTEXT_FEATURES.iter().map(|s| s.to_string()));

    let in_position = if position.qty > 0.0 { 1.0 } else { 0.0 };
    let current_pnl = match (last_close, bot.side) {
        (Some(close), Some(Side::Buy)) if position.avg_price > 0.0 => {
            (close - position.avg_price) / position.avg_price * 100.0
        }
        (Some(close), Some(Side::Sell)) if position.avg_price > 0.0 => {
            (position.avg_price - close) / position.avg_price * 100.0
        }
        _ => 0.0,
    };

    let skip = frame.rows.len().saturating_sub(WINDOW_KEEP);
    let window_candles: Vec<WindowCandle> = frame.rows[skip..]
        .iter()
        .map(|row| {
            let mut map: BTreeMap<String, f64> = frame
                .features
                .iter()
                .cloned()
                .zip(row.values.iter().copied())
                .collect();
            map.insert("in_position".into(), in_position);
            map.insert("current_pnl".into(), current_pnl);
            WindowCandle {
                candle: row.candle,
                features: map,
            }
        })
        .collect();

    let latest_features = window_candles
        .last()
        .map(|w| w.features.clone())
        .unwrap_or_default();
    let last_candle_ts = window_candles.last().map(|w| w.candle.ts);
    let feature_rows = frame.rows.len() as i64;

    FeatureState {
        bot_id: bot.id.clone(),
        user_id: bot.user_id.clone(),
        strategy_name: bot.strategy_name.clone(),
        symbol: bot.symbol.clone(),
        exchange_id: bot.exchange_id.clone(),
        timeframe: bot.timeframe.clone(),
        market_type: bot.market_type,
        features,
        latest_features,
        window_candles,
        last_candle_ts,
        feature_rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use common::{BotStatus, MarketKind, TradeMode};
    use exchange::hub::{Credential, CredentialSource};
    use exchange::MockExchange;
    use uuid::Uuid;

    struct NoCredentials;

    #[async_trait::async_trait]
    impl CredentialSource for NoCredentials {
        async fn active_credential(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Option<Credential>> {
            Ok(None)
        }
    }

    fn bot(strategy_name: &str) -> BotInstance {
        BotInstance {
            id: Uuid::new_v4().to_string(),
            user_id: "u1".into(),
            name: "bot".into(),
            symbol: "BTC/USDT".into(),
            timeframe: "15m".into(),
            market_type: MarketKind::Spot,
            exchange_id: "mock".into(),
            strategy_name: strategy_name.into(),
            mode: TradeMode::Simulated,
            status: BotStatus::Active,
            amount: 100.0,
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

    fn candles(n: usize) -> Vec<Candle> {
        let start = Utc::now() - Duration::minutes(n as i64 * 15);
        (0..n)
            .map(|i| {
                let close = 100.0 + ((i * 7) % 13) as f64 - 6.0;
                Candle {
                    ts: start + Duration::minutes(i as i64 * 15),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 50.0 + (i % 10) as f64,
                }
            })
            .collect()
    }

    async fn service() -> (FeatureStateService, Store, Arc<MockExchange>) {
        let store = Store::in_memory().await.unwrap();
        let hub = Arc::new(ExchangeHub::new(Arc::new(NoCredentials)));
        let mock = Arc::new(MockExchange::new("mock"));
        hub.register_public("mock", MarketKind::Spot, mock.clone())
            .await;
        let registry = Arc::new(StrategyRegistry::builtin());
        (
            FeatureStateService::new(store.clone(), hub, registry),
            store,
            mock,
        )
    }

    #[tokio::test]
    async fn bootstrap_persists_window_and_history() {
        let (service, store, mock) = service().await;
        mock.seed_candles("BTC/USDT", "15m", candles(200)).await;

        let bot = bot("RsiReversion");
        store.create_bot(&bot).await.unwrap();
        let init = service.initialize_for_bot(&bot).await.unwrap();
        assert!(init.ok, "{:?}", init.reason);

        let state = store.feature_state(&bot.id).await.unwrap().unwrap();
        assert!(state.window_candles.len() <= 120);
        assert!(!state.window_candles.is_empty());
        assert!(state.features.contains(&"rsi".to_string()));
        assert!(state.features.ends_with(&["in_position".into(), "current_pnl".into()]));
        assert_eq!(state.latest_features["in_position"], 0.0);
        assert!(store.feature_history_count(&bot.id).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn failed_bootstrap_still_creates_empty_state() {
        let (service, store, _mock) = service().await;
        // No candles seeded: history comes back empty.
        let bot = bot("RsiReversion");
        store.create_bot(&bot).await.unwrap();

        let init = service.initialize_for_bot(&bot).await.unwrap();
        assert!(!init.ok);

        let state = store.feature_state(&bot.id).await.unwrap().unwrap();
        assert!(state.window_candles.is_empty());
        assert!(state.features.is_empty());
    }

    #[tokio::test]
    async fn unknown_strategy_reports_and_persists_empty() {
        let (service, store, _mock) = service().await;
        let bot = bot("DoesNotExist");
        store.create_bot(&bot).await.unwrap();

        let init = service.initialize_for_bot(&bot).await.unwrap();
        assert_eq!(init.reason.as_deref(), Some("strategy_class_not_found"));
        assert!(store.feature_state(&bot.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn candle_close_update_refreshes_state_without_history() {
        let (service, store, mock) = service().await;
        mock.seed_candles("BTC/USDT", "15m", candles(200)).await;

        let bot = bot("RsiReversion");
        store.create_bot(&bot).await.unwrap();
        service.initialize_for_bot(&bot).await.unwrap();
        let history_before = store.feature_history_count(&bot.id).await.unwrap();

        let window = candles(160);
        service.update_on_candle_close(&bot, &window).await.unwrap();

        let state = store.feature_state(&bot.id).await.unwrap().unwrap();
        assert!(state.window_candles.len() <= 120);
        assert_eq!(
            state.last_candle_ts.unwrap(),
            window.last().unwrap().ts
        );
        // Runtime updates never append history.
        assert_eq!(
            store.feature_history_count(&bot.id).await.unwrap(),
            history_before
        );

        let loaded = store.bot(&bot.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_candle_ts.unwrap(), window.last().unwrap().ts);
    }
}
