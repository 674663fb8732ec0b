use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use common::{Candle, MarketKind, Result};
use exchange::ExchangeHub;

/// Rolling window ceiling per buffer.
const MAX_CANDLES: usize = 500;
/// REST history pulled on first interest, before any live update applies.
const WARMUP_LIMIT: u32 = 100;

type BufferKey = (String, String, String); // (exchange, symbol, timeframe)

/// Outcome of applying one live candle to a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferUpdate {
    /// A strictly newer candle was appended. `closed` carries the candle it
    /// finalized, if any.
    Appended { closed: Option<Candle> },
    /// Same open timestamp: OHLCV updated in place.
    Updated,
    /// Older than the window tail: dropped.
    Ignored,
}

#[derive(Default)]
struct CandleWindow {
    candles: Vec<Candle>,
    warmed: bool,
}

impl CandleWindow {
    fn apply(&mut self, candle: Candle) -> BufferUpdate {
        match self.candles.last().copied() {
            None => {
                self.candles.push(candle);
                BufferUpdate::Appended { closed: None }
            }
            Some(last) if candle.ts > last.ts => {
                self.candles.push(candle);
                if self.candles.len() > MAX_CANDLES {
                    let overflow = self.candles.len() - MAX_CANDLES;
                    self.candles.drain(..overflow);
                }
                BufferUpdate::Appended { closed: Some(last) }
            }
            Some(last) if candle.ts == last.ts => {
                *self.candles.last_mut().expect("non-empty window") = candle;
                BufferUpdate::Updated
            }
            Some(_) => BufferUpdate::Ignored,
        }
    }
}

/// In-memory rolling candle store per (exchange, symbol, timeframe).
///
/// Warm-up fetches recent REST history under the buffer's own mutex, so the
/// first live update can never interleave with the initial fill.
pub struct DataBuffer {
    hub: Arc<ExchangeHub>,
    buffers: Mutex<HashMap<BufferKey, Arc<Mutex<CandleWindow>>>>,
}

impl DataBuffer {
    pub fn new(hub: Arc<ExchangeHub>) -> Self {
        Self {
            hub,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    async fn window(&self, key: &BufferKey) -> Arc<Mutex<CandleWindow>> {
        let mut buffers = self.buffers.lock().await;
        buffers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CandleWindow::default())))
            .clone()
    }

    /// Warm the buffer with REST history on first interest. Idempotent: a
    /// warmed, non-empty buffer is left untouched. A failed fetch leaves the
    /// buffer cold so the next call retries.
    pub async fn ensure_buffer(
        &self,
        exchange: &str,
        kind: MarketKind,
        symbol: &str,
        timeframe: &str,
    ) -> Result<()> {
        let key = (exchange.to_string(), symbol.to_string(), timeframe.to_string());
        let window = self.window(&key).await;
        let mut window = window.lock().await;
        if window.warmed && !window.candles.is_empty() {
            return Ok(());
        }

        info!(exchange, symbol, timeframe, "Warming candle buffer from REST history");
        let adapter = self.hub.public(exchange, kind).await?;
        match adapter.fetch_ohlcv(symbol, timeframe, WARMUP_LIMIT, None).await {
            Ok(candles) => {
                if candles.is_empty() {
                    warn!(exchange, symbol, timeframe, "No history returned for warm-up");
                }
                window.candles = candles;
                window.warmed = true;
                Ok(())
            }
            Err(e) => {
                warn!(exchange, symbol, timeframe, error = %e, "Buffer warm-up failed");
                Err(e)
            }
        }
    }

    /// Merge one live candle: newer appends (finalizing the previous candle),
    /// equal timestamps update in place, older are ignored.
    pub async fn apply_candle(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
        candle: Candle,
    ) -> BufferUpdate {
        let key = (exchange.to_string(), symbol.to_string(), timeframe.to_string());
        let window = self.window(&key).await;
        let mut window = window.lock().await;
        window.apply(candle)
    }

    /// Snapshot of the current window, oldest first.
    pub async fn latest(&self, exchange: &str, symbol: &str, timeframe: &str) -> Vec<Candle> {
        let key = (exchange.to_string(), symbol.to_string(), timeframe.to_string());
        let window = self.window(&key).await;
        let window = window.lock().await;
        window.candles.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use exchange::hub::{Credential, CredentialSource};
    use exchange::MockExchange;

    struct NoCredentials;

    #[async_trait::async_trait]
    impl CredentialSource for NoCredentials {
        async fn active_credential(
            &self,
            _: &str,
            _: &str,
        ) -> common::Result<Option<Credential>> {
            Ok(None)
        }
    }

    fn candle(ts_ms: i64, close: f64) -> Candle {
        Candle {
            ts: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    async fn buffer_with_mock() -> (DataBuffer, Arc<MockExchange>) {
        let hub = Arc::new(ExchangeHub::new(Arc::new(NoCredentials)));
        let mock = Arc::new(MockExchange::new("mock"));
        hub.register_public("mock", MarketKind::Spot, mock.clone())
            .await;
        (DataBuffer::new(hub), mock)
    }

    #[tokio::test]
    async fn warm_up_fills_window_before_live_updates() {
        let (buffer, mock) = buffer_with_mock().await;
        mock.seed_candles(
            "BTC/USDT",
            "1m",
            vec![candle(60_000, 100.0), candle(120_000, 101.0)],
        )
        .await;

        buffer
            .ensure_buffer("mock", MarketKind::Spot, "BTC/USDT", "1m")
            .await
            .unwrap();

        let window = buffer.latest("mock", "BTC/USDT", "1m").await;
        assert_eq!(window.len(), 2);
        assert_eq!(window[1].close, 101.0);
    }

    #[tokio::test]
    async fn newer_candle_appends_and_finalizes_previous() {
        let (buffer, _mock) = buffer_with_mock().await;

        let first = buffer
            .apply_candle("mock", "BTC/USDT", "1m", candle(60_000, 100.0))
            .await;
        assert_eq!(first, BufferUpdate::Appended { closed: None });

        let second = buffer
            .apply_candle("mock", "BTC/USDT", "1m", candle(120_000, 101.0))
            .await;
        match second {
            BufferUpdate::Appended { closed: Some(closed) } => assert_eq!(closed.close, 100.0),
            other => panic!("expected append with closed candle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn equal_timestamp_updates_in_place() {
        let (buffer, _mock) = buffer_with_mock().await;
        buffer
            .apply_candle("mock", "BTC/USDT", "1m", candle(60_000, 100.0))
            .await;
        let update = buffer
            .apply_candle("mock", "BTC/USDT", "1m", candle(60_000, 105.0))
            .await;
        assert_eq!(update, BufferUpdate::Updated);

        let window = buffer.latest("mock", "BTC/USDT", "1m").await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].close, 105.0);
    }

    #[tokio::test]
    async fn older_timestamp_is_ignored() {
        let (buffer, _mock) = buffer_with_mock().await;
        buffer
            .apply_candle("mock", "BTC/USDT", "1m", candle(120_000, 101.0))
            .await;
        let update = buffer
            .apply_candle("mock", "BTC/USDT", "1m", candle(60_000, 99.0))
            .await;
        assert_eq!(update, BufferUpdate::Ignored);

        let window = buffer.latest("mock", "BTC/USDT", "1m").await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].close, 101.0);
    }

    #[tokio::test]
    async fn window_is_capped() {
        let (buffer, _mock) = buffer_with_mock().await;
        for i in 0..(MAX_CANDLES as i64 + 20) {
            buffer
                .apply_candle("mock", "BTC/USDT", "1m", candle(i * 60_000, i as f64))
                .await;
        }
        let window = buffer.latest("mock", "BTC/USDT", "1m").await;
        assert_eq!(window.len(), MAX_CANDLES);
        assert_eq!(window.last().unwrap().close, (MAX_CANDLES as f64) + 19.0);
    }
}
