pub mod buffer;
pub mod key;
pub mod throttle;

pub use buffer::{BufferUpdate, DataBuffer};
pub use key::StreamKey;
pub use throttle::Throttle;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use common::{MarketKind, StreamEvent, Ticker};
use exchange::ExchangeHub;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Fan-out capacity for candle events. Candles must never be dropped, so the
/// buffer is sized far above any realistic burst; ticker events are already
/// throttled and may lag.
const CANDLE_CHANNEL_CAPACITY: usize = 4096;
const TICKER_CHANNEL_CAPACITY: usize = 256;

struct StreamTask {
    handle: JoinHandle<()>,
    subscribers: usize,
}

/// Orchestrates per-key exchange stream tasks.
///
/// One task runs per unique [`StreamKey`]; a second subscription to the same
/// key is a no-op apart from the reference count. Every task reconnects on
/// failure with exponential backoff (1 s doubling to 30 s, reset after any
/// forwarded event) and closes its exchange handle before retrying.
pub struct MarketStreamService {
    hub: Arc<ExchangeHub>,
    tasks: Mutex<HashMap<StreamKey, StreamTask>>,
    latest: Arc<RwLock<HashMap<StreamKey, Ticker>>>,
    ticker_tx: broadcast::Sender<StreamEvent>,
    candle_tx: broadcast::Sender<StreamEvent>,
}

impl MarketStreamService {
    pub fn new(hub: Arc<ExchangeHub>) -> Self {
        let (ticker_tx, _) = broadcast::channel(TICKER_CHANNEL_CAPACITY);
        let (candle_tx, _) = broadcast::channel(CANDLE_CHANNEL_CAPACITY);
        Self {
            hub,
            tasks: Mutex::new(HashMap::new()),
            latest: Arc::new(RwLock::new(HashMap::new())),
            ticker_tx,
            candle_tx,
        }
    }

    /// Throttled ticker and trade-print events.
    pub fn tickers(&self) -> broadcast::Receiver<StreamEvent> {
        self.ticker_tx.subscribe()
    }

    /// Unthrottled candle events, non-decreasing timestamps per key.
    pub fn candles(&self) -> broadcast::Receiver<StreamEvent> {
        self.candle_tx.subscribe()
    }

    /// Last observed ticker for a key, if the task has seen one.
    pub async fn latest_ticker(&self, key: &StreamKey) -> Option<Ticker> {
        self.latest.read().await.get(key).copied()
    }

    pub async fn subscribe_ticker(
        &self,
        exchange: &str,
        kind: MarketKind,
        symbol: &str,
    ) -> StreamKey {
        let key = StreamKey::ticker(exchange, kind, symbol);
        self.spawn_if_absent(key.clone(), || {
            tokio::spawn(ticker_loop(
                self.hub.clone(),
                kind,
                key.clone(),
                self.latest.clone(),
                self.ticker_tx.clone(),
            ))
        })
        .await;
        key
    }

    pub async fn subscribe_candles(
        &self,
        exchange: &str,
        kind: MarketKind,
        symbol: &str,
        timeframe: &str,
    ) -> StreamKey {
        let key = StreamKey::ohlcv(exchange, kind, symbol, timeframe);
        self.spawn_if_absent(key.clone(), || {
            tokio::spawn(ohlcv_loop(
                self.hub.clone(),
                kind,
                key.clone(),
                self.candle_tx.clone(),
            ))
        })
        .await;
        key
    }

    /// High-resolution trade prints; feeds the same latest-price cache as the
    /// ticker key so proximity checks see trade-level freshness.
    pub async fn subscribe_trades(
        &self,
        exchange: &str,
        kind: MarketKind,
        symbol: &str,
    ) -> StreamKey {
        let key = StreamKey::trades(exchange, kind, symbol);
        let ticker_key = StreamKey::ticker(exchange, kind, symbol);
        self.spawn_if_absent(key.clone(), || {
            tokio::spawn(trades_loop(
                self.hub.clone(),
                kind,
                key.clone(),
                ticker_key,
                self.latest.clone(),
                self.ticker_tx.clone(),
            ))
        })
        .await;
        key
    }

    async fn spawn_if_absent<F>(&self, key: StreamKey, spawn: F)
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(&key) {
            task.subscribers += 1;
            return;
        }
        info!(key = %key, "Stream subscription activated");
        tasks.insert(
            key,
            StreamTask {
                handle: spawn(),
                subscribers: 1,
            },
        );
    }

    /// Drop one subscriber; the task is cancelled only when none remain.
    /// Unknown keys are a no-op.
    pub async fn unsubscribe(&self, key: &StreamKey) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.get_mut(key) {
            task.subscribers = task.subscribers.saturating_sub(1);
            if task.subscribers == 0 {
                let task = tasks.remove(key).expect("entry present");
                task.handle.abort();
                info!(key = %key, "Stream subscription deactivated");
            }
        }
    }

    pub async fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.tasks
            .lock()
            .await
            .get(key)
            .map(|t| t.subscribers)
            .unwrap_or(0)
    }

    pub async fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tasks.lock().await.keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    /// Cancel every task and close all exchange handles.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (key, task) in tasks.drain() {
            task.handle.abort();
            info!(key = %key, "Stream task cancelled on shutdown");
        }
        drop(tasks);
        self.hub.close_all().await;
    }
}

// ─── Stream loops ─────────────────────────────────────────────────────────────

async fn ticker_loop(
    hub: Arc<ExchangeHub>,
    kind: MarketKind,
    key: StreamKey,
    latest: Arc<RwLock<HashMap<StreamKey, Ticker>>>,
    events: broadcast::Sender<StreamEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut throttle = Throttle::ticker();

    loop {
        let adapter = match hub.public(key.exchange(), kind).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(key = %key, error = %e, "Exchange unavailable, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Ticker>(64);
        let symbol = key.symbol().to_string();
        let watch = adapter.watch_ticker(&symbol, tx);
        tokio::pin!(watch);

        let mut failed = false;
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(ticker) => {
                        latest.write().await.insert(key.clone(), ticker);
                        if throttle.allow() {
                            let _ = events.send(StreamEvent::Ticker {
                                exchange: key.exchange().to_string(),
                                market: key.market(),
                                symbol: symbol.clone(),
                                last: ticker.last,
                                ts: ticker.ts,
                            });
                        }
                        backoff = INITIAL_BACKOFF;
                    }
                    None => break,
                },
                res = &mut watch => {
                    if let Err(e) = res {
                        warn!(key = %key, error = %e, backoff = ?backoff, "Ticker stream error, reconnecting");
                        failed = true;
                    }
                    break;
                }
            }
        }

        if let Err(e) = adapter.close().await {
            warn!(key = %key, error = %e, "Failed closing exchange handle");
        }
        tokio::time::sleep(if failed { backoff } else { INITIAL_BACKOFF }).await;
        if failed {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

async fn ohlcv_loop(
    hub: Arc<ExchangeHub>,
    kind: MarketKind,
    key: StreamKey,
    events: broadcast::Sender<StreamEvent>,
) {
    let timeframe = match &key {
        StreamKey::Ohlcv { timeframe, .. } => timeframe.clone(),
        _ => return,
    };
    let mut backoff = INITIAL_BACKOFF;
    // Out-of-order candles for the same key are dropped.
    let mut last_ts: Option<DateTime<Utc>> = None;

    loop {
        let adapter = match hub.public(key.exchange(), kind).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(key = %key, error = %e, "Exchange unavailable, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let (tx, mut rx) = mpsc::channel::<common::Candle>(256);
        let symbol = key.symbol().to_string();
        let watch = adapter.watch_ohlcv(&symbol, &timeframe, tx);
        tokio::pin!(watch);

        let mut failed = false;
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(candle) => {
                        if last_ts.map(|ts| candle.ts < ts).unwrap_or(false) {
                            continue;
                        }
                        last_ts = Some(candle.ts);
                        let _ = events.send(StreamEvent::Candle {
                            exchange: key.exchange().to_string(),
                            market: key.market(),
                            symbol: symbol.clone(),
                            timeframe: timeframe.clone(),
                            candle,
                        });
                        backoff = INITIAL_BACKOFF;
                    }
                    None => break,
                },
                res = &mut watch => {
                    if let Err(e) = res {
                        warn!(key = %key, error = %e, backoff = ?backoff, "Candle stream error, reconnecting");
                        failed = true;
                    }
                    break;
                }
            }
        }

        if let Err(e) = adapter.close().await {
            warn!(key = %key, error = %e, "Failed closing exchange handle");
        }
        tokio::time::sleep(if failed { backoff } else { INITIAL_BACKOFF }).await;
        if failed {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

async fn trades_loop(
    hub: Arc<ExchangeHub>,
    kind: MarketKind,
    key: StreamKey,
    ticker_key: StreamKey,
    latest: Arc<RwLock<HashMap<StreamKey, Ticker>>>,
    events: broadcast::Sender<StreamEvent>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let adapter = match hub.public(key.exchange(), kind).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(key = %key, error = %e, "Exchange unavailable, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let (tx, mut rx) = mpsc::channel::<Ticker>(256);
        let symbol = key.symbol().to_string();
        let watch = adapter.watch_trades(&symbol, tx);
        tokio::pin!(watch);

        let mut failed = false;
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(print) => {
                        // Refresh the ticker cache so proximity checks see
                        // trade-level resolution.
                        latest.write().await.insert(ticker_key.clone(), print);
                        let _ = events.send(StreamEvent::Trade {
                            exchange: key.exchange().to_string(),
                            market: key.market(),
                            symbol: symbol.clone(),
                            price: print.last,
                            ts: print.ts,
                        });
                        backoff = INITIAL_BACKOFF;
                    }
                    None => break,
                },
                res = &mut watch => {
                    if let Err(e) = res {
                        warn!(key = %key, error = %e, backoff = ?backoff, "Trades stream error, reconnecting");
                        failed = true;
                    }
                    break;
                }
            }
        }

        if let Err(e) = adapter.close().await {
            warn!(key = %key, error = %e, "Failed closing exchange handle");
        }
        tokio::time::sleep(if failed { backoff } else { INITIAL_BACKOFF }).await;
        if failed {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
