//! Scripted in-memory exchange used by tests and local simulation runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use common::{
    AssetBalance, Candle, Error, ExchangeAdapter, MarketInfo, OrderFill, Result, Side, Ticker,
};

/// Order recorded by the mock, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedOrder {
    pub symbol: String,
    pub side: Side,
    pub amount: f64,
    pub price: Option<f64>,
}

/// Fully scripted [`ExchangeAdapter`]: tests seed markets, candles, prices
/// and balances, then push stream events with `emit_*`. Watch calls replay
/// pushed events until the test drops its sender.
#[derive(Debug)]
pub struct MockExchange {
    id: String,
    markets: RwLock<HashMap<String, MarketInfo>>,
    candles: RwLock<HashMap<(String, String), Vec<Candle>>>,
    prices: RwLock<HashMap<String, f64>>,
    balances: RwLock<Vec<AssetBalance>>,
    orders: Mutex<Vec<RecordedOrder>>,
    /// When set, the next watch call fails once with a network error.
    fail_next_watch: Mutex<bool>,
    ticker_tx: broadcast::Sender<(String, Ticker)>,
    candle_tx: broadcast::Sender<(String, String, Candle)>,
}

impl MockExchange {
    pub fn new(id: impl Into<String>) -> Self {
        let (ticker_tx, _) = broadcast::channel(256);
        let (candle_tx, _) = broadcast::channel(256);
        Self {
            id: id.into(),
            markets: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            prices: RwLock::new(HashMap::new()),
            balances: RwLock::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            fail_next_watch: Mutex::new(false),
            ticker_tx,
            candle_tx,
        }
    }

    pub async fn list_market(&self, symbol: &str) {
        let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USDT"));
        self.markets.write().await.insert(
            symbol.to_string(),
            MarketInfo {
                symbol: symbol.to_string(),
                active: true,
                base: base.to_string(),
                quote: quote.to_string(),
                price_precision: Some(8),
                amount_precision: Some(8),
                min_cost: None,
            },
        );
    }

    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    pub async fn seed_candles(&self, symbol: &str, timeframe: &str, candles: Vec<Candle>) {
        self.candles
            .write()
            .await
            .insert((symbol.to_string(), timeframe.to_string()), candles);
    }

    pub async fn set_balances(&self, balances: Vec<AssetBalance>) {
        *self.balances.write().await = balances;
    }

    pub async fn fail_next_watch(&self) {
        *self.fail_next_watch.lock().await = true;
    }

    /// Push a live ticker into every active `watch_ticker`/`watch_trades`.
    pub async fn emit_ticker(&self, symbol: &str, last: f64, ts: DateTime<Utc>) {
        self.set_price(symbol, last).await;
        let _ = self.ticker_tx.send((symbol.to_string(), Ticker { last, ts }));
    }

    /// Push a live candle into every active `watch_ohlcv`.
    pub async fn emit_candle(&self, symbol: &str, timeframe: &str, candle: Candle) {
        let _ = self
            .candle_tx
            .send((symbol.to_string(), timeframe.to_string(), candle));
    }

    pub async fn recorded_orders(&self) -> Vec<RecordedOrder> {
        self.orders.lock().await.clone()
    }

    async fn check_watch_fault(&self) -> Result<()> {
        let mut flag = self.fail_next_watch.lock().await;
        if *flag {
            *flag = false;
            return Err(Error::Network("scripted watch failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn id(&self) -> &str {
        &self.id
    }

    async fn load_markets(&self) -> Result<HashMap<String, MarketInfo>> {
        Ok(self.markets.read().await.clone())
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.prices
            .read()
            .await
            .get(symbol)
            .map(|&last| Ticker { last, ts: Utc::now() })
            .ok_or_else(|| Error::SymbolNotFound(symbol.to_string()))
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let candles = self.candles.read().await;
        let all = candles
            .get(&(symbol.to_string(), timeframe.to_string()))
            .cloned()
            .unwrap_or_default();
        let skip = all.len().saturating_sub(limit as usize);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn watch_ticker(&self, symbol: &str, tx: mpsc::Sender<Ticker>) -> Result<()> {
        self.check_watch_fault().await?;
        let mut rx = self.ticker_tx.subscribe();
        loop {
            match rx.recv().await {
                Ok((sym, ticker)) if sym == symbol => {
                    if tx.send(ticker).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn watch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        tx: mpsc::Sender<Candle>,
    ) -> Result<()> {
        self.check_watch_fault().await?;
        let mut rx = self.candle_tx.subscribe();
        loop {
            match rx.recv().await {
                Ok((sym, tf, candle)) if sym == symbol && tf == timeframe => {
                    if tx.send(candle).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn watch_trades(&self, symbol: &str, tx: mpsc::Sender<Ticker>) -> Result<()> {
        // Trades replay the same scripted feed at full resolution.
        self.watch_ticker(symbol, tx).await
    }

    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: Option<f64>,
    ) -> Result<OrderFill> {
        let fill_price = match price {
            Some(p) => p,
            None => self
                .prices
                .read()
                .await
                .get(symbol)
                .copied()
                .ok_or_else(|| Error::Market(format!("no price seeded for {symbol}")))?,
        };

        self.orders.lock().await.push(RecordedOrder {
            symbol: symbol.to_string(),
            side,
            amount,
            price,
        });

        Ok(OrderFill {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            avg_fill_price: fill_price,
            filled_qty: amount,
            ts: Utc::now(),
        })
    }

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>> {
        Ok(self.balances.read().await.clone())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
