use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{AssetBalance, Candle, MarketInfo, OrderFill, Result, Side, Ticker};

/// Uniform port over heterogeneous exchanges, for SPOT and FUTURES markets.
///
/// A public (credential-less) instance serves tickers and history for all
/// users; per-user instances built from the active credential serve orders
/// and balances. Only the execution engine submits orders.
///
/// The `watch_*` methods drive one WebSocket connection and push every item
/// into `tx` until the connection drops (`Err`) or the receiver is gone
/// (`Ok`). Callers own reconnection; dropping the receiving task cancels the
/// watch.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync + std::fmt::Debug {
    /// Exchange identifier, e.g. "binance".
    fn id(&self) -> &str;

    async fn load_markets(&self) -> Result<HashMap<String, MarketInfo>>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>>;

    async fn watch_ticker(&self, symbol: &str, tx: mpsc::Sender<Ticker>) -> Result<()>;

    /// Streams partial and closed candles. A candle is closed once a later
    /// open timestamp arrives.
    async fn watch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        tx: mpsc::Sender<Candle>,
    ) -> Result<()>;

    /// Streams individual trade prints as price snapshots (max resolution).
    async fn watch_trades(&self, symbol: &str, tx: mpsc::Sender<Ticker>) -> Result<()>;

    /// `price: None` submits a market order.
    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: Option<f64>,
    ) -> Result<OrderFill>;

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>>;

    /// Release any live connection state. Stream loops call this before
    /// reconnecting; the process calls it on shutdown.
    async fn close(&self) -> Result<()>;
}
