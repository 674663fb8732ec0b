mod rest;
mod ws;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use common::{
    AssetBalance, Candle, Error, ExchangeAdapter, MarketInfo, MarketKind, OrderFill, Result, Side,
    Ticker,
};

use crate::symbol::normalize_symbol;

pub use rest::BinanceRest;

/// Binance adapter covering spot and USD-M futures.
///
/// A credential-less instance is shared by all users for public data; a
/// per-user instance carries the active credential for orders and balances.
#[derive(Debug)]
pub struct BinanceAdapter {
    market: MarketKind,
    rest: BinanceRest,
}

impl BinanceAdapter {
    pub fn public(market: MarketKind) -> Self {
        Self {
            market,
            rest: BinanceRest::new(market, None),
        }
    }

    pub fn with_credentials(
        market: MarketKind,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            market,
            rest: BinanceRest::new(market, Some((api_key.into(), secret.into()))),
        }
    }

    fn check_symbol(symbol: &str) -> Result<String> {
        let normalized = normalize_symbol(symbol);
        if normalized.starts_with("UNKNOWN/") {
            return Err(Error::SymbolNotFound(symbol.to_string()));
        }
        Ok(normalized)
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> &str {
        "binance"
    }

    async fn load_markets(&self) -> Result<HashMap<String, MarketInfo>> {
        self.rest.load_markets().await
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let symbol = Self::check_symbol(symbol)?;
        self.rest.fetch_ticker(&symbol).await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let symbol = Self::check_symbol(symbol)?;
        self.rest.fetch_ohlcv(&symbol, timeframe, limit, since).await
    }

    async fn watch_ticker(&self, symbol: &str, tx: mpsc::Sender<Ticker>) -> Result<()> {
        let symbol = Self::check_symbol(symbol)?;
        ws::watch_ticker(self.market, &symbol, tx).await
    }

    async fn watch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        tx: mpsc::Sender<Candle>,
    ) -> Result<()> {
        let symbol = Self::check_symbol(symbol)?;
        ws::watch_ohlcv(self.market, &symbol, timeframe, tx).await
    }

    async fn watch_trades(&self, symbol: &str, tx: mpsc::Sender<Ticker>) -> Result<()> {
        let symbol = Self::check_symbol(symbol)?;
        ws::watch_trades(self.market, &symbol, tx).await
    }

    async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: Option<f64>,
    ) -> Result<OrderFill> {
        let symbol = Self::check_symbol(symbol)?;
        self.rest.create_order(&symbol, side, amount, price).await
    }

    async fn fetch_balance(&self) -> Result<Vec<AssetBalance>> {
        self.rest.fetch_balance().await
    }

    async fn close(&self) -> Result<()> {
        // WebSocket connections are owned by the individual watch calls and
        // die with them; REST keeps no session state.
        Ok(())
    }
}
