use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;
use url::Url;

use common::{Candle, Error, MarketKind, Result, Ticker};

use crate::symbol::stream_symbol;

const SPOT_WS: &str = "wss://stream.binance.com:9443/ws";
const FUTURES_WS: &str = "wss://fstream.binance.com/ws";

/// No message within this window counts as a dead connection.
const RECV_TIMEOUT: Duration = Duration::from_secs(30);

fn ws_base(market: MarketKind) -> &'static str {
    match market {
        MarketKind::Futures => FUTURES_WS,
        _ => SPOT_WS,
    }
}

/// Drive one WebSocket connection for `channel` and map every text frame
/// through `parse`, pushing hits into `tx`. Returns `Ok(())` once the
/// receiver is dropped, `Err` on connection failure; the caller owns
/// reconnection.
async fn watch<T, F>(market: MarketKind, channel: String, tx: mpsc::Sender<T>, parse: F) -> Result<()>
where
    F: Fn(&str) -> Result<Option<T>>,
{
    let url_str = format!("{}/{channel}", ws_base(market));
    let url = Url::parse(&url_str).map_err(|e| Error::WebSocket(e.to_string()))?;

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))?;
    let (_, mut read) = ws_stream.split();

    loop {
        let msg = match tokio::time::timeout(RECV_TIMEOUT, read.next()).await {
            Ok(Some(msg)) => msg.map_err(|e| Error::WebSocket(e.to_string()))?,
            Ok(None) => return Err(Error::WebSocket("stream closed by exchange".into())),
            Err(_) => return Err(Error::Network("watch recv timed out".into())),
        };

        if let Message::Text(text) = msg {
            match parse(&text) {
                Ok(Some(item)) => {
                    if tx.send(item).await.is_err() {
                        // Receiver gone — subscription was cancelled.
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to parse stream message"),
            }
        }
    }
}

pub async fn watch_ticker(
    market: MarketKind,
    symbol: &str,
    tx: mpsc::Sender<Ticker>,
) -> Result<()> {
    let channel = format!("{}@ticker", stream_symbol(symbol));
    watch(market, channel, tx, parse_ticker_event).await
}

pub async fn watch_ohlcv(
    market: MarketKind,
    symbol: &str,
    timeframe: &str,
    tx: mpsc::Sender<Candle>,
) -> Result<()> {
    let channel = format!("{}@kline_{timeframe}", stream_symbol(symbol));
    watch(market, channel, tx, parse_kline_event).await
}

pub async fn watch_trades(
    market: MarketKind,
    symbol: &str,
    tx: mpsc::Sender<Ticker>,
) -> Result<()> {
    let channel = format!("{}@trade", stream_symbol(symbol));
    watch(market, channel, tx, parse_trade_event).await
}

// ─── Stream JSON parsing ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct KlineWrapper {
    k: KlineData,
}

#[derive(Deserialize)]
struct KlineData {
    #[serde(rename = "t")]
    open_time_ms: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
}

fn parse_kline_event(text: &str) -> Result<Option<Candle>> {
    let wrapper: serde_json::Value = serde_json::from_str(text)?;
    if wrapper.get("e").and_then(|v| v.as_str()) != Some("kline") {
        return Ok(None);
    }

    let kline: KlineWrapper = serde_json::from_value(wrapper)?;
    let k = kline.k;

    Ok(Some(Candle {
        ts: ms_to_utc(k.open_time_ms),
        open: k.open.parse().unwrap_or(0.0),
        high: k.high.parse().unwrap_or(0.0),
        low: k.low.parse().unwrap_or(0.0),
        close: k.close.parse().unwrap_or(0.0),
        volume: k.volume.parse().unwrap_or(0.0),
    }))
}

#[derive(Deserialize)]
struct TickerEvent {
    #[serde(rename = "c")]
    last: String,
    #[serde(rename = "E")]
    event_time_ms: i64,
}

fn parse_ticker_event(text: &str) -> Result<Option<Ticker>> {
    let wrapper: serde_json::Value = serde_json::from_str(text)?;
    if wrapper.get("e").and_then(|v| v.as_str()) != Some("24hrTicker") {
        return Ok(None);
    }

    let event: TickerEvent = serde_json::from_value(wrapper)?;
    Ok(Some(Ticker {
        last: event.last.parse().unwrap_or(0.0),
        ts: ms_to_utc(event.event_time_ms),
    }))
}

#[derive(Deserialize)]
struct TradeEvent {
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    trade_time_ms: i64,
}

fn parse_trade_event(text: &str) -> Result<Option<Ticker>> {
    let wrapper: serde_json::Value = serde_json::from_str(text)?;
    if wrapper.get("e").and_then(|v| v.as_str()) != Some("trade") {
        return Ok(None);
    }

    let event: TradeEvent = serde_json::from_value(wrapper)?;
    Ok(Some(Ticker {
        last: event.price.parse().unwrap_or(0.0),
        ts: ms_to_utc(event.trade_time_ms),
    }))
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_event_parses_open_time_and_ohlcv() {
        let text = r#"{"e":"kline","E":1700000000500,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"o":"100.0","h":"101.5","l":"99.5","c":"101.0","v":"12.5","x":false}}"#;
        let candle = parse_kline_event(text).unwrap().expect("kline event");
        assert_eq!(candle.ts.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.close, 101.0);
        assert_eq!(candle.volume, 12.5);
    }

    #[test]
    fn non_kline_messages_are_skipped() {
        let text = r#"{"result":null,"id":1}"#;
        assert!(parse_kline_event(text).unwrap().is_none());
    }

    #[test]
    fn trade_event_parses_price() {
        let text = r#"{"e":"trade","E":1700000001000,"s":"BTCUSDT","p":"100.25","q":"0.5","T":1700000000900}"#;
        let tick = parse_trade_event(text).unwrap().expect("trade event");
        assert_eq!(tick.last, 100.25);
    }
}
