use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Candle, CanonicalMarket};

/// Market data event fanned out by the stream service.
///
/// Ticker events may be throttled and dropped under load; candle events are
/// delivered in non-decreasing timestamp order and never dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Ticker {
        exchange: String,
        market: CanonicalMarket,
        symbol: String,
        last: f64,
        ts: DateTime<Utc>,
    },
    /// Partial candles allowed; a candle is "closed" once a candle with a
    /// strictly greater open timestamp arrives on the same key.
    Candle {
        exchange: String,
        market: CanonicalMarket,
        symbol: String,
        timeframe: String,
        candle: Candle,
    },
    /// One trade print; highest-resolution price source.
    Trade {
        exchange: String,
        market: CanonicalMarket,
        symbol: String,
        price: f64,
        ts: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn symbol(&self) -> &str {
        match self {
            StreamEvent::Ticker { symbol, .. }
            | StreamEvent::Candle { symbol, .. }
            | StreamEvent::Trade { symbol, .. } => symbol,
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            StreamEvent::Ticker { exchange, .. }
            | StreamEvent::Candle { exchange, .. }
            | StreamEvent::Trade { exchange, .. } => exchange,
        }
    }
}
