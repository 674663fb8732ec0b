use common::CanonicalMarket;

/// Identity of one underlying exchange stream task.
///
/// Grammar:
/// ```text
/// ticker:<exchange>:<canonicalMarket>:<symbol>
/// ohlcv:<exchange>:<canonicalMarket>:<symbol>:<timeframe>
/// trades:<exchange>:<canonicalMarket>:<symbol>
/// ```
///
/// The market label is collapsed the same way virtual balances collapse it,
/// so "SPOT", "spot" and "CEX" subscriptions land on one shared task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    Ticker {
        exchange: String,
        market: CanonicalMarket,
        symbol: String,
    },
    Ohlcv {
        exchange: String,
        market: CanonicalMarket,
        symbol: String,
        timeframe: String,
    },
    Trades {
        exchange: String,
        market: CanonicalMarket,
        symbol: String,
    },
}

impl StreamKey {
    pub fn ticker(exchange: &str, market: impl Into<CanonicalMarket>, symbol: &str) -> Self {
        StreamKey::Ticker {
            exchange: exchange.to_lowercase(),
            market: market.into(),
            symbol: symbol.to_string(),
        }
    }

    pub fn ohlcv(
        exchange: &str,
        market: impl Into<CanonicalMarket>,
        symbol: &str,
        timeframe: &str,
    ) -> Self {
        StreamKey::Ohlcv {
            exchange: exchange.to_lowercase(),
            market: market.into(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
        }
    }

    pub fn trades(exchange: &str, market: impl Into<CanonicalMarket>, symbol: &str) -> Self {
        StreamKey::Trades {
            exchange: exchange.to_lowercase(),
            market: market.into(),
            symbol: symbol.to_string(),
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            StreamKey::Ticker { exchange, .. }
            | StreamKey::Ohlcv { exchange, .. }
            | StreamKey::Trades { exchange, .. } => exchange,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            StreamKey::Ticker { symbol, .. }
            | StreamKey::Ohlcv { symbol, .. }
            | StreamKey::Trades { symbol, .. } => symbol,
        }
    }

    pub fn market(&self) -> CanonicalMarket {
        match self {
            StreamKey::Ticker { market, .. }
            | StreamKey::Ohlcv { market, .. }
            | StreamKey::Trades { market, .. } => *market,
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKey::Ticker { exchange, market, symbol } => {
                write!(f, "ticker:{exchange}:{market}:{symbol}")
            }
            StreamKey::Ohlcv { exchange, market, symbol, timeframe } => {
                write!(f, "ohlcv:{exchange}:{market}:{symbol}:{timeframe}")
            }
            StreamKey::Trades { exchange, market, symbol } => {
                write!(f, "trades:{exchange}:{market}:{symbol}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MarketKind;

    #[test]
    fn display_follows_key_grammar() {
        let key = StreamKey::ticker("Binance", MarketKind::Spot, "BTC/USDT");
        assert_eq!(key.to_string(), "ticker:binance:CEX:BTC/USDT");

        let key = StreamKey::ohlcv("binance", MarketKind::Futures, "ETH/USDT", "15m");
        assert_eq!(key.to_string(), "ohlcv:binance:CEX:ETH/USDT:15m");

        let key = StreamKey::trades("binance", MarketKind::Dex, "SOL/USDT");
        assert_eq!(key.to_string(), "trades:binance:DEX:SOL/USDT");
    }

    #[test]
    fn casing_variants_collapse_to_one_key() {
        let a = StreamKey::ticker("binance", CanonicalMarket::from_label("spot"), "BTC/USDT");
        let b = StreamKey::ticker("BINANCE", CanonicalMarket::from_label("CEX"), "BTC/USDT");
        let c = StreamKey::ticker("binance", MarketKind::Futures, "BTC/USDT");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }
}
