/// Quote suffixes recognized when splitting a bare concatenated pair.
const KNOWN_QUOTES: [&str; 5] = ["USDT", "USDC", "BUSD", "BTC", "ETH"];

/// Normalize a user- or signal-provided symbol to `BASE/QUOTE`.
///
/// Upper-cases, maps `-` and `_` separators to `/`, and splits bare pairs
/// with a known quote suffix ("BTCUSDT" -> "BTC/USDT"). A bare string with
/// no recognizable quote becomes `UNKNOWN/USDT`, which no exchange lists,
/// so downstream symbol validation rejects it.
pub fn normalize_symbol(symbol: &str) -> String {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return "UNKNOWN/USDT".to_string();
    }

    let upper = trimmed.to_uppercase().replace(['-', '_'], "/");
    if upper.contains('/') {
        return upper;
    }

    for quote in KNOWN_QUOTES {
        if upper.ends_with(quote) && upper.len() > quote.len() {
            let base = &upper[..upper.len() - quote.len()];
            return format!("{base}/{quote}");
        }
    }

    "UNKNOWN/USDT".to_string()
}

/// Compact lowercase form used in exchange stream URLs ("BTC/USDT" -> "btcusdt").
pub fn stream_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_all_separator_variants() {
        assert_eq!(normalize_symbol("btc-usdt"), "BTC/USDT");
        assert_eq!(normalize_symbol("BTC_USDT"), "BTC/USDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTC/USDT");
        assert_eq!(normalize_symbol("btc/usdt"), "BTC/USDT");
    }

    #[test]
    fn unknown_bare_string_maps_to_unknown_pair() {
        assert_eq!(normalize_symbol("GIBBERISH"), "UNKNOWN/USDT");
        assert_eq!(normalize_symbol(""), "UNKNOWN/USDT");
        assert_eq!(normalize_symbol("  "), "UNKNOWN/USDT");
    }

    #[test]
    fn bare_quote_alone_is_not_a_pair() {
        assert_eq!(normalize_symbol("USDT"), "UNKNOWN/USDT");
    }

    #[test]
    fn stream_symbol_is_compact_lowercase() {
        assert_eq!(stream_symbol("BTC/USDT"), "btcusdt");
    }
}
