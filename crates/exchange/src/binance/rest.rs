use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use common::{AssetBalance, Candle, Error, MarketInfo, MarketKind, OrderFill, Result, Side, Ticker};

use crate::symbol::stream_symbol;

const SPOT_URL: &str = "https://api.binance.com";
const FUTURES_URL: &str = "https://fapi.binance.com";
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST API client for Binance spot and USD-M futures. Used for history,
/// markets, order placement and account queries.
#[derive(Debug)]
pub struct BinanceRest {
    market: MarketKind,
    credentials: Option<(String, String)>,
    http: Client,
}

impl BinanceRest {
    pub fn new(market: MarketKind, credentials: Option<(String, String)>) -> Self {
        Self {
            market,
            credentials,
            http: Client::builder()
                .use_rustls_tls()
                .timeout(REST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn base_url(&self) -> &'static str {
        match self.market {
            MarketKind::Futures => FUTURES_URL,
            _ => SPOT_URL,
        }
    }

    fn api_prefix(&self) -> &'static str {
        match self.market {
            MarketKind::Futures => "/fapi/v1",
            _ => "/api/v3",
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn keys(&self) -> Result<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(k, s)| (k.as_str(), s.as_str()))
            .ok_or_else(|| Error::Auth("no credentials configured for private endpoint".into()))
    }

    fn sign(&self, secret: &str, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Map an HTTP failure to the retry taxonomy: 429/418 rate limit,
    /// 401/403 auth, everything else a market error with the body attached.
    fn classify(status: reqwest::StatusCode, body: &str) -> Error {
        match status.as_u16() {
            429 | 418 => Error::RateLimit(format!("HTTP {status}: {body}")),
            401 | 403 => Error::Auth(format!("HTTP {status}: {body}")),
            _ if status.is_server_error() => Error::Network(format!("HTTP {status}: {body}")),
            _ if body.contains("-1121") || body.contains("Invalid symbol") => {
                Error::SymbolNotFound(body.to_string())
            }
            _ => Error::Market(format!("HTTP {status}: {body}")),
        }
    }

    async fn public_get(&self, path: &str, params: &str) -> Result<String> {
        let url = if params.is_empty() {
            format!("{}{}{path}", self.base_url(), self.api_prefix())
        } else {
            format!("{}{}{path}?{params}", self.base_url(), self.api_prefix())
        };
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::classify(status, &body));
        }
        Ok(body)
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<String> {
        let (api_key, secret) = self.keys()?;
        let ts = Self::timestamp_ms();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = self.sign(secret, &query);
        let url = format!(
            "{}{}{path}?{query}&signature={signature}",
            self.base_url(),
            self.api_prefix()
        );

        let resp = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::classify(status, &body));
        }
        Ok(body)
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<String> {
        let (api_key, secret) = self.keys()?;
        let ts = Self::timestamp_ms();
        let query = format!("{params}&timestamp={ts}");
        let signature = self.sign(secret, &query);
        let body = format!("{query}&signature={signature}");
        let url = format!("{}{}{path}", self.base_url(), self.api_prefix());

        let resp = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| Error::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::classify(status, &text));
        }
        Ok(text)
    }

    pub async fn load_markets(&self) -> Result<HashMap<String, MarketInfo>> {
        let body = self.public_get("/exchangeInfo", "").await?;
        let info: ExchangeInfo =
            serde_json::from_str(&body).map_err(|e| Error::Market(e.to_string()))?;

        let mut markets = HashMap::new();
        for sym in info.symbols {
            let normalized = format!("{}/{}", sym.base_asset, sym.quote_asset);
            markets.insert(
                normalized.clone(),
                MarketInfo {
                    symbol: normalized,
                    active: sym.status.as_deref() == Some("TRADING")
                        || sym.contract_status.as_deref() == Some("TRADING"),
                    base: sym.base_asset,
                    quote: sym.quote_asset,
                    price_precision: sym.quote_precision,
                    amount_precision: sym.base_asset_precision,
                    min_cost: None,
                },
            );
        }
        Ok(markets)
    }

    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let params = format!("symbol={}", stream_symbol(symbol).to_uppercase());
        let body = self.public_get("/ticker/price", &params).await?;
        let ticker: PriceTicker =
            serde_json::from_str(&body).map_err(|e| Error::Market(e.to_string()))?;
        Ok(Ticker {
            last: ticker
                .price
                .parse::<f64>()
                .map_err(|e| Error::Market(e.to_string()))?,
            ts: Utc::now(),
        })
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let mut params = format!(
            "symbol={}&interval={timeframe}&limit={limit}",
            stream_symbol(symbol).to_uppercase()
        );
        if let Some(since) = since {
            params.push_str(&format!("&startTime={}", since.timestamp_millis()));
        }
        let body = self.public_get("/klines", &params).await?;

        // Kline rows are heterogeneous arrays: [openTime, "o", "h", "l", "c", "v", ...]
        let rows: Vec<Vec<serde_json::Value>> =
            serde_json::from_str(&body).map_err(|e| Error::Market(e.to_string()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() < 6 {
                continue;
            }
            let ts_ms = row[0].as_i64().unwrap_or(0);
            let ts = Utc
                .timestamp_millis_opt(ts_ms)
                .single()
                .ok_or_else(|| Error::Market(format!("bad kline timestamp {ts_ms}")))?;
            candles.push(Candle {
                ts,
                open: field_f64(&row[1]),
                high: field_f64(&row[2]),
                low: field_f64(&row[3]),
                close: field_f64(&row[4]),
                volume: field_f64(&row[5]),
            });
        }
        Ok(candles)
    }

    pub async fn create_order(
        &self,
        symbol: &str,
        side: Side,
        amount: f64,
        price: Option<f64>,
    ) -> Result<OrderFill> {
        let order_type = if price.is_some() { "LIMIT" } else { "MARKET" };
        let mut params = format!(
            "symbol={}&side={side}&type={order_type}&quantity={amount}",
            stream_symbol(symbol).to_uppercase()
        );
        if let Some(price) = price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }

        debug!(symbol = %symbol, side = %side, qty = amount, "Submitting order to Binance");
        let body = self.signed_post("/order", &params).await?;

        let resp: OrderResponse =
            serde_json::from_str(&body).map_err(|e| Error::Market(e.to_string()))?;

        // Average the partial fills; fall back to the requested limit price.
        let (fill_qty, fill_notional) = resp.fills.iter().fold((0.0, 0.0), |(q, n), f| {
            let qty = f.qty.parse::<f64>().unwrap_or(0.0);
            let px = f.price.parse::<f64>().unwrap_or(0.0);
            (q + qty, n + qty * px)
        });
        let avg_fill_price = if fill_qty > 0.0 {
            fill_notional / fill_qty
        } else {
            price.unwrap_or(0.0)
        };

        Ok(OrderFill {
            order_id: resp.client_order_id,
            symbol: symbol.to_string(),
            side,
            avg_fill_price,
            filled_qty: if fill_qty > 0.0 { fill_qty } else { amount },
            ts: Utc::now(),
        })
    }

    pub async fn fetch_balance(&self) -> Result<Vec<AssetBalance>> {
        let body = self.signed_get("/account", "").await?;
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|e| Error::Market(e.to_string()))?;

        Ok(account
            .balances
            .into_iter()
            .map(|b| {
                let free = b.free.parse::<f64>().unwrap_or(0.0);
                let used = b.locked.parse::<f64>().unwrap_or(0.0);
                AssetBalance {
                    asset: b.asset,
                    free,
                    used,
                    total: free + used,
                }
            })
            .collect())
    }
}

fn field_f64(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_status: Option<String>,
    #[serde(default)]
    base_asset_precision: Option<u32>,
    #[serde(default)]
    quote_precision: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    client_order_id: String,
    #[serde(default)]
    fills: Vec<FillDetail>,
}

#[derive(Deserialize)]
struct FillDetail {
    price: String,
    qty: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Deserialize)]
struct Balance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Deserialize)]
struct PriceTicker {
    price: String,
}
