use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market segment a bot trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum MarketKind {
    Spot,
    Futures,
    Dex,
}

impl MarketKind {
    /// Tolerant parse for values coming from legacy documents and user input.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "FUTURES" | "FUTURE" | "SWAP" | "PERP" | "PERPETUAL" => MarketKind::Futures,
            "DEX" => MarketKind::Dex,
            _ => MarketKind::Spot,
        }
    }
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketKind::Spot => write!(f, "SPOT"),
            MarketKind::Futures => write!(f, "FUTURES"),
            MarketKind::Dex => write!(f, "DEX"),
        }
    }
}

/// Normalized market label used for virtual balances and stream keys.
///
/// All centralized-exchange segments (SPOT, CEX, FUTURES, SWAP, PERP in any
/// casing) collapse into `Cex`; only DEX stays separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum CanonicalMarket {
    Cex,
    Dex,
}

impl CanonicalMarket {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_uppercase().as_str() {
            "DEX" => CanonicalMarket::Dex,
            _ => CanonicalMarket::Cex,
        }
    }
}

impl From<MarketKind> for CanonicalMarket {
    fn from(kind: MarketKind) -> Self {
        match kind {
            MarketKind::Dex => CanonicalMarket::Dex,
            _ => CanonicalMarket::Cex,
        }
    }
}

impl std::fmt::Display for CanonicalMarket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanonicalMarket::Cex => write!(f, "CEX"),
            CanonicalMarket::Dex => write!(f, "DEX"),
        }
    }
}

/// Whether a bot mutates the virtual ledger or the real exchange account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TradeMode {
    Simulated,
    Real,
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeMode::Simulated => write!(f, "simulated"),
            TradeMode::Real => write!(f, "real"),
        }
    }
}

/// Lifecycle status of an autonomous bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum BotStatus {
    Active,
    Paused,
    Stopped,
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotStatus::Active => write!(f, "active"),
            BotStatus::Paused => write!(f, "paused"),
            BotStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Side of an order or an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Decision emitted by a strategy for one closed candle (or one price tick).
///
/// The classifier maps integer class ids onto this: 0 = Wait, 1 = Buy,
/// 2 = Sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSignal {
    Wait,
    Buy,
    Sell,
}

impl TradeSignal {
    pub fn from_class(class: i64) -> Self {
        match class {
            1 => TradeSignal::Buy,
            2 => TradeSignal::Sell,
            _ => TradeSignal::Wait,
        }
    }

    pub fn class(self) -> i64 {
        match self {
            TradeSignal::Wait => 0,
            TradeSignal::Buy => 1,
            TradeSignal::Sell => 2,
        }
    }

    /// `None` for `Wait`.
    pub fn side(self) -> Option<Side> {
        match self {
            TradeSignal::Wait => None,
            TradeSignal::Buy => Some(Side::Buy),
            TradeSignal::Sell => Some(Side::Sell),
        }
    }
}

/// Direction of an externally signalled (telegram) trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn entry_side(self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// One-sided comparison used for entry and take-profit triggers:
    /// LONG fills when price rises to the target, SHORT when it falls.
    pub fn target_reached(self, price: f64, target: f64) -> bool {
        match self {
            Direction::Long => price >= target,
            Direction::Short => price <= target,
        }
    }

    /// Stop-loss comparison, mirrored from `target_reached`.
    pub fn stop_reached(self, price: f64, stop: f64) -> bool {
        match self {
            Direction::Long => price <= stop,
            Direction::Short => price >= stop,
        }
    }

    /// Unrealized PnL percent relative to `entry`, sign-adjusted for side.
    pub fn pnl_pct(self, price: f64, entry: f64) -> f64 {
        if entry <= 0.0 {
            return 0.0;
        }
        match self {
            Direction::Long => (price - entry) / entry * 100.0,
            Direction::Short => (entry - price) / entry * 100.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// In-flight and terminal statuses of an external signal record. Signals are
/// never mutated after reaching a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum SignalStatus {
    Processing,
    Accepted,
    Rejected,
    RejectedUnsafe,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl SignalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SignalStatus::Rejected
                | SignalStatus::RejectedUnsafe
                | SignalStatus::Completed
                | SignalStatus::Failed
                | SignalStatus::Cancelled
        )
    }
}

/// Lifecycle of a per-signal telegram bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum TgBotStatus {
    WaitingEntry,
    Active,
    Closed,
    Expired,
    Cancelled,
}

impl TgBotStatus {
    pub fn is_live(self) -> bool {
        matches!(self, TgBotStatus::WaitingEntry | TgBotStatus::Active)
    }
}

/// Kind of a telegram trade item (one row per price level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TradeItemKind {
    Entry,
    Sl,
    Tp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TradeItemStatus {
    Active,
    Pending,
    Hit,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One OHLCV candle. `ts` is the candle's open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest trade price snapshot for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub ts: DateTime<Utc>,
}

/// Per-bot open position snapshot stored inline on the bot row.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub qty: f64,
    pub avg_price: f64,
}

impl PositionSnapshot {
    pub fn is_flat(&self) -> bool {
        self.qty <= 0.0
    }
}

/// Input to the execution engine: one actionable decision at one price.
#[derive(Debug, Clone)]
pub struct SignalData {
    pub signal: TradeSignal,
    pub price: f64,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    /// Alert signals come from a human-trusted source (e.g. a validated
    /// telegram entry trigger) and bypass the profit guard.
    pub is_alert: bool,
}

impl SignalData {
    pub fn auto(signal: TradeSignal, price: f64) -> Self {
        Self {
            signal,
            price,
            confidence: None,
            reasoning: None,
            is_alert: false,
        }
    }

    pub fn alert(signal: TradeSignal, price: f64) -> Self {
        Self {
            signal,
            price,
            confidence: None,
            reasoning: None,
            is_alert: true,
        }
    }
}

/// Fill confirmation for an exchange order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub avg_fill_price: f64,
    pub filled_qty: f64,
    pub ts: DateTime<Utc>,
}

/// Static description of one listed market, from `load_markets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub active: bool,
    pub base: String,
    pub quote: String,
    pub price_precision: Option<u32>,
    pub amount_precision: Option<u32>,
    pub min_cost: Option<f64>,
}

/// One asset's balance on an exchange account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub used: f64,
    pub total: f64,
}

/// Quote currency of a normalized `BASE/QUOTE` symbol; USDT when the symbol
/// has no separator.
pub fn quote_currency(symbol: &str) -> &str {
    symbol.split('/').nth(1).unwrap_or("USDT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_market_collapses_legacy_casings() {
        for label in ["SPOT", "spot", "CEX", "cex", "FUTURES", "swap", "PERP", "future"] {
            assert_eq!(CanonicalMarket::from_label(label), CanonicalMarket::Cex, "{label}");
        }
        assert_eq!(CanonicalMarket::from_label("DEX"), CanonicalMarket::Dex);
        assert_eq!(CanonicalMarket::from_label("dex"), CanonicalMarket::Dex);
    }

    #[test]
    fn trade_signal_class_round_trip() {
        for sig in [TradeSignal::Wait, TradeSignal::Buy, TradeSignal::Sell] {
            assert_eq!(TradeSignal::from_class(sig.class()), sig);
        }
        assert_eq!(TradeSignal::from_class(99), TradeSignal::Wait);
    }

    #[test]
    fn direction_triggers_are_one_sided() {
        assert!(Direction::Long.target_reached(101.0, 100.0));
        assert!(!Direction::Long.target_reached(99.9, 100.0));
        assert!(Direction::Short.target_reached(99.0, 100.0));
        assert!(Direction::Long.stop_reached(94.0, 95.0));
        assert!(Direction::Short.stop_reached(96.0, 95.0));
    }

    #[test]
    fn quote_currency_defaults_to_usdt() {
        assert_eq!(quote_currency("BTC/USDT"), "USDT");
        assert_eq!(quote_currency("ETH/BTC"), "BTC");
        assert_eq!(quote_currency("WEIRD"), "USDT");
    }
}
