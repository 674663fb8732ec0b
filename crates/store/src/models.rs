use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use common::{
    BotStatus, Candle, CanonicalMarket, Direction, MarketKind, PositionSnapshot, PositionStatus,
    Side, SignalStatus, TgBotStatus, TradeItemKind, TradeItemStatus, TradeMode,
};

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub open_id: String,
    pub hashed_secret: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExchangeCredentialRow {
    pub id: String,
    pub user_id: String,
    pub exchange_id: String,
    pub api_key: String,
    pub secret: String,
    pub passphrase: Option<String>,
    pub uid: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Autonomous bot instance; exclusively owned by its user. Positions, trades,
/// feature state and telegram items back-reference the bot by id only.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotInstance {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub symbol: String,
    pub timeframe: String,
    pub market_type: MarketKind,
    pub exchange_id: String,
    pub strategy_name: String,
    pub mode: TradeMode,
    pub status: BotStatus,
    pub amount: f64,
    pub side: Option<Side>,
    pub position_qty: f64,
    pub position_avg_price: f64,
    pub wallet_allocated: f64,
    pub wallet_available: f64,
    pub wallet_realized_pnl: f64,
    pub total_pnl: f64,
    pub last_candle_ts: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BotInstance {
    pub fn position(&self) -> PositionSnapshot {
        PositionSnapshot {
            qty: self.position_qty,
            avg_price: self.position_avg_price,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.position_qty <= 0.0
    }

    pub fn canonical_market(&self) -> CanonicalMarket {
        self.market_type.into()
    }

    /// `qty == 0 ⇔ side == NONE` must hold on every persisted bot.
    pub fn position_invariant_holds(&self) -> bool {
        (self.position_qty <= 0.0) == self.side.is_none()
    }
}

/// Canonical live position; at most one OPEN row per bot.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRow {
    pub id: String,
    pub bot_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub current_qty: f64,
    pub avg_entry_price: f64,
    pub invested_amount: f64,
    pub realized_pnl: f64,
    pub roi: f64,
    pub total_trades: i64,
    pub status: PositionStatus,
    pub final_pnl: Option<f64>,
    pub exit_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit row, one per execution.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRow {
    pub id: String,
    pub bot_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub pnl: f64,
    pub mode: TradeMode,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualBalance {
    pub id: String,
    pub user_id: String,
    pub market_type: CanonicalMarket,
    pub asset: String,
    pub amount: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRow {
    pub id: String,
    pub user_id: String,
    pub source: String,
    pub raw_text: String,
    pub status: SignalStatus,
    pub symbol: Option<String>,
    pub market_type: Option<String>,
    pub direction: Option<Direction>,
    pub decision: Option<String>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    pub trade_id: Option<String>,
    pub execution_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One take-profit rung in a telegram bot's ladder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TakeProfitLevel {
    pub price: f64,
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
    pub status: TradeItemStatus,
}

/// Trade-plan snapshot stored on the telegram bot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TgBotConfig {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investment: Option<f64>,
}

impl TgBotConfig {
    pub fn investment_or_default(&self) -> f64 {
        self.investment.unwrap_or(100.0)
    }
}

/// Per-signal telegram bot (1:1 with the accepted signal).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramBot {
    pub id: String,
    pub user_id: String,
    pub source: String,
    pub chat_id: Option<String>,
    pub symbol: String,
    pub side: Direction,
    pub market_type: MarketKind,
    pub exchange_id: String,
    pub mode: TradeMode,
    pub status: TgBotStatus,
    pub config: TgBotConfig,
    pub actual_entry_price: Option<f64>,
    pub current_price: Option<f64>,
    pub pnl: f64,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry_handled_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw telegram bot row before the config JSON is decoded.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct TelegramBotRaw {
    pub id: String,
    pub user_id: String,
    pub source: String,
    pub chat_id: Option<String>,
    pub symbol: String,
    pub side: Direction,
    pub market_type: MarketKind,
    pub exchange_id: String,
    pub mode: TradeMode,
    pub status: TgBotStatus,
    pub config: String,
    pub actual_entry_price: Option<f64>,
    pub current_price: Option<f64>,
    pub pnl: f64,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry_handled_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TelegramBotRaw> for TelegramBot {
    type Error = common::Error;

    fn try_from(raw: TelegramBotRaw) -> common::Result<Self> {
        let config: TgBotConfig = serde_json::from_str(&raw.config)?;
        Ok(TelegramBot {
            id: raw.id,
            user_id: raw.user_id,
            source: raw.source,
            chat_id: raw.chat_id,
            symbol: raw.symbol,
            side: raw.side,
            market_type: raw.market_type,
            exchange_id: raw.exchange_id,
            mode: raw.mode,
            status: raw.status,
            config,
            actual_entry_price: raw.actual_entry_price,
            current_price: raw.current_price,
            pnl: raw.pnl,
            exit_price: raw.exit_price,
            exit_reason: raw.exit_reason,
            expires_at: raw.expires_at,
            expiry_handled_at: raw.expiry_handled_at,
            executed_at: raw.executed_at,
            closed_at: raw.closed_at,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

/// One monitored price level of a telegram bot.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramTradeItem {
    pub id: String,
    pub bot_id: String,
    pub user_id: String,
    pub kind: TradeItemKind,
    pub level: i64,
    pub target_price: f64,
    pub percent: Option<f64>,
    pub status: TradeItemStatus,
    pub hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One candle of a feature window together with its computed features.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCandle {
    pub candle: Candle,
    pub features: BTreeMap<String, f64>,
}

/// Persisted per-bot strategy feature snapshot.
#[derive(Debug, Clone)]
pub struct FeatureState {
    pub bot_id: String,
    pub user_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub exchange_id: String,
    pub timeframe: String,
    pub market_type: MarketKind,
    pub features: Vec<String>,
    pub latest_features: BTreeMap<String, f64>,
    pub window_candles: Vec<WindowCandle>,
    pub last_candle_ts: Option<DateTime<Utc>>,
    pub feature_rows: i64,
}

// ─── Per-user app config document ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingModePref {
    Demo,
    Live,
}

impl TradingModePref {
    pub fn mode(self) -> TradeMode {
        match self {
            TradingModePref::Demo => TradeMode::Simulated,
            TradingModePref::Live => TradeMode::Real,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InvestmentLimits {
    pub cex_max_amount: Option<f64>,
    pub dex_max_amount: Option<f64>,
}

impl InvestmentLimits {
    pub fn max_for(&self, market: CanonicalMarket) -> Option<f64> {
        match market {
            CanonicalMarket::Cex => self.cex_max_amount,
            CanonicalMarket::Dex => self.dex_max_amount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotStrategyLimits {
    pub max_active_bots: u32,
    /// 0 means unlimited.
    pub max_active_telegram_bots: u32,
}

impl Default for BotStrategyLimits {
    fn default() -> Self {
        Self {
            max_active_bots: 10,
            max_active_telegram_bots: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BotWalletPolicy {
    pub enabled: bool,
    pub per_bot_allocation_pct: f64,
    pub min_allocation_usdt: f64,
    pub max_allocation_usdt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramChannels {
    /// Whitelist of chat ids whose messages may enter signal processing.
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualBalanceBootstrap {
    pub cex: f64,
    pub dex: f64,
}

impl Default for VirtualBalanceBootstrap {
    fn default() -> Self {
        Self {
            cex: 10_000.0,
            dex: 10_000.0,
        }
    }
}

impl VirtualBalanceBootstrap {
    pub fn for_market(&self, market: CanonicalMarket) -> f64 {
        match market {
            CanonicalMarket::Cex => self.cex,
            CanonicalMarket::Dex => self.dex,
        }
    }
}

/// Closed enumeration of per-user options. Unknown legacy fields in stored
/// documents are ignored on load and dropped on the next save.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub is_auto_enabled: bool,
    pub trading_mode: TradingModePref,
    pub investment_limits: InvestmentLimits,
    pub bot_strategy: BotStrategyLimits,
    pub bot_wallet_policy: BotWalletPolicy,
    pub telegram_channels: TelegramChannels,
    pub virtual_balances: VirtualBalanceBootstrap,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            is_auto_enabled: true,
            trading_mode: TradingModePref::Demo,
            investment_limits: InvestmentLimits::default(),
            bot_strategy: BotStrategyLimits::default(),
            bot_wallet_policy: BotWalletPolicy::default(),
            telegram_channels: TelegramChannels::default(),
            virtual_balances: VirtualBalanceBootstrap::default(),
        }
    }
}
