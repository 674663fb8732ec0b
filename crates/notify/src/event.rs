use chrono::{DateTime, Utc};
use serde::Serialize;

use common::{CanonicalMarket, PositionSnapshot, Side};

/// Wire events pushed to clients, serialized as `{event, data}`.
///
/// Document-shaped payloads (trades, signals, telegram bots) are carried as
/// pre-serialized JSON values so the bus stays decoupled from the
/// persistence models.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum UserEvent {
    #[serde(rename_all = "camelCase")]
    BalanceUpdate {
        market_type: CanonicalMarket,
        asset: String,
        amount: f64,
        updated_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    BotUpdate {
        id: String,
        side: Option<Side>,
        position: PositionSnapshot,
        pnl: f64,
        current_price: f64,
    },
    BotCreated(serde_json::Value),
    #[serde(rename_all = "camelCase")]
    BotDeleted { id: String },
    BotUpdated(serde_json::Value),
    /// Full trade document of an execution.
    OperationUpdate(serde_json::Value),
    #[serde(rename_all = "camelCase")]
    PriceUpdate {
        exchange_id: String,
        market_type: CanonicalMarket,
        symbol: String,
        price: f64,
        ts: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bot_id: Option<String>,
    },
    SignalNew(serde_json::Value),
    SignalUpdate(serde_json::Value),
    TelegramTradeNew(serde_json::Value),
    TelegramTradeUpdate(serde_json::Value),
}
