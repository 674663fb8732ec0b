use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::{Direction, MarketKind, Result};
use store::TelegramBot;

/// One take-profit target proposed by the analyst.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TpTarget {
    pub price: f64,
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
}

/// Structured trade plan extracted from a raw signal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradePlan {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TpTarget>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub investment: Option<f64>,
    #[serde(default)]
    pub valid_for_minutes: Option<i64>,
    #[serde(default)]
    pub exchange_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalysisDecision {
    Approved,
    Rejected,
}

/// One analyzed trade idea; a raw message may yield several.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalAnalysis {
    pub decision: AnalysisDecision,
    pub symbol: String,
    pub market_type: MarketKind,
    pub direction: Direction,
    pub plan: TradePlan,
    pub confidence: f64,
    pub is_safe: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// External AI collaborator. Prompt construction and transport live outside
/// the core; this is the contract the orchestrator consumes.
#[async_trait]
pub trait SignalAnalyst: Send + Sync {
    /// Parse a raw natural-language signal into zero or more trade plans.
    async fn analyze_signal(&self, user_id: &str, raw_text: &str) -> Result<Vec<SignalAnalysis>>;

    /// Decide what to do with an expired bot. Returns the analyst's raw JSON
    /// response; parsing (with its close-on-garbage fallback) stays here.
    async fn decide_expiry(&self, bot: &TelegramBot, current_price: f64) -> Result<String>;
}

/// Parsed expiry verdict.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryDecision {
    pub action: ExpiryAction,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub new_stop_loss: Option<f64>,
    #[serde(default)]
    pub new_take_profits: Option<Vec<TpTarget>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryAction {
    Close,
    Update,
}

/// Unparseable analyst output falls back to a safe close.
pub fn parse_expiry_decision(content: &str) -> ExpiryDecision {
    serde_json::from_str(content).unwrap_or(ExpiryDecision {
        action: ExpiryAction::Close,
        reason: Some("invalid_ai_json".into()),
        new_stop_loss: None,
        new_take_profits: None,
    })
}
