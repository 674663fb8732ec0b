pub mod analyst;
pub mod expiry;
pub mod listener;
pub mod orchestrator;
mod workflow;

pub use analyst::{
    parse_expiry_decision, AnalysisDecision, ExpiryAction, ExpiryDecision, SignalAnalysis,
    SignalAnalyst, TpTarget, TradePlan,
};
pub use expiry::ExpirySweeper;
pub use listener::{start_listener, ListenerDeps, TelegramAlerter};
pub use orchestrator::{SignalOrchestrator, TickOutcome};
