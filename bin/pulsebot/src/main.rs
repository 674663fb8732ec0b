use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

use boot::BootManager;
use common::{Config, Result};
use engine::ExecutionEngine;
use exchange::ExchangeHub;
use features::FeatureStateService;
use notify::NotificationBus;
use store::{Store, TelegramBot};
use strategy::StrategyRegistry;
use stream::{DataBuffer, MarketStreamService};
use telegram_sig::{
    ExpirySweeper, ListenerDeps, SignalAnalysis, SignalAnalyst, SignalOrchestrator,
    TelegramAlerter,
};

/// Stand-in for the external AI collaborator. Until one is wired in, every
/// inbound signal fails loudly instead of being silently dropped, and expiry
/// handling takes the safe path.
struct UnconfiguredAnalyst;

#[async_trait]
impl SignalAnalyst for UnconfiguredAnalyst {
    async fn analyze_signal(&self, _user_id: &str, _raw: &str) -> Result<Vec<SignalAnalysis>> {
        Err(common::Error::Config(
            "no signal analyst configured (set up an AI provider)".into(),
        ))
    }

    async fn decide_expiry(&self, _bot: &TelegramBot, _price: f64) -> Result<String> {
        Ok(r#"{"action":"close","reason":"no_analyst_configured"}"#.to_string())
    }
}

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ───────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!("PulseBot starting");

    // ── Database (schema + one-shot data migrations before anything trades) ──
    let store = Store::connect(&cfg.database_url)
        .await
        .unwrap_or_else(|e| panic!("Failed to open database: {e}"));

    // ── Core collaborators ───────────────────────────────────────────────────
    let hub = Arc::new(ExchangeHub::new(Arc::new(store.clone())));
    let bus = Arc::new(NotificationBus::new());
    let streams = Arc::new(MarketStreamService::new(hub.clone()));
    let buffer = Arc::new(DataBuffer::new(hub.clone()));
    let registry = Arc::new(StrategyRegistry::builtin());
    let features = Arc::new(FeatureStateService::new(
        store.clone(),
        hub.clone(),
        registry.clone(),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        hub.clone(),
        bus.clone(),
    ));

    if let Some(token) = cfg.telegram_token.clone() {
        engine.set_alerter(Arc::new(TelegramAlerter::new(token, store.clone())));
    }

    // ── Telegram signal orchestration ────────────────────────────────────────
    let analyst: Arc<dyn SignalAnalyst> = Arc::new(UnconfiguredAnalyst);
    let orchestrator = SignalOrchestrator::new(
        store.clone(),
        engine.clone(),
        streams.clone(),
        bus.clone(),
        analyst.clone(),
        hub.clone(),
    );
    let sweeper = ExpirySweeper::new(store.clone(), analyst, hub.clone(), bus.clone());

    // ── Boot recovery ────────────────────────────────────────────────────────
    let manager = BootManager::new(
        store.clone(),
        hub.clone(),
        streams.clone(),
        buffer,
        features,
        registry,
        engine.clone(),
        bus.clone(),
    );
    let _candle_pump = manager.spawn_candle_pump();
    let _ticker_pump = manager.spawn_ticker_pump();
    let _price_stream = manager.spawn_price_stream();
    manager
        .recover()
        .await
        .unwrap_or_else(|e| panic!("Boot recovery failed: {e}"));
    orchestrator
        .resume_active()
        .await
        .unwrap_or_else(|e| panic!("Telegram workflow recovery failed: {e}"));

    // ── Background tasks ─────────────────────────────────────────────────────
    tokio::spawn(sweeper.run());
    if let Some(token) = cfg.telegram_token.clone() {
        let deps = ListenerDeps {
            store: store.clone(),
            orchestrator: orchestrator.clone(),
        };
        tokio::spawn(telegram_sig::start_listener(token, deps));
    }

    let api_state = api::AppState {
        store: store.clone(),
        bus: bus.clone(),
        streams: streams.clone(),
        dashboard_token: cfg.dashboard_token.clone(),
    };
    tokio::spawn(api::serve(api_state, cfg.dashboard_port));

    // ── Shutdown ─────────────────────────────────────────────────────────────
    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c()
        .await
        .expect("ctrl-c handler installation failed");
    info!("Shutdown signal received. Closing streams.");
    orchestrator.shutdown().await;
    streams.shutdown().await;
    info!("Exiting.");
}
