use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use common::{StreamEvent, TgBotStatus};

use crate::orchestrator::{SignalOrchestrator, TickOutcome};

/// Entry proximity that wakes a passively waiting bot (0.5%).
const PROXIMITY_THRESHOLD: f64 = 0.005;
/// Resolution of the critical monitoring loop.
const CRITICAL_TICK: Duration = Duration::from_millis(500);

/// One workflow task per live telegram bot.
///
/// Passive phase: suspend on the ticker broadcast until price comes within
/// [`PROXIMITY_THRESHOLD`] of entry, with no polling. Critical phase:
/// subscribe the trades stream as well and evaluate the plan every ~500 ms
/// until the bot closes or expires.
pub(crate) async fn run(orchestrator: Arc<SignalOrchestrator>, bot_id: String) {
    if let Err(e) = drive(&orchestrator, &bot_id).await {
        error!(bot = %bot_id, error = %e, "Telegram workflow failed");
    }
    orchestrator.workflows.lock().await.remove(&bot_id);
}

async fn drive(orchestrator: &Arc<SignalOrchestrator>, bot_id: &str) -> common::Result<()> {
    let Some(bot) = orchestrator.store().tg_bot(bot_id).await? else {
        return Ok(());
    };
    if !bot.status.is_live() {
        return Ok(());
    }

    let streams = orchestrator.streams();
    let ticker_key = streams
        .subscribe_ticker(&bot.exchange_id, bot.market_type, &bot.symbol)
        .await;

    // ── Passive wait ─────────────────────────────────────────────────────────
    if bot.status == TgBotStatus::WaitingEntry {
        info!(bot = %bot.id, symbol = %bot.symbol, entry = bot.config.entry_price, "Passive watch started");
        let mut tickers = streams.tickers();
        loop {
            // The stream may already be warm from another subscriber.
            if let Some(ticker) = streams.latest_ticker(&ticker_key).await {
                if within_proximity(ticker.last, bot.config.entry_price) {
                    break;
                }
            }
            match tickers.recv().await {
                Ok(StreamEvent::Ticker { symbol, last, .. })
                | Ok(StreamEvent::Trade { symbol, price: last, .. })
                    if symbol == bot.symbol =>
                {
                    if within_proximity(last, bot.config.entry_price) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    streams.unsubscribe(&ticker_key).await;
                    return Ok(());
                }
            }
        }
        info!(bot = %bot.id, symbol = %bot.symbol, "Entry zone reached, switching to critical monitoring");
    }

    // ── Critical monitoring ──────────────────────────────────────────────────
    let trades_key = streams
        .subscribe_trades(&bot.exchange_id, bot.market_type, &bot.symbol)
        .await;

    loop {
        let price = streams
            .latest_ticker(&ticker_key)
            .await
            .map(|t| t.last)
            .unwrap_or(0.0);

        if price > 0.0 {
            match orchestrator.handle_price_tick(bot_id, price).await {
                Ok(TickOutcome::Closed { reason }) => {
                    info!(bot = %bot_id, reason = %reason, "Telegram trade finished");
                    break;
                }
                Ok(TickOutcome::Inactive) => break,
                Ok(_) => {}
                Err(e) => error!(bot = %bot_id, error = %e, "Tick handling failed"),
            }
        }
        tokio::time::sleep(CRITICAL_TICK).await;
    }

    streams.unsubscribe(&trades_key).await;
    streams.unsubscribe(&ticker_key).await;
    Ok(())
}

fn within_proximity(price: f64, entry: f64) -> bool {
    entry > 0.0 && price > 0.0 && ((price - entry).abs() / entry) <= PROXIMITY_THRESHOLD
}
