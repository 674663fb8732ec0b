use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use common::{Result, TradeItemStatus};
use exchange::ExchangeHub;
use notify::{NotificationBus, UserEvent};
use store::{Store, TakeProfitLevel, TelegramBot};

use crate::analyst::{parse_expiry_decision, ExpiryAction, SignalAnalyst};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_BATCH: i64 = 20;

/// Periodic sweeper for telegram bots whose `expiresAt` has passed.
///
/// For each expired, unhandled bot it asks the analyst whether to close the
/// bot or extend it with a new SL / TP ladder, applies the decision
/// atomically, and stamps `expiryHandledAt`. The claim is idempotent under
/// concurrent sweepers: only one wins per bot.
pub struct ExpirySweeper {
    store: Store,
    analyst: Arc<dyn SignalAnalyst>,
    hub: Arc<ExchangeHub>,
    bus: Arc<NotificationBus>,
}

impl ExpirySweeper {
    pub fn new(
        store: Store,
        analyst: Arc<dyn SignalAnalyst>,
        hub: Arc<ExchangeHub>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            store,
            analyst,
            hub,
            bus,
        }
    }

    /// Run forever. Call from `tokio::spawn`.
    pub async fn run(self) {
        info!("Telegram expiry sweeper running");
        loop {
            if let Err(e) = self.sweep(SWEEP_BATCH).await {
                error!(error = %e, "Expiry sweep failed");
            }
            tokio::time::sleep(SWEEP_INTERVAL).await;
        }
    }

    /// One pass over due bots. Returns how many were handled.
    pub async fn sweep(&self, limit: i64) -> Result<usize> {
        let due = self.store.expired_unhandled_tg_bots(Utc::now(), limit).await?;
        let mut handled = 0;
        for bot in due {
            match self.handle_one(&bot).await {
                Ok(true) => handled += 1,
                Ok(false) => {} // another sweeper claimed it
                Err(e) => error!(bot = %bot.id, error = %e, "Expiry handling failed"),
            }
        }
        Ok(handled)
    }

    async fn handle_one(&self, bot: &TelegramBot) -> Result<bool> {
        let current_price = self.current_price(bot).await;

        let content = match self.analyst.decide_expiry(bot, current_price).await {
            Ok(content) => content,
            Err(e) => {
                warn!(bot = %bot.id, error = %e, "Expiry analyst unavailable, defaulting to close");
                String::new()
            }
        };
        let decision = parse_expiry_decision(&content);
        let decision_json = serde_json::json!({
            "action": match decision.action { ExpiryAction::Close => "close", ExpiryAction::Update => "update" },
            "reason": decision.reason,
            "newStopLoss": decision.new_stop_loss,
        })
        .to_string();

        let applied = match decision.action {
            ExpiryAction::Update => {
                let new_tps: Option<Vec<TakeProfitLevel>> =
                    decision.new_take_profits.map(|targets| {
                        targets
                            .into_iter()
                            .map(|tp| TakeProfitLevel {
                                price: tp.price,
                                percent: tp.percent,
                                qty: tp.qty,
                                status: TradeItemStatus::Pending,
                            })
                            .collect()
                    });
                info!(bot = %bot.id, sl = ?decision.new_stop_loss, "Expiry decision: extend");
                self.store
                    .apply_expiry_update(
                        bot,
                        decision.new_stop_loss,
                        new_tps.as_deref(),
                        &decision_json,
                    )
                    .await?
            }
            ExpiryAction::Close => {
                info!(bot = %bot.id, "Expiry decision: close");
                self.store.apply_expiry_close(&bot.id, &decision_json).await?
            }
        };

        if applied {
            if let Ok(Some(updated)) = self.store.tg_bot(&bot.id).await {
                if let Ok(doc) = serde_json::to_value(&updated) {
                    self.bus
                        .emit_to_user(&bot.user_id, &UserEvent::TelegramTradeUpdate(doc))
                        .await;
                }
            }
        }
        Ok(applied)
    }

    async fn current_price(&self, bot: &TelegramBot) -> f64 {
        match self.hub.public(&bot.exchange_id, bot.market_type).await {
            Ok(adapter) => adapter
                .fetch_ticker(&bot.symbol)
                .await
                .map(|t| t.last)
                .unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }
}
