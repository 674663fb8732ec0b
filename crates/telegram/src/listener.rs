use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::{info, warn};

use engine::TradeAlerter;
use store::{Store, TradeRow};

use crate::orchestrator::SignalOrchestrator;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Dependencies injected into the message handler via `dptree`.
#[derive(Clone)]
pub struct ListenerDeps {
    pub store: Store,
    pub orchestrator: Arc<SignalOrchestrator>,
}

/// Start the inbound signal listener in long-polling mode. Every text
/// message from a whitelisted chat is fanned out to the users allowing that
/// chat and fed into signal processing.
pub async fn start_listener(token: String, deps: ListenerDeps) {
    let bot = Bot::new(token);
    let deps = Arc::new(deps);

    info!("Telegram signal listener starting (long-polling)");

    let handler = Update::filter_message().endpoint(handle_message);
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![deps])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_message(_bot: Bot, msg: Message, deps: Arc<ListenerDeps>) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = msg.chat.id.0.to_string();

    // Silently drop messages from chats nobody whitelisted.
    let users = deps
        .store
        .users_allowing_chat(&chat_id)
        .await
        .unwrap_or_default();
    if users.is_empty() {
        return Ok(());
    }

    let source = format!("telegram_{chat_id}");
    for user_id in users {
        if let Err(e) = deps
            .orchestrator
            .process_raw_signal(&user_id, &source, text)
            .await
        {
            warn!(user = %user_id, chat = %chat_id, error = %e, "Signal ingestion failed");
        }
    }
    Ok(())
}

/// Send a proactive alert to all configured chat IDs.
pub async fn send_alert(bot: &Bot, chat_ids: &[ChatId], message: &str) {
    for &chat_id in chat_ids {
        if let Err(e) = bot.send_message(chat_id, message).await {
            warn!(chat_id = ?chat_id, error = %e, "Failed to send Telegram alert");
        }
    }
}

/// Best-effort execution alerts pushed back over the user's own channels.
pub struct TelegramAlerter {
    bot: Bot,
    store: Store,
}

impl TelegramAlerter {
    pub fn new(token: String, store: Store) -> Self {
        Self {
            bot: Bot::new(token),
            store,
        }
    }
}

#[async_trait]
impl TradeAlerter for TelegramAlerter {
    async fn trade_alert(&self, user_id: &str, trade: &TradeRow) {
        let Ok(config) = self.store.app_config(user_id).await else {
            return;
        };
        let chat_ids: Vec<ChatId> = config
            .telegram_channels
            .allow
            .iter()
            .filter_map(|chat| chat.parse::<i64>().ok())
            .map(ChatId)
            .collect();
        if chat_ids.is_empty() {
            return;
        }

        let message = format!(
            "💱 {} {} @ {:.4} ({}, pnl {:+.2})",
            trade.side, trade.symbol, trade.price, trade.mode, trade.pnl
        );
        send_alert(&self.bot, &chat_ids, &message).await;
    }
}
