use chrono::{DateTime, Utc};
use uuid::Uuid;

use common::{Result, TgBotStatus, TradeItemKind, TradeItemStatus};

use crate::models::{TakeProfitLevel, TelegramBot, TelegramBotRaw, TelegramTradeItem, TgBotConfig};
use crate::Store;

/// The percents of a non-empty TP ladder must sum to 100.
pub fn validate_tp_percents(take_profits: &[TakeProfitLevel]) -> Result<()> {
    if take_profits.is_empty() {
        return Ok(());
    }
    let sum: f64 = take_profits.iter().map(|tp| tp.percent).sum();
    if (sum - 100.0).abs() > 1e-6 {
        return Err(common::Error::Validation(format!(
            "take-profit percents must sum to 100, got {sum}"
        )));
    }
    Ok(())
}

impl Store {
    pub async fn insert_tg_bot(&self, bot: &TelegramBot) -> Result<()> {
        validate_tp_percents(&bot.config.take_profits)?;
        sqlx::query(
            "INSERT INTO telegram_bots (
                id, user_id, source, chat_id, symbol, side, market_type, exchange_id,
                mode, status, config, actual_entry_price, current_price, pnl,
                exit_price, exit_reason, expires_at, expiry_handled_at, expiry_decision,
                executed_at, closed_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&bot.id)
        .bind(&bot.user_id)
        .bind(&bot.source)
        .bind(&bot.chat_id)
        .bind(&bot.symbol)
        .bind(bot.side)
        .bind(bot.market_type)
        .bind(&bot.exchange_id)
        .bind(bot.mode)
        .bind(bot.status)
        .bind(serde_json::to_string(&bot.config)?)
        .bind(bot.actual_entry_price)
        .bind(bot.current_price)
        .bind(bot.pnl)
        .bind(bot.exit_price)
        .bind(&bot.exit_reason)
        .bind(bot.expires_at)
        .bind(bot.expiry_handled_at)
        .bind(Option::<String>::None)
        .bind(bot.executed_at)
        .bind(bot.closed_at)
        .bind(bot.created_at)
        .bind(bot.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn tg_bot(&self, id: &str) -> Result<Option<TelegramBot>> {
        let raw = sqlx::query_as::<_, TelegramBotRaw>(
            "SELECT id, user_id, source, chat_id, symbol, side, market_type, exchange_id,
                    mode, status, config, actual_entry_price, current_price, pnl,
                    exit_price, exit_reason, expires_at, expiry_handled_at,
                    executed_at, closed_at, created_at, updated_at
             FROM telegram_bots WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        raw.map(TelegramBot::try_from).transpose()
    }

    /// Bots still being monitored: waiting for entry or holding a position.
    pub async fn live_tg_bots(&self) -> Result<Vec<TelegramBot>> {
        let raws = sqlx::query_as::<_, TelegramBotRaw>(
            "SELECT id, user_id, source, chat_id, symbol, side, market_type, exchange_id,
                    mode, status, config, actual_entry_price, current_price, pnl,
                    exit_price, exit_reason, expires_at, expiry_handled_at,
                    executed_at, closed_at, created_at, updated_at
             FROM telegram_bots WHERE status IN ('waiting_entry', 'active')
             ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?;
        raws.into_iter().map(TelegramBot::try_from).collect()
    }

    /// Duplicate gate: an active bot for (user, symbol) blocks a new one.
    pub async fn has_live_tg_bot(&self, user_id: &str, symbol: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM telegram_bots
             WHERE user_id = ? AND symbol = ? AND status IN ('waiting_entry', 'active')",
        )
        .bind(user_id)
        .bind(symbol)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    pub async fn count_live_tg_bots(&self, user_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM telegram_bots
             WHERE user_id = ? AND status IN ('waiting_entry', 'active')",
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn set_tg_bot_status(&self, id: &str, status: TgBotStatus) -> Result<()> {
        sqlx::query("UPDATE telegram_bots SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Entry filled: flip to active and record the actual entry price.
    pub async fn set_tg_bot_entry(&self, id: &str, actual_entry_price: f64) -> Result<()> {
        sqlx::query(
            "UPDATE telegram_bots
             SET status = ?, actual_entry_price = ?, executed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(TgBotStatus::Active)
        .bind(actual_entry_price)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_tg_bot_tick(&self, id: &str, current_price: f64, pnl: f64) -> Result<()> {
        sqlx::query(
            "UPDATE telegram_bots SET current_price = ?, pnl = ?, updated_at = ? WHERE id = ?",
        )
        .bind(current_price)
        .bind(pnl)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn close_tg_bot(&self, id: &str, exit_price: f64, exit_reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE telegram_bots
             SET status = ?, exit_price = ?, exit_reason = ?, closed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(TgBotStatus::Closed)
        .bind(exit_price)
        .bind(exit_reason)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_tg_bot_config(&self, id: &str, config: &TgBotConfig) -> Result<()> {
        validate_tp_percents(&config.take_profits)?;
        sqlx::query("UPDATE telegram_bots SET config = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(config)?)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Expired, still-live bots the sweeper has not handled yet.
    pub async fn expired_unhandled_tg_bots(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TelegramBot>> {
        let raws = sqlx::query_as::<_, TelegramBotRaw>(
            "SELECT id, user_id, source, chat_id, symbol, side, market_type, exchange_id,
                    mode, status, config, actual_entry_price, current_price, pnl,
                    exit_price, exit_reason, expires_at, expiry_handled_at,
                    executed_at, closed_at, created_at, updated_at
             FROM telegram_bots
             WHERE expires_at IS NOT NULL AND expires_at <= ?
               AND status IN ('waiting_entry', 'active')
               AND expiry_handled_at IS NULL
             ORDER BY expires_at LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        raws.into_iter().map(TelegramBot::try_from).collect()
    }

    /// Expiry decision "close": mark expired and cancel every open item.
    /// Returns false when another sweeper handled the bot first.
    pub async fn apply_expiry_close(&self, bot_id: &str, decision_json: &str) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let claimed = sqlx::query(
            "UPDATE telegram_bots
             SET status = ?, expiry_handled_at = ?, expiry_decision = ?, updated_at = ?
             WHERE id = ? AND expiry_handled_at IS NULL",
        )
        .bind(TgBotStatus::Expired)
        .bind(now)
        .bind(decision_json)
        .bind(now)
        .bind(bot_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE telegram_trades SET status = ?, updated_at = ?
             WHERE bot_id = ? AND status IN ('pending', 'active')",
        )
        .bind(TradeItemStatus::Cancelled)
        .bind(now)
        .bind(bot_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Expiry decision "update": atomically replace the stop-loss and/or TP
    /// ladder (config snapshot and item rows). No position is touched.
    /// Returns false when another sweeper handled the bot first.
    pub async fn apply_expiry_update(
        &self,
        bot: &TelegramBot,
        new_stop_loss: Option<f64>,
        new_take_profits: Option<&[TakeProfitLevel]>,
        decision_json: &str,
    ) -> Result<bool> {
        if let Some(tps) = new_take_profits {
            validate_tp_percents(tps)?;
        }

        let mut config = bot.config.clone();
        if let Some(sl) = new_stop_loss {
            config.stop_loss = sl;
        }
        if let Some(tps) = new_take_profits {
            config.take_profits = tps.to_vec();
        }

        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        let claimed = sqlx::query(
            "UPDATE telegram_bots
             SET config = ?, expiry_handled_at = ?, expiry_decision = ?, updated_at = ?
             WHERE id = ? AND expiry_handled_at IS NULL",
        )
        .bind(serde_json::to_string(&config)?)
        .bind(now)
        .bind(decision_json)
        .bind(now)
        .bind(&bot.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(sl) = new_stop_loss {
            sqlx::query(
                "UPDATE telegram_trades SET status = ?, updated_at = ?
                 WHERE bot_id = ? AND kind = 'sl' AND status = 'active'",
            )
            .bind(TradeItemStatus::Cancelled)
            .bind(now)
            .bind(&bot.id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO telegram_trades (id, bot_id, user_id, kind, level, target_price, percent, status, created_at, updated_at)
                 VALUES (?, ?, ?, 'sl', 0, ?, NULL, 'active', ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&bot.id)
            .bind(&bot.user_id)
            .bind(sl)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(tps) = new_take_profits {
            sqlx::query(
                "UPDATE telegram_trades SET status = ?, updated_at = ?
                 WHERE bot_id = ? AND kind = 'tp' AND status = 'pending'",
            )
            .bind(TradeItemStatus::Cancelled)
            .bind(now)
            .bind(&bot.id)
            .execute(&mut *tx)
            .await?;

            for (idx, tp) in tps.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO telegram_trades (id, bot_id, user_id, kind, level, target_price, percent, status, created_at, updated_at)
                     VALUES (?, ?, ?, 'tp', ?, ?, ?, 'pending', ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&bot.id)
                .bind(&bot.user_id)
                .bind((idx + 1) as i64)
                .bind(tp.price)
                .bind(tp.percent)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    // ── Trade items ──────────────────────────────────────────────────────────

    pub async fn insert_trade_items(&self, items: &[TelegramTradeItem]) -> Result<()> {
        for item in items {
            sqlx::query(
                "INSERT INTO telegram_trades (id, bot_id, user_id, kind, level, target_price, percent, status, hit_at, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&item.id)
            .bind(&item.bot_id)
            .bind(&item.user_id)
            .bind(item.kind)
            .bind(item.level)
            .bind(item.target_price)
            .bind(item.percent)
            .bind(item.status)
            .bind(item.hit_at)
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn trade_items(&self, bot_id: &str) -> Result<Vec<TelegramTradeItem>> {
        Ok(sqlx::query_as::<_, TelegramTradeItem>(
            "SELECT * FROM telegram_trades WHERE bot_id = ? ORDER BY kind, level",
        )
        .bind(bot_id)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn mark_trade_item_hit(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE telegram_trades SET status = ?, hit_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(TradeItemStatus::Hit)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_trade_item_status(&self, id: &str, status: TradeItemStatus) -> Result<()> {
        sqlx::query("UPDATE telegram_trades SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn cancel_open_trade_items(&self, bot_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE telegram_trades SET status = ?, updated_at = ?
             WHERE bot_id = ? AND status IN ('pending', 'active')",
        )
        .bind(TradeItemStatus::Cancelled)
        .bind(Utc::now())
        .bind(bot_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Build one trade item row.
pub fn new_trade_item(
    bot_id: &str,
    user_id: &str,
    kind: TradeItemKind,
    level: i64,
    target_price: f64,
    percent: Option<f64>,
    status: TradeItemStatus,
) -> TelegramTradeItem {
    let now = Utc::now();
    TelegramTradeItem {
        id: Uuid::new_v4().to_string(),
        bot_id: bot_id.to_string(),
        user_id: user_id.to_string(),
        kind,
        level,
        target_price,
        percent,
        status,
        hit_at: None,
        created_at: now,
        updated_at: now,
    }
}
