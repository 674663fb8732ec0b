use chrono::{DateTime, Utc};

use common::{BotStatus, Result, Side};

use crate::models::BotInstance;
use crate::Store;

impl Store {
    pub async fn create_bot(&self, bot: &BotInstance) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_instances (
                id, user_id, name, symbol, timeframe, market_type, exchange_id,
                strategy_name, mode, status, amount, side, position_qty,
                position_avg_price, wallet_allocated, wallet_available,
                wallet_realized_pnl, total_pnl, last_candle_ts, last_execution, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&bot.id)
        .bind(&bot.user_id)
        .bind(&bot.name)
        .bind(&bot.symbol)
        .bind(&bot.timeframe)
        .bind(bot.market_type)
        .bind(&bot.exchange_id)
        .bind(&bot.strategy_name)
        .bind(bot.mode)
        .bind(bot.status)
        .bind(bot.amount)
        .bind(bot.side)
        .bind(bot.position_qty)
        .bind(bot.position_avg_price)
        .bind(bot.wallet_allocated)
        .bind(bot.wallet_available)
        .bind(bot.wallet_realized_pnl)
        .bind(bot.total_pnl)
        .bind(bot.last_candle_ts)
        .bind(bot.last_execution)
        .bind(bot.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn bot(&self, id: &str) -> Result<Option<BotInstance>> {
        Ok(
            sqlx::query_as::<_, BotInstance>("SELECT * FROM bot_instances WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn bots_for_user(&self, user_id: &str) -> Result<Vec<BotInstance>> {
        Ok(sqlx::query_as::<_, BotInstance>(
            "SELECT * FROM bot_instances WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Every bot boot recovery must rehydrate.
    pub async fn active_bots(&self) -> Result<Vec<BotInstance>> {
        Ok(sqlx::query_as::<_, BotInstance>(
            "SELECT * FROM bot_instances WHERE status = ? ORDER BY created_at",
        )
        .bind(BotStatus::Active)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn count_active_bots(&self, user_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bot_instances WHERE user_id = ? AND status = ?",
        )
        .bind(user_id)
        .bind(BotStatus::Active)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    pub async fn set_bot_status(&self, id: &str, status: BotStatus) -> Result<()> {
        sqlx::query("UPDATE bot_instances SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Post-execution bot update: side/position snapshot, execution stamp,
    /// and realized PnL accumulation.
    pub async fn update_bot_after_execution(
        &self,
        id: &str,
        side: Option<Side>,
        qty: f64,
        avg_price: f64,
        realized_pnl: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE bot_instances
             SET side = ?, position_qty = ?, position_avg_price = ?,
                 last_execution = ?, total_pnl = total_pnl + ?
             WHERE id = ?",
        )
        .bind(side)
        .bind(qty)
        .bind(avg_price)
        .bind(Utc::now())
        .bind(realized_pnl)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_bot_wallet(
        &self,
        id: &str,
        allocated: f64,
        available: f64,
        realized_pnl: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE bot_instances
             SET wallet_allocated = ?, wallet_available = ?, wallet_realized_pnl = ?
             WHERE id = ?",
        )
        .bind(allocated)
        .bind(available)
        .bind(realized_pnl)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_bot_last_candle(&self, id: &str, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE bot_instances SET last_candle_ts = ? WHERE id = ?")
            .bind(ts)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a bot and everything that back-references it: positions,
    /// trades, feature state and history. One transaction, all or nothing.
    pub async fn delete_bot_cascade(&self, id: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM positions WHERE bot_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM trades WHERE bot_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bot_feature_states WHERE bot_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bot_feature_history WHERE bot_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bot_instances WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
