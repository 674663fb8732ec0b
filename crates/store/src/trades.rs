use common::Result;

use crate::models::TradeRow;
use crate::Store;

impl Store {
    pub async fn insert_trade(&self, trade: &TradeRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades (id, bot_id, user_id, symbol, side, price, amount, pnl, mode, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&trade.id)
        .bind(&trade.bot_id)
        .bind(&trade.user_id)
        .bind(&trade.symbol)
        .bind(trade.side)
        .bind(trade.price)
        .bind(trade.amount)
        .bind(trade.pnl)
        .bind(trade.mode)
        .bind(trade.ts)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Audit rows for one bot in execution order.
    pub async fn trades_for_bot(&self, bot_id: &str) -> Result<Vec<TradeRow>> {
        Ok(
            sqlx::query_as::<_, TradeRow>("SELECT * FROM trades WHERE bot_id = ? ORDER BY ts")
                .bind(bot_id)
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn recent_trades(&self, user_id: &str, limit: i64) -> Result<Vec<TradeRow>> {
        Ok(sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE user_id = ? ORDER BY ts DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }
}
