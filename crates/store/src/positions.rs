use chrono::Utc;
use uuid::Uuid;

use common::{PositionStatus, Result, Side};

use crate::models::PositionRow;
use crate::Store;

impl Store {
    /// The bot's canonical OPEN position, if any. At most one exists.
    pub async fn open_position(&self, bot_id: &str) -> Result<Option<PositionRow>> {
        Ok(sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE bot_id = ? AND status = ? LIMIT 1",
        )
        .bind(bot_id)
        .bind(PositionStatus::Open)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn insert_position(&self, position: &PositionRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO positions (
                id, bot_id, user_id, symbol, side, current_qty, avg_entry_price,
                invested_amount, realized_pnl, roi, total_trades, status,
                final_pnl, exit_price, opened_at, closed_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&position.id)
        .bind(&position.bot_id)
        .bind(&position.user_id)
        .bind(&position.symbol)
        .bind(position.side)
        .bind(position.current_qty)
        .bind(position.avg_entry_price)
        .bind(position.invested_amount)
        .bind(position.realized_pnl)
        .bind(position.roi)
        .bind(position.total_trades)
        .bind(position.status)
        .bind(position.final_pnl)
        .bind(position.exit_price)
        .bind(position.opened_at)
        .bind(position.closed_at)
        .bind(position.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Rewrite the mutable accounting fields of an open position.
    pub async fn update_position(&self, position: &PositionRow) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET
                side = ?, current_qty = ?, avg_entry_price = ?, invested_amount = ?,
                realized_pnl = ?, roi = ?, total_trades = ?, status = ?,
                final_pnl = ?, exit_price = ?, closed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(position.side)
        .bind(position.current_qty)
        .bind(position.avg_entry_price)
        .bind(position.invested_amount)
        .bind(position.realized_pnl)
        .bind(position.roi)
        .bind(position.total_trades)
        .bind(position.status)
        .bind(position.final_pnl)
        .bind(position.exit_price)
        .bind(position.closed_at)
        .bind(Utc::now())
        .bind(&position.id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn close_position(
        &self,
        id: &str,
        final_pnl: f64,
        exit_price: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET status = ?, final_pnl = ?, exit_price = ?,
                    closed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(PositionStatus::Closed)
        .bind(final_pnl)
        .bind(exit_price)
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn positions_for_bot(&self, bot_id: &str) -> Result<Vec<PositionRow>> {
        Ok(sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE bot_id = ? ORDER BY opened_at",
        )
        .bind(bot_id)
        .fetch_all(self.pool())
        .await?)
    }
}

/// Fresh OPEN position shell for a bot about to take its first fill.
pub fn new_open_position(bot_id: &str, user_id: &str, symbol: &str, side: Side) -> PositionRow {
    PositionRow {
        id: Uuid::new_v4().to_string(),
        bot_id: bot_id.to_string(),
        user_id: user_id.to_string(),
        symbol: symbol.to_string(),
        side,
        current_qty: 0.0,
        avg_entry_price: 0.0,
        invested_amount: 0.0,
        realized_pnl: 0.0,
        roi: 0.0,
        total_trades: 0,
        status: PositionStatus::Open,
        final_pnl: None,
        exit_price: None,
        opened_at: Utc::now(),
        closed_at: None,
        updated_at: Utc::now(),
    }
}
