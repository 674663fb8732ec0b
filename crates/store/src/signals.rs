use chrono::Utc;
use uuid::Uuid;

use common::{Direction, Result, SignalStatus};

use crate::models::SignalRow;
use crate::Store;

/// Analysis fields attached to a signal once the analyst has spoken.
#[derive(Debug, Clone, Default)]
pub struct SignalAnalysisUpdate {
    pub symbol: Option<String>,
    pub market_type: Option<String>,
    pub direction: Option<Direction>,
    pub decision: Option<String>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}

impl Store {
    pub async fn insert_signal(
        &self,
        user_id: &str,
        source: &str,
        raw_text: &str,
    ) -> Result<SignalRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO signals (id, user_id, source, raw_text, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(source)
        .bind(raw_text)
        .bind(SignalStatus::Processing)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.signal(&id)
            .await?
            .ok_or_else(|| common::Error::Other("signal missing after insert".into()))
    }

    /// Audit row for an engine-originated (autonomous) decision; born
    /// directly in `executing`.
    pub async fn insert_auto_signal(
        &self,
        user_id: &str,
        source: &str,
        raw_text: &str,
        symbol: &str,
        decision: &str,
        confidence: Option<f64>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO signals (id, user_id, source, raw_text, status, symbol, decision, confidence, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(source)
        .bind(raw_text)
        .bind(SignalStatus::Executing)
        .bind(symbol)
        .bind(decision)
        .bind(confidence)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn signal(&self, id: &str) -> Result<Option<SignalRow>> {
        Ok(
            sqlx::query_as::<_, SignalRow>("SELECT * FROM signals WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn signals_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<SignalRow>> {
        Ok(sqlx::query_as::<_, SignalRow>(
            "SELECT * FROM signals WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn set_signal_analysis(
        &self,
        id: &str,
        analysis: &SignalAnalysisUpdate,
        status: SignalStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE signals SET symbol = ?, market_type = ?, direction = ?, decision = ?,
                    confidence = ?, reasoning = ?, status = ?
             WHERE id = ? AND status IN ('processing', 'accepted', 'executing')",
        )
        .bind(&analysis.symbol)
        .bind(&analysis.market_type)
        .bind(analysis.direction)
        .bind(&analysis.decision)
        .bind(analysis.confidence)
        .bind(&analysis.reasoning)
        .bind(status)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Move a signal along its lifecycle. Terminal rows are never mutated:
    /// the guard keeps the update from touching them.
    pub async fn set_signal_status(
        &self,
        id: &str,
        status: SignalStatus,
        execution_message: Option<&str>,
        trade_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE signals SET status = ?, execution_message = ?, trade_id = COALESCE(?, trade_id)
             WHERE id = ? AND status IN ('processing', 'accepted', 'executing')",
        )
        .bind(status)
        .bind(execution_message)
        .bind(trade_id)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
