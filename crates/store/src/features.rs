use chrono::{DateTime, Utc};
use uuid::Uuid;

use common::{MarketKind, Result};

use crate::models::{FeatureState, WindowCandle};
use crate::Store;

#[derive(sqlx::FromRow)]
struct FeatureStateRaw {
    bot_id: String,
    user_id: String,
    strategy_name: String,
    symbol: String,
    exchange_id: String,
    timeframe: String,
    market_type: MarketKind,
    features: String,
    latest_features: String,
    window_candles: String,
    last_candle_ts: Option<DateTime<Utc>>,
    feature_rows: i64,
}

impl Store {
    /// Insert or replace the state document keyed by bot id. Runtime candle
    /// updates write only this document; the append-only history collection
    /// is written by the backfill pass alone.
    pub async fn upsert_feature_state(&self, state: &FeatureState) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_feature_states (
                id, bot_id, user_id, strategy_name, symbol, exchange_id, timeframe,
                market_type, features, latest_features, window_candles,
                last_candle_ts, feature_rows, initialized_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bot_id) DO UPDATE SET
                strategy_name = excluded.strategy_name,
                features = excluded.features,
                latest_features = excluded.latest_features,
                window_candles = excluded.window_candles,
                last_candle_ts = excluded.last_candle_ts,
                feature_rows = excluded.feature_rows,
                updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&state.bot_id)
        .bind(&state.user_id)
        .bind(&state.strategy_name)
        .bind(&state.symbol)
        .bind(&state.exchange_id)
        .bind(&state.timeframe)
        .bind(state.market_type)
        .bind(serde_json::to_string(&state.features)?)
        .bind(serde_json::to_string(&state.latest_features)?)
        .bind(serde_json::to_string(&state.window_candles)?)
        .bind(state.last_candle_ts)
        .bind(state.feature_rows)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn feature_state(&self, bot_id: &str) -> Result<Option<FeatureState>> {
        let raw = sqlx::query_as::<_, FeatureStateRaw>(
            "SELECT bot_id, user_id, strategy_name, symbol, exchange_id, timeframe,
                    market_type, features, latest_features, window_candles,
                    last_candle_ts, feature_rows
             FROM bot_feature_states WHERE bot_id = ?",
        )
        .bind(bot_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(raw) = raw else { return Ok(None) };
        Ok(Some(FeatureState {
            bot_id: raw.bot_id,
            user_id: raw.user_id,
            strategy_name: raw.strategy_name,
            symbol: raw.symbol,
            exchange_id: raw.exchange_id,
            timeframe: raw.timeframe,
            market_type: raw.market_type,
            features: serde_json::from_str(&raw.features)?,
            latest_features: serde_json::from_str(&raw.latest_features)?,
            window_candles: serde_json::from_str(&raw.window_candles)?,
            last_candle_ts: raw.last_candle_ts,
            feature_rows: raw.feature_rows,
        }))
    }

    /// Backfill pass: append rows to the per-candle history, skipping
    /// timestamps already recorded.
    pub async fn backfill_feature_history(
        &self,
        bot_id: &str,
        rows: &[WindowCandle],
    ) -> Result<u64> {
        let mut written = 0;
        for row in rows {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO bot_feature_history (id, bot_id, candle_ts, candle, features)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(bot_id)
            .bind(row.candle.ts)
            .bind(serde_json::to_string(&row.candle)?)
            .bind(serde_json::to_string(&row.features)?)
            .execute(self.pool())
            .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    pub async fn feature_history_count(&self, bot_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bot_feature_history WHERE bot_id = ?")
                .bind(bot_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
