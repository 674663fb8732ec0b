use chrono::Utc;
use uuid::Uuid;

use common::Result;

use crate::models::AppConfig;
use crate::Store;

impl Store {
    /// The user's config document; defaults when none is stored or the
    /// stored document fails to parse (legacy shapes are tolerated by serde
    /// defaults before it comes to that).
    pub async fn app_config(&self, user_id: &str) -> Result<AppConfig> {
        let doc: Option<(String,)> =
            sqlx::query_as("SELECT doc FROM app_configs WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(self.pool())
                .await?;

        Ok(doc
            .and_then(|(doc,)| serde_json::from_str(&doc).ok())
            .unwrap_or_default())
    }

    /// Users whose telegram whitelist admits `chat_id`. Drives fan-out of an
    /// inbound channel message into per-user signal processing.
    pub async fn users_allowing_chat(&self, chat_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT user_id, doc FROM app_configs")
                .fetch_all(self.pool())
                .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(user_id, doc)| {
                let config: AppConfig = serde_json::from_str(&doc).ok()?;
                config
                    .telegram_channels
                    .allow
                    .iter()
                    .any(|allowed| allowed == chat_id)
                    .then_some(user_id)
            })
            .collect())
    }

    pub async fn save_app_config(&self, user_id: &str, config: &AppConfig) -> Result<()> {
        let doc = serde_json::to_string(config)?;
        sqlx::query(
            "INSERT INTO app_configs (id, user_id, doc, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(doc)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradingModePref;

    #[tokio::test]
    async fn missing_config_yields_defaults() {
        let store = Store::in_memory().await.unwrap();
        let config = store.app_config("nobody").await.unwrap();
        assert!(config.is_auto_enabled);
        assert_eq!(config.trading_mode, TradingModePref::Demo);
    }

    #[tokio::test]
    async fn config_round_trips() {
        let store = Store::in_memory().await.unwrap();
        let mut config = AppConfig::default();
        config.is_auto_enabled = false;
        config.bot_strategy.max_active_telegram_bots = 2;
        config.telegram_channels.allow = vec!["-100123".into()];

        store.save_app_config("u1", &config).await.unwrap();
        let loaded = store.app_config("u1").await.unwrap();
        assert!(!loaded.is_auto_enabled);
        assert_eq!(loaded.bot_strategy.max_active_telegram_bots, 2);
        assert_eq!(loaded.telegram_channels.allow, vec!["-100123".to_string()]);
    }
}
