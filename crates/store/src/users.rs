use chrono::Utc;
use uuid::Uuid;

use common::Result;

use crate::models::{ExchangeCredentialRow, UserRow};
use crate::Store;

impl Store {
    pub async fn create_user(&self, open_id: &str, hashed_secret: &str) -> Result<UserRow> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, open_id, hashed_secret, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(open_id)
        .bind(hashed_secret)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.user(&id).await?.ok_or_else(|| {
            common::Error::Other(format!("user {id} missing immediately after insert"))
        })
    }

    pub async fn user(&self, id: &str) -> Result<Option<UserRow>> {
        Ok(
            sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn user_by_open_id(&self, open_id: &str) -> Result<Option<UserRow>> {
        Ok(
            sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE open_id = ?")
                .bind(open_id)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Store a credential and make it the single active one for
    /// (user, exchange): previous actives are switched off first.
    pub async fn upsert_exchange_credential(
        &self,
        user_id: &str,
        exchange_id: &str,
        api_key: &str,
        secret: &str,
        passphrase: Option<&str>,
        uid: Option<&str>,
    ) -> Result<ExchangeCredentialRow> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "UPDATE user_exchanges SET active = 0 WHERE user_id = ? AND exchange_id = ? AND active = 1",
        )
        .bind(user_id)
        .bind(exchange_id)
        .execute(&mut *tx)
        .await?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO user_exchanges (id, user_id, exchange_id, api_key, secret, passphrase, uid, active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(exchange_id)
        .bind(api_key)
        .bind(secret)
        .bind(passphrase)
        .bind(uid)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.active_exchange_credential(user_id, exchange_id)
            .await?
            .ok_or_else(|| common::Error::Other("credential missing after upsert".into()))
    }

    pub async fn active_exchange_credential(
        &self,
        user_id: &str,
        exchange_id: &str,
    ) -> Result<Option<ExchangeCredentialRow>> {
        Ok(sqlx::query_as::<_, ExchangeCredentialRow>(
            "SELECT * FROM user_exchanges WHERE user_id = ? AND exchange_id = ? AND active = 1",
        )
        .bind(user_id)
        .bind(exchange_id)
        .fetch_optional(self.pool())
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::Store;

    #[tokio::test]
    async fn one_active_credential_per_user_and_exchange() {
        let store = Store::in_memory().await.unwrap();
        let user = store.create_user("alice", "hash").await.unwrap();

        store
            .upsert_exchange_credential(&user.id, "binance", "key1", "sec1", None, None)
            .await
            .unwrap();
        let second = store
            .upsert_exchange_credential(&user.id, "binance", "key2", "sec2", None, None)
            .await
            .unwrap();

        assert_eq!(second.api_key, "key2");
        let active = store
            .active_exchange_credential(&user.id, "binance")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.api_key, "key2");
    }
}
