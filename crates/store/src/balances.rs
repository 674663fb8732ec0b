use chrono::Utc;
use uuid::Uuid;

use common::{CanonicalMarket, Result};

use crate::models::VirtualBalance;
use crate::Store;

impl Store {
    pub async fn virtual_balance(
        &self,
        user_id: &str,
        market: CanonicalMarket,
        asset: &str,
    ) -> Result<Option<VirtualBalance>> {
        Ok(sqlx::query_as::<_, VirtualBalance>(
            "SELECT * FROM virtual_balances WHERE user_id = ? AND market_type = ? AND asset = ?",
        )
        .bind(user_id)
        .bind(market)
        .bind(asset)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn virtual_balances_for_user(&self, user_id: &str) -> Result<Vec<VirtualBalance>> {
        Ok(sqlx::query_as::<_, VirtualBalance>(
            "SELECT * FROM virtual_balances WHERE user_id = ? ORDER BY market_type, asset",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Absolute upsert on the `(user, canonicalMarket, asset)` key.
    pub async fn set_virtual_balance(
        &self,
        user_id: &str,
        market: CanonicalMarket,
        asset: &str,
        amount: f64,
    ) -> Result<VirtualBalance> {
        sqlx::query(
            "INSERT INTO virtual_balances (id, user_id, market_type, asset, amount, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, market_type, asset)
             DO UPDATE SET amount = excluded.amount, updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(market)
        .bind(asset)
        .bind(amount)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.virtual_balance(user_id, market, asset)
            .await?
            .ok_or_else(|| common::Error::Other("balance row missing after upsert".into()))
    }

    /// Relative upsert; `delta` may be negative. No local non-negativity
    /// check: the engine's balance gate is the only guard, and a trade may
    /// legitimately take the row negative for a moment.
    pub async fn add_virtual_balance(
        &self,
        user_id: &str,
        market: CanonicalMarket,
        asset: &str,
        delta: f64,
    ) -> Result<VirtualBalance> {
        sqlx::query(
            "INSERT INTO virtual_balances (id, user_id, market_type, asset, amount, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, market_type, asset)
             DO UPDATE SET amount = virtual_balances.amount + excluded.amount,
                           updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(market)
        .bind(asset)
        .bind(delta)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.virtual_balance(user_id, market, asset)
            .await?
            .ok_or_else(|| common::Error::Other("balance row missing after upsert".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_add_accumulates() {
        let store = Store::in_memory().await.unwrap();
        store
            .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 1000.0)
            .await
            .unwrap();
        let row = store
            .add_virtual_balance("u1", CanonicalMarket::Cex, "USDT", -150.0)
            .await
            .unwrap();
        assert!((row.amount - 850.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn add_creates_missing_row() {
        let store = Store::in_memory().await.unwrap();
        let row = store
            .add_virtual_balance("u1", CanonicalMarket::Dex, "USDT", 42.0)
            .await
            .unwrap();
        assert_eq!(row.amount, 42.0);
    }

    #[tokio::test]
    async fn negative_amounts_are_not_rejected_locally() {
        let store = Store::in_memory().await.unwrap();
        let row = store
            .add_virtual_balance("u1", CanonicalMarket::Cex, "USDT", -10.0)
            .await
            .unwrap();
        assert_eq!(row.amount, -10.0);
    }

    #[tokio::test]
    async fn key_is_unique_per_user_market_asset() {
        let store = Store::in_memory().await.unwrap();
        store
            .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 10.0)
            .await
            .unwrap();
        store
            .set_virtual_balance("u1", CanonicalMarket::Cex, "USDT", 20.0)
            .await
            .unwrap();

        let rows = store.virtual_balances_for_user("u1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 20.0);
    }
}
