use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use common::{CanonicalMarket, Result};
use notify::{NotificationBus, UserEvent};
use store::Store;

/// Canonical store of simulated funds, keyed `(user, canonicalMarket, asset)`.
///
/// The execution engine is the only component that mutates balances at
/// runtime; the startup migration folds legacy rows before any write is
/// accepted. Every mutation emits a `balance_update` on the owner's channel.
pub struct VirtualLedger {
    store: Store,
    bus: Arc<NotificationBus>,
}

impl VirtualLedger {
    pub fn new(store: Store, bus: Arc<NotificationBus>) -> Self {
        Self { store, bus }
    }

    /// Absolute write.
    pub async fn set(
        &self,
        user_id: &str,
        market: CanonicalMarket,
        asset: &str,
        amount: f64,
    ) -> Result<f64> {
        let row = self
            .store
            .set_virtual_balance(user_id, market, asset, amount)
            .await?;
        self.emit(user_id, market, asset, row.amount).await;
        Ok(row.amount)
    }

    /// Relative write; `delta` may be negative. Negative results are not
    /// rejected here: the engine's balance gate is the guard.
    pub async fn add(
        &self,
        user_id: &str,
        market: CanonicalMarket,
        asset: &str,
        delta: f64,
    ) -> Result<f64> {
        let row = self
            .store
            .add_virtual_balance(user_id, market, asset, delta)
            .await?;
        self.emit(user_id, market, asset, row.amount).await;
        Ok(row.amount)
    }

    /// Current balance. A missing row is bootstrapped to `bootstrap` when
    /// provided (first touch of a fresh demo account), otherwise reads 0.
    pub async fn available(
        &self,
        user_id: &str,
        market: CanonicalMarket,
        asset: &str,
        bootstrap: Option<f64>,
    ) -> Result<f64> {
        if let Some(row) = self.store.virtual_balance(user_id, market, asset).await? {
            return Ok(row.amount);
        }
        match bootstrap {
            Some(initial) => {
                info!(user = user_id, %market, asset, initial, "Bootstrapping virtual balance");
                self.set(user_id, market, asset, initial).await
            }
            None => Ok(0.0),
        }
    }

    async fn emit(&self, user_id: &str, market: CanonicalMarket, asset: &str, amount: f64) {
        self.bus
            .emit_to_user(
                user_id,
                &UserEvent::BalanceUpdate {
                    market_type: market,
                    asset: asset.to_string(),
                    amount,
                    updated_at: Utc::now(),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger() -> (VirtualLedger, Arc<NotificationBus>) {
        let store = Store::in_memory().await.unwrap();
        let bus = Arc::new(NotificationBus::new());
        (VirtualLedger::new(store, bus.clone()), bus)
    }

    #[tokio::test]
    async fn mutations_emit_balance_updates() {
        let (ledger, bus) = ledger().await;
        let mut conn = bus.connect("u1").await;

        ledger.set("u1", CanonicalMarket::Cex, "USDT", 1000.0).await.unwrap();
        ledger.add("u1", CanonicalMarket::Cex, "USDT", -100.0).await.unwrap();

        let first: serde_json::Value =
            serde_json::from_str(&conn.rx.recv().await.unwrap()).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(&conn.rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["data"]["amount"], 1000.0);
        assert_eq!(second["data"]["amount"], 900.0);
    }

    #[tokio::test]
    async fn missing_balance_bootstraps_only_when_asked() {
        let (ledger, _bus) = ledger().await;

        let cold = ledger
            .available("u1", CanonicalMarket::Cex, "USDT", None)
            .await
            .unwrap();
        assert_eq!(cold, 0.0);

        let seeded = ledger
            .available("u1", CanonicalMarket::Cex, "USDT", Some(10_000.0))
            .await
            .unwrap();
        assert_eq!(seeded, 10_000.0);

        // Second read sees the persisted row, not a fresh bootstrap.
        ledger.add("u1", CanonicalMarket::Cex, "USDT", -500.0).await.unwrap();
        let warm = ledger
            .available("u1", CanonicalMarket::Cex, "USDT", Some(10_000.0))
            .await
            .unwrap();
        assert_eq!(warm, 9_500.0);
    }
}
