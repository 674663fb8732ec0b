use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use common::{CanonicalMarket, Result};

use crate::Store;

impl Store {
    /// Idempotent one-shot data migrations. Run on every start, before the
    /// engine accepts any signal.
    pub async fn run_startup_migrations(&self) -> Result<()> {
        self.fold_virtual_balance_casings().await?;
        Ok(())
    }

    /// Collapse `virtual_balances` rows that differ only by `market_type`
    /// casing ("cex", "spot", "SPOT", ...) into one canonical CEX/DEX row
    /// whose amount is the sum of the merged rows.
    async fn fold_virtual_balance_casings(&self) -> Result<()> {
        // Read market_type as raw text: legacy rows predate the canonical enum.
        let rows: Vec<(String, String, String, String, f64)> = sqlx::query_as(
            "SELECT id, user_id, market_type, asset, amount FROM virtual_balances",
        )
        .fetch_all(self.pool())
        .await?;

        let mut groups: HashMap<(String, CanonicalMarket, String), Vec<(String, String, f64)>> =
            HashMap::new();
        for (id, user_id, market_type, asset, amount) in rows {
            let canonical = CanonicalMarket::from_label(&market_type);
            groups
                .entry((user_id, canonical, asset))
                .or_default()
                .push((id, market_type, amount));
        }

        let mut tx = self.pool().begin().await?;
        let mut merged = 0usize;
        for ((user_id, canonical, asset), members) in groups {
            let already_canonical =
                members.len() == 1 && members[0].1 == canonical.to_string();
            if already_canonical {
                continue;
            }

            let total: f64 = members.iter().map(|(_, _, amount)| amount).sum();
            for (id, _, _) in &members {
                sqlx::query("DELETE FROM virtual_balances WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query(
                "INSERT INTO virtual_balances (id, user_id, market_type, asset, amount, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&user_id)
            .bind(canonical)
            .bind(&asset)
            .bind(total)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            merged += members.len();
        }
        tx.commit().await?;

        if merged > 0 {
            tracing::info!(rows = merged, "Folded legacy virtual balance rows into canonical keys");
        }
        Ok(())
    }
}
