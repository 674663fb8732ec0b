pub mod balances;
pub mod bots;
pub mod configs;
pub mod features;
pub mod migrate;
pub mod models;
pub mod positions;
pub mod signals;
pub mod telegram;
pub mod trades;
pub mod users;

pub use models::*;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use common::Result;
use exchange::hub::{Credential, CredentialSource};

/// Persistence layer over SQLite. One instance is shared by every service;
/// repositories are grouped per collection in this crate's modules.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect, run schema migrations, then the one-shot data migrations.
    /// Must complete before the engine accepts any signal.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| common::Error::Database(e.into()))?;
        let store = Self { pool };
        store.run_startup_migrations().await?;
        info!("Database ready");
        Ok(store)
    }

    /// Fresh in-memory database for tests. A single connection keeps all
    /// queries on the same memory instance.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| common::Error::Database(e.into()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CredentialSource for Store {
    async fn active_credential(
        &self,
        user_id: &str,
        exchange_id: &str,
    ) -> Result<Option<Credential>> {
        Ok(self
            .active_exchange_credential(user_id, exchange_id)
            .await?
            .map(|row| Credential {
                api_key: row.api_key,
                secret: row.secret,
                passphrase: row.passphrase,
                uid: row.uid,
            }))
    }
}
