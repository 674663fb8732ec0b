use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use common::{Error, ExchangeAdapter, MarketKind, Result};

use crate::binance::BinanceAdapter;

/// Active API credential for one (user, exchange).
#[derive(Debug, Clone)]
pub struct Credential {
    pub api_key: String,
    pub secret: String,
    pub passphrase: Option<String>,
    pub uid: Option<String>,
}

/// Where the hub looks up per-user credentials. The persistence layer
/// implements this; tests provide a fixed map.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn active_credential(
        &self,
        user_id: &str,
        exchange_id: &str,
    ) -> Result<Option<Credential>>;
}

type AdapterMap<K> = Mutex<HashMap<K, Arc<dyn ExchangeAdapter>>>;

/// Caches exchange adapter instances.
///
/// One public (credential-less) instance per (exchange, market) is shared by
/// all users for tickers and history. Per-user instances are built lazily
/// from the active credential and shared across that user's bots; they are
/// only closed by `close_all` on shutdown, never while bots reference them.
pub struct ExchangeHub {
    credentials: Arc<dyn CredentialSource>,
    public: AdapterMap<(String, MarketKind)>,
    user: AdapterMap<(String, String, MarketKind)>,
}

impl ExchangeHub {
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            credentials,
            public: Mutex::new(HashMap::new()),
            user: Mutex::new(HashMap::new()),
        }
    }

    fn build(
        exchange_id: &str,
        market: MarketKind,
        credential: Option<&Credential>,
    ) -> Result<Arc<dyn ExchangeAdapter>> {
        match exchange_id {
            "binance" => {
                let adapter: Arc<dyn ExchangeAdapter> = match credential {
                    Some(cred) => Arc::new(BinanceAdapter::with_credentials(
                        market,
                        cred.api_key.clone(),
                        cred.secret.clone(),
                    )),
                    None => Arc::new(BinanceAdapter::public(market)),
                };
                Ok(adapter)
            }
            other => Err(Error::Market(format!("unsupported exchange '{other}'"))),
        }
    }

    /// Shared read-only instance for public market data.
    pub async fn public(
        &self,
        exchange_id: &str,
        market: MarketKind,
    ) -> Result<Arc<dyn ExchangeAdapter>> {
        let key = (exchange_id.to_string(), market);
        let mut cache = self.public.lock().await;
        if let Some(adapter) = cache.get(&key) {
            return Ok(adapter.clone());
        }
        let adapter = Self::build(exchange_id, market, None)?;
        info!(exchange = exchange_id, market = %market, "Public exchange instance created");
        cache.insert(key, adapter.clone());
        Ok(adapter)
    }

    /// Per-user instance built from the active credential. `Auth` error when
    /// the user has no active credential for the exchange.
    pub async fn for_user(
        &self,
        user_id: &str,
        exchange_id: &str,
        market: MarketKind,
    ) -> Result<Arc<dyn ExchangeAdapter>> {
        let key = (user_id.to_string(), exchange_id.to_string(), market);
        {
            let cache = self.user.lock().await;
            if let Some(adapter) = cache.get(&key) {
                return Ok(adapter.clone());
            }
        }

        let credential = self
            .credentials
            .active_credential(user_id, exchange_id)
            .await?
            .ok_or_else(|| {
                Error::Auth(format!("no active credential for user on {exchange_id}"))
            })?;

        let adapter = Self::build(exchange_id, market, Some(&credential))?;
        info!(user = user_id, exchange = exchange_id, "User exchange instance created");
        self.user.lock().await.insert(key, adapter.clone());
        Ok(adapter)
    }

    /// Inject a pre-built adapter (other exchange backends, test doubles).
    pub async fn register_public(
        &self,
        exchange_id: &str,
        market: MarketKind,
        adapter: Arc<dyn ExchangeAdapter>,
    ) {
        self.public
            .lock()
            .await
            .insert((exchange_id.to_string(), market), adapter);
    }

    pub async fn register_for_user(
        &self,
        user_id: &str,
        exchange_id: &str,
        market: MarketKind,
        adapter: Arc<dyn ExchangeAdapter>,
    ) {
        self.user
            .lock()
            .await
            .insert((user_id.to_string(), exchange_id.to_string(), market), adapter);
    }

    /// Close every cached handle. Called once on shutdown.
    pub async fn close_all(&self) {
        for adapter in self.public.lock().await.values() {
            if let Err(e) = adapter.close().await {
                warn!(error = %e, "Failed closing public exchange instance");
            }
        }
        for adapter in self.user.lock().await.values() {
            if let Err(e) = adapter.close().await {
                warn!(error = %e, "Failed closing user exchange instance");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockExchange;

    struct NoCredentials;

    #[async_trait]
    impl CredentialSource for NoCredentials {
        async fn active_credential(&self, _: &str, _: &str) -> Result<Option<Credential>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn public_instances_are_cached_per_exchange_and_market() {
        let hub = ExchangeHub::new(Arc::new(NoCredentials));
        let a = hub.public("binance", MarketKind::Spot).await.unwrap();
        let b = hub.public("binance", MarketKind::Spot).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = hub.public("binance", MarketKind::Futures).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn missing_credential_surfaces_auth_error() {
        let hub = ExchangeHub::new(Arc::new(NoCredentials));
        let err = hub
            .for_user("u1", "binance", MarketKind::Spot)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn unsupported_exchange_is_a_market_error() {
        let hub = ExchangeHub::new(Arc::new(NoCredentials));
        let err = hub.public("hyperliquid", MarketKind::Spot).await.unwrap_err();
        assert!(matches!(err, Error::Market(_)));
    }

    #[tokio::test]
    async fn registered_adapter_wins_over_builtin() {
        let hub = ExchangeHub::new(Arc::new(NoCredentials));
        let mock = Arc::new(MockExchange::new("kraken"));
        hub.register_public("kraken", MarketKind::Spot, mock.clone())
            .await;
        let got = hub.public("kraken", MarketKind::Spot).await.unwrap();
        assert_eq!(got.id(), "kraken");
    }
}
