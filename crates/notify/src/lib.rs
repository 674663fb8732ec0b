pub mod event;

pub use event::UserEvent;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// One attached client connection. The WebSocket route drains `rx` into the
/// socket; dropping the receiver marks the connection dead.
pub struct ConnectionHandle {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<String>,
}

struct Connection {
    user_id: String,
    tx: mpsc::UnboundedSender<String>,
}

/// Typed, per-user notification fan-out.
///
/// Emission is best-effort: a dead connection is removed from the bus and
/// from every topic, and never blocks or fails the emit. Messages are JSON
/// `{event, data}` envelopes with RFC3339 UTC datetimes.
#[derive(Default)]
pub struct NotificationBus {
    connections: RwLock<HashMap<u64, Connection>>,
    users: RwLock<HashMap<String, HashSet<u64>>>,
    topics: RwLock<HashMap<String, HashSet<u64>>>,
    next_id: AtomicU64,
}

/// Topic for one bot's updates.
pub fn bot_topic(bot_id: &str) -> String {
    format!("bot:{bot_id}")
}

/// Topic for one market's price ticks.
pub fn price_topic(exchange: &str, market: common::CanonicalMarket, symbol: &str) -> String {
    format!("price:{exchange}:{market}:{symbol}")
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, user_id: &str) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections.write().await.insert(
            id,
            Connection {
                user_id: user_id.to_string(),
                tx,
            },
        );
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(id);

        info!(user = user_id, conn = id, "Client connected to notification bus");
        ConnectionHandle { id, rx }
    }

    pub async fn disconnect(&self, conn_id: u64) {
        let removed = self.connections.write().await.remove(&conn_id);
        if let Some(conn) = removed {
            let mut users = self.users.write().await;
            if let Some(set) = users.get_mut(&conn.user_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    users.remove(&conn.user_id);
                }
            }
            info!(user = %conn.user_id, conn = conn_id, "Client disconnected");
        }

        let mut topics = self.topics.write().await;
        topics.retain(|_, subscribers| {
            subscribers.remove(&conn_id);
            !subscribers.is_empty()
        });
    }

    pub async fn is_user_connected(&self, user_id: &str) -> bool {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    pub async fn subscribe_topic(&self, conn_id: u64, topic: &str) {
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(conn_id);
    }

    pub async fn unsubscribe_topic(&self, conn_id: u64, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Send a raw frame to one specific connection (protocol replies like
    /// PONG). Best-effort like every other emit.
    pub async fn send_to_connection(&self, conn_id: u64, message: String) {
        let dead = {
            let connections = self.connections.read().await;
            match connections.get(&conn_id) {
                Some(conn) => conn.tx.send(message).is_err(),
                None => false,
            }
        };
        if dead {
            self.disconnect(conn_id).await;
        }
    }

    /// Send to every connection of one user.
    pub async fn emit_to_user(&self, user_id: &str, event: &UserEvent) {
        let targets: Vec<u64> = self
            .users
            .read()
            .await
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.emit_to(&targets, event).await;
    }

    /// Send to every subscriber of one topic.
    pub async fn emit_to_topic(&self, topic: &str, event: &UserEvent) {
        let targets: Vec<u64> = self
            .topics
            .read()
            .await
            .get(topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.emit_to(&targets, event).await;
    }

    pub async fn broadcast(&self, event: &UserEvent) {
        let targets: Vec<u64> = self.connections.read().await.keys().copied().collect();
        self.emit_to(&targets, event).await;
    }

    async fn emit_to(&self, targets: &[u64], event: &UserEvent) {
        if targets.is_empty() {
            return;
        }
        let message = match serde_json::to_string(event) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to encode bus event");
                return;
            }
        };

        let mut dead = Vec::new();
        {
            let connections = self.connections.read().await;
            for &id in targets {
                match connections.get(&id) {
                    Some(conn) if conn.tx.send(message.clone()).is_ok() => {}
                    Some(_) => dead.push(id),
                    None => {}
                }
            }
        }
        for id in dead {
            warn!(conn = id, "Dropping dead bus connection");
            self.disconnect(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::CanonicalMarket;

    #[tokio::test]
    async fn user_receives_emitted_event() {
        let bus = NotificationBus::new();
        let mut handle = bus.connect("u1").await;

        bus.emit_to_user(
            "u1",
            &UserEvent::BalanceUpdate {
                market_type: CanonicalMarket::Cex,
                asset: "USDT".into(),
                amount: 900.0,
                updated_at: Utc::now(),
            },
        )
        .await;

        let message = handle.rx.recv().await.expect("message");
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["event"], "balance_update");
        assert_eq!(value["data"]["marketType"], "CEX");
        assert_eq!(value["data"]["amount"], 900.0);
    }

    #[tokio::test]
    async fn emission_to_other_users_is_isolated() {
        let bus = NotificationBus::new();
        let mut a = bus.connect("u1").await;
        let mut b = bus.connect("u2").await;

        bus.emit_to_user("u1", &UserEvent::BotDeleted { id: "bot1".into() })
            .await;

        assert!(a.rx.recv().await.is_some());
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_connection_is_removed_without_blocking() {
        let bus = NotificationBus::new();
        let handle = bus.connect("u1").await;
        let id = handle.id;
        drop(handle); // receiver gone

        bus.emit_to_user("u1", &UserEvent::BotDeleted { id: "bot1".into() })
            .await;

        assert!(!bus.is_user_connected("u1").await);
        assert!(bus.connections.read().await.get(&id).is_none());
    }

    #[tokio::test]
    async fn topic_subscription_routes_and_cleans_up() {
        let bus = NotificationBus::new();
        let mut a = bus.connect("u1").await;
        let mut b = bus.connect("u2").await;

        let topic = bot_topic("bot1");
        bus.subscribe_topic(a.id, &topic).await;

        bus.emit_to_topic(&topic, &UserEvent::BotDeleted { id: "bot1".into() })
            .await;
        assert!(a.rx.recv().await.is_some());
        assert!(b.rx.try_recv().is_err());

        bus.unsubscribe_topic(a.id, &topic).await;
        bus.emit_to_topic(&topic, &UserEvent::BotDeleted { id: "bot1".into() })
            .await;
        assert!(a.rx.try_recv().is_err());
    }
}
