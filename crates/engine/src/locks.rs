use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-bot execution serializer.
///
/// The engine processes one signal at a time per bot; signals for different
/// bots run concurrently. Holding the guard makes the balance gate and the
/// position mutation appear atomic to every other writer on the same bot.
#[derive(Default)]
pub struct BotLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BotLocks {
    pub async fn acquire(&self, bot_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(bot_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_bot_serializes_different_bots_interleave() {
        let locks = Arc::new(BotLocks::default());
        let in_critical = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let locks = locks.clone();
            let in_critical = in_critical.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("bot-a").await;
                let now = in_critical.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5 + (i % 3))).await;
                in_critical.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "bot-a must serialize");

        // A different bot's lock is independent.
        let _a = locks.acquire("bot-a").await;
        let acquired_b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("bot-b"))
            .await
            .is_ok();
        assert!(acquired_b);
    }
}
