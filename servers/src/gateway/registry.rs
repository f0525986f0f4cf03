//! Connection registry: user id -> live push channel.
//!
//! The map is the only shared state in the gateway and every access goes
//! through the mutex. Sockets are never written directly from here; each
//! socket task owns its write half and drains its own channel, so a slow
//! client cannot block delivery to the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use lib_common::Tweet;

struct Entry {
    generation: u64,
    sender: mpsc::UnboundedSender<Tweet>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<i64, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a connection for the user, replacing any previous one
    /// (last write wins, no multi-device fan-out). The returned generation
    /// identifies this registration so a replaced connection cannot evict
    /// its successor on the way out.
    pub async fn register(&self, user_id: i64) -> (u64, mpsc::UnboundedReceiver<Tweet>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let previous = self
            .inner
            .lock()
            .await
            .insert(user_id, Entry { generation, sender });
        if previous.is_some() {
            log::info!("user {user_id} reconnected, replacing previous connection");
        }
        (generation, receiver)
    }

    /// Removes the registration if it still belongs to this generation.
    pub async fn deregister(&self, user_id: i64, generation: u64) {
        let mut map = self.inner.lock().await;
        if map
            .get(&user_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            map.remove(&user_id);
        }
    }

    /// Hands the tweet to the user's connection. A closed channel counts
    /// as a disconnect and evicts the entry. Returns whether the tweet
    /// reached a live connection.
    pub async fn deliver(&self, user_id: i64, tweet: Tweet) -> bool {
        let mut map = self.inner.lock().await;
        match map.get(&user_id) {
            Some(entry) => {
                if entry.sender.send(tweet).is_err() {
                    log::info!("user {user_id} unreachable, evicting connection");
                    map.remove(&user_id);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, user_id: i64) -> bool {
        self.inner.lock().await.contains_key(&user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::tweet_at;

    #[tokio::test]
    async fn last_write_wins_and_old_receiver_closes() {
        let registry = ConnectionRegistry::new();
        let (first_gen, mut first_rx) = registry.register(5).await;
        let (_second_gen, mut second_rx) = registry.register(5).await;
        assert_eq!(registry.connection_count().await, 1);

        assert!(registry.deliver(5, tweet_at(1, 9, "x")).await);
        // Only the newest connection sees the push
        assert!(first_rx.recv().await.is_none());
        assert_eq!(second_rx.recv().await.unwrap().id, 1);

        // The replaced connection's cleanup must not evict the new one
        registry.deregister(5, first_gen).await;
        assert!(registry.is_connected(5).await);
    }

    #[tokio::test]
    async fn send_failure_evicts_the_connection() {
        let registry = ConnectionRegistry::new();
        let (_, rx) = registry.register(7).await;
        drop(rx);

        assert!(!registry.deliver(7, tweet_at(1, 9, "x")).await);
        assert!(!registry.is_connected(7).await);
    }

    #[tokio::test]
    async fn delivery_to_absent_user_is_dropped() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.deliver(12, tweet_at(1, 9, "x")).await);
    }
}
