//! # In-Memory Cache/Broker
//!
//! A full `TimelineCache` implementation over mutex-guarded maps: the
//! constructible double for unit tests and the in-process pipeline check.
//! TTLs use the tokio clock so tests can pause and advance time, the
//! tweet-created stream keeps pending/ack bookkeeping like the real
//! consumer group, and per-user fault injection exercises the
//! failure-isolation paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::configs::Config;
use crate::error::FeedError;
use crate::interfaces::TimelineCache;
use crate::model::{CreatedEvent, FanoutEnvelope, Follow, Tweet, User};

struct Inner {
    tweets: HashMap<i64, (Tweet, Instant)>,
    timelines: HashMap<i64, (VecDeque<i64>, Instant)>,
    followers: HashMap<i64, Vec<i64>>,
    global: VecDeque<i64>,
    stream: VecDeque<CreatedEvent>,
    pending: Vec<CreatedEvent>,
    next_entry_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    next_subscriber_id: u64,
    published: Vec<FanoutEnvelope>,
    feed_failures: HashSet<i64>,
}

#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Mutex<Inner>>,
    max_timeline_items: usize,
    max_global_tweets: usize,
    tweet_ttl: Duration,
    timeline_ttl: Duration,
    stream_block: Duration,
}

impl MemoryCache {
    pub fn new(cfg: &Config) -> Self {
        MemoryCache {
            inner: Arc::new(Mutex::new(Inner {
                tweets: HashMap::new(),
                timelines: HashMap::new(),
                followers: HashMap::new(),
                global: VecDeque::new(),
                stream: VecDeque::new(),
                pending: Vec::new(),
                next_entry_id: 1,
                subscribers: HashMap::new(),
                next_subscriber_id: 1,
                published: Vec::new(),
                feed_failures: HashSet::new(),
            })),
            max_timeline_items: cfg.max_timeline_items,
            max_global_tweets: cfg.max_global_tweets,
            tweet_ttl: cfg.tweet_ttl,
            timeline_ttl: cfg.timeline_ttl,
            stream_block: cfg.stream_block,
        }
    }

    /// Makes every feed insert for `user_id` fail with a transient error.
    pub async fn inject_feed_failure(&self, user_id: i64) {
        self.inner.lock().await.feed_failures.insert(user_id);
    }

    /// Every envelope published so far, in order.
    pub async fn published(&self) -> Vec<FanoutEnvelope> {
        self.inner.lock().await.published.clone()
    }

    /// Current (unexpired) timeline content, newest first.
    pub async fn timeline_snapshot(&self, user_id: i64) -> Vec<i64> {
        let mut inner = self.inner.lock().await;
        match inner.timelines.get(&user_id) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                inner.timelines.remove(&user_id);
                Vec::new()
            }
            Some((ids, _)) => ids.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    pub async fn follower_snapshot(&self, user_id: i64) -> Vec<i64> {
        self.inner
            .lock()
            .await
            .followers
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Events handed out but not yet acknowledged.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Pushes a raw payload to subscribers, bypassing serialization.
    /// Lets tests exercise the malformed-envelope path.
    pub async fn publish_raw(&self, payload: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .subscribers
            .retain(|_, tx| tx.try_send(payload.to_string()).is_ok());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// Requeues unacknowledged events, simulating a consumer restart.
    pub async fn redeliver_pending(&self) {
        let mut inner = self.inner.lock().await;
        let pending: Vec<CreatedEvent> = inner.pending.drain(..).collect();
        for event in pending.into_iter().rev() {
            inner.stream.push_front(event);
        }
    }
}

#[async_trait]
impl TimelineCache for MemoryCache {
    async fn push_tweet(&self, _token: &CancellationToken, tweet: &Tweet) -> Result<(), FeedError> {
        let mut inner = self.inner.lock().await;
        let expiry = Instant::now() + self.tweet_ttl;
        inner.tweets.insert(tweet.id, (tweet.clone(), expiry));

        let entry_id = format!("{}-1", inner.next_entry_id);
        inner.next_entry_id += 1;
        inner.stream.push_back(CreatedEvent {
            entry_id,
            payload: tweet.id.to_string(),
        });

        inner.global.push_front(tweet.id);
        inner.global.truncate(self.max_global_tweets);
        Ok(())
    }

    async fn tweet(&self, _token: &CancellationToken, tweet_id: i64) -> Result<Tweet, FeedError> {
        let mut inner = self.inner.lock().await;
        match inner.tweets.get(&tweet_id) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                inner.tweets.remove(&tweet_id);
                Err(FeedError::NotFound(format!("tweet {tweet_id}")))
            }
            Some((tweet, _)) => Ok(tweet.clone()),
            None => Err(FeedError::NotFound(format!("tweet {tweet_id}"))),
        }
    }

    async fn push_to_user_feed(
        &self,
        _token: &CancellationToken,
        user_id: i64,
        tweet_id: i64,
    ) -> Result<(), FeedError> {
        let mut inner = self.inner.lock().await;
        if inner.feed_failures.contains(&user_id) {
            return Err(FeedError::Transient(format!(
                "injected feed failure for user {user_id}"
            )));
        }
        let expiry = Instant::now() + self.timeline_ttl;
        let entry = inner
            .timelines
            .entry(user_id)
            .or_insert_with(|| (VecDeque::new(), expiry));
        entry.0.push_front(tweet_id);
        entry.0.truncate(self.max_timeline_items);
        entry.1 = expiry;
        Ok(())
    }

    async fn user_timeline(
        &self,
        _token: &CancellationToken,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>, FeedError> {
        // Missing and expired both read as an empty list, like LRANGE
        Ok(self
            .timeline_snapshot(user_id)
            .await
            .into_iter()
            .take(limit)
            .collect())
    }

    async fn timeline_exists(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<bool, FeedError> {
        let mut inner = self.inner.lock().await;
        match inner.timelines.get(&user_id) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                inner.timelines.remove(&user_id);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn store_timeline(
        &self,
        _token: &CancellationToken,
        user_id: i64,
        tweets: &[Tweet],
    ) -> Result<(), FeedError> {
        if tweets.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let expiry = Instant::now() + self.timeline_ttl;
        let entry = inner
            .timelines
            .entry(user_id)
            .or_insert_with(|| (VecDeque::new(), expiry));
        for tweet in tweets.iter().rev() {
            entry.0.push_front(tweet.id);
        }
        entry.0.truncate(self.max_timeline_items);
        entry.1 = expiry;
        Ok(())
    }

    async fn recent_global(
        &self,
        _token: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<i64>, FeedError> {
        Ok(self
            .inner
            .lock()
            .await
            .global
            .iter()
            .copied()
            .take(limit)
            .collect())
    }

    async fn followers(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<i64>, FeedError> {
        Ok(self.follower_snapshot(user_id).await)
    }

    async fn set_followers(
        &self,
        _token: &CancellationToken,
        user_id: i64,
        followers: &[User],
    ) -> Result<(), FeedError> {
        let ids: Vec<i64> = followers.iter().map(|u| u.id).collect();
        self.inner.lock().await.followers.insert(user_id, ids);
        Ok(())
    }

    async fn add_follower(
        &self,
        _token: &CancellationToken,
        follow: &Follow,
    ) -> Result<(), FeedError> {
        self.inner
            .lock()
            .await
            .followers
            .entry(follow.followee_id)
            .or_default()
            .insert(0, follow.follower_id);
        Ok(())
    }

    async fn publish_envelope(
        &self,
        _token: &CancellationToken,
        envelope: &FanoutEnvelope,
    ) -> Result<(), FeedError> {
        let payload = serde_json::to_string(envelope)?;
        let mut inner = self.inner.lock().await;
        inner.published.push(envelope.clone());
        inner.subscribers.retain(|_, tx| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("dropping envelope for a slow subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    async fn subscribe_envelopes(
        &self,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, FeedError> {
        let (tx, rx) = mpsc::channel(256);
        let id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.insert(id, tx);
            id
        };
        // Cancellation drops the sender so the receiver sees the close
        let shared = Arc::clone(&self.inner);
        tokio::spawn(async move {
            token.cancelled().await;
            shared.lock().await.subscribers.remove(&id);
        });
        Ok(rx)
    }

    async fn read_created(
        &self,
        token: &CancellationToken,
        _consumer: &str,
        max: usize,
    ) -> Result<Vec<CreatedEvent>, FeedError> {
        let deadline = Instant::now() + self.stream_block;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.stream.is_empty() {
                    let take = max.min(inner.stream.len());
                    let events: Vec<CreatedEvent> = inner.stream.drain(..take).collect();
                    inner.pending.extend(events.iter().cloned());
                    return Ok(events);
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = token.cancelled() => return Ok(Vec::new()),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }

    async fn ack_created(
        &self,
        _token: &CancellationToken,
        entry_id: &str,
    ) -> Result<(), FeedError> {
        self.inner
            .lock()
            .await
            .pending
            .retain(|e| e.entry_id != entry_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cache() -> MemoryCache {
        MemoryCache::new(&Config {
            max_timeline_items: 3,
            ..Config::default()
        })
    }

    fn tweet(id: i64) -> Tweet {
        Tweet {
            id,
            user_id: 1,
            content: format!("tweet {id}"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn timeline_is_capped_and_newest_first() {
        let cache = cache();
        let token = CancellationToken::new();
        for id in 1..=5 {
            cache.push_to_user_feed(&token, 9, id).await.unwrap();
        }
        let ids = cache.user_timeline(&token, 9, 10).await.unwrap();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn tweet_object_expires_after_ttl() {
        let cache = MemoryCache::new(&Config {
            tweet_ttl: Duration::from_secs(60),
            ..Config::default()
        });
        let token = CancellationToken::new();
        cache.push_tweet(&token, &tweet(1)).await.unwrap();
        assert!(cache.tweet(&token, 1).await.is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = cache.tweet(&token, 1).await.unwrap_err();
        assert!(matches!(err, FeedError::NotFound(_)));
    }

    #[tokio::test]
    async fn set_followers_overwrites_wholesale() {
        let cache = cache();
        let token = CancellationToken::new();
        let old: Vec<User> = [2, 3]
            .iter()
            .map(|id| User {
                id: *id,
                username: format!("u{id}"),
                display_name: String::new(),
                created_at: Utc::now(),
            })
            .collect();
        cache.set_followers(&token, 1, &old).await.unwrap();
        cache.set_followers(&token, 1, &old[..1]).await.unwrap();
        assert_eq!(cache.followers(&token, 1).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn unacked_events_survive_redelivery() {
        let cache = cache();
        let token = CancellationToken::new();
        cache.push_tweet(&token, &tweet(7)).await.unwrap();

        let events = cache.read_created(&token, "c1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, "7");
        assert_eq!(cache.pending_count().await, 1);

        cache.redeliver_pending().await;
        let again = cache.read_created(&token, "c1", 10).await.unwrap();
        assert_eq!(again[0].payload, "7");

        cache.ack_created(&token, &again[0].entry_id).await.unwrap();
        assert_eq!(cache.pending_count().await, 0);
    }
}
