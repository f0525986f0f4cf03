//! # Fan-out Worker
//!
//! Turns one tweet-created event into N per-follower cache writes and
//! live pushes. Each event runs through Resolve (parse id, fetch tweet,
//! fetch followers with API read-through) and Distribute (bounded
//! concurrency over the follower set, every follower an independent
//! failure domain). Events are acknowledged after the distribution
//! attempt; poison events are acknowledged and dropped; transient
//! resolve failures stay pending so the stream redelivers them.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use lib_common::configs::Config;
use lib_common::{CreatedEvent, FanoutEnvelope, FeedError, ReadApi, TimelineCache, Tweet};

const READ_BATCH: usize = 16;
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutStage {
    FeedWrite,
    LivePush,
}

#[derive(Debug)]
pub struct FanoutFailure {
    pub follower_id: i64,
    pub stage: FanoutStage,
    pub error: FeedError,
}

/// Aggregated outcome of one tweet's distribution.
#[derive(Debug)]
pub struct FanoutReport {
    pub tweet_id: i64,
    pub followers: usize,
    pub feed_ok: usize,
    pub push_ok: usize,
    pub failures: Vec<FanoutFailure>,
}

#[derive(Clone)]
pub struct FanoutWorker {
    cache: Arc<dyn TimelineCache>,
    api: Arc<dyn ReadApi>,
    consumer: String,
    concurrency: usize,
    drain_timeout: Duration,
}

impl FanoutWorker {
    pub fn new(cache: Arc<dyn TimelineCache>, api: Arc<dyn ReadApi>, cfg: &Config) -> Self {
        FanoutWorker {
            cache,
            api,
            consumer: cfg.consumer_name.clone(),
            concurrency: cfg.fanout_concurrency.max(1),
            drain_timeout: cfg.drain_timeout,
        }
    }

    /// Consumption loop. Distribution of distinct tweets runs on separate
    /// tasks so a slow fan-out does not block the next event. Returns an
    /// error only when the event source keeps failing, which is fatal for
    /// this instance: there is no replay beyond the stream itself, so the
    /// process restarts and re-reads its pending entries.
    pub async fn run(&self, token: CancellationToken) -> Result<(), FeedError> {
        let tracker = TaskTracker::new();
        let mut consecutive_failures = 0u32;

        while !token.is_cancelled() {
            let events = match self
                .cache
                .read_created(&token, &self.consumer, READ_BATCH)
                .await
            {
                Ok(events) => {
                    consecutive_failures = 0;
                    events
                }
                Err(e) => {
                    consecutive_failures += 1;
                    log::error!(
                        "tweet-created read failed (attempt {consecutive_failures}): {e}"
                    );
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        tracker.close();
                        let _ = tokio::time::timeout(self.drain_timeout, tracker.wait()).await;
                        return Err(e);
                    }
                    let backoff =
                        Duration::from_millis(500 * 2u64.pow(consecutive_failures.min(4)));
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
            };

            for event in events {
                let worker = self.clone();
                let shutdown = token.clone();
                tracker.spawn(async move {
                    worker.process_event(&shutdown, event).await;
                });
            }
        }

        tracker.close();
        if tokio::time::timeout(self.drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            log::warn!("shutdown drain timed out with distributions still in flight");
        }
        Ok(())
    }

    /// Resolve + Distribute for a single event.
    pub async fn process_event(&self, shutdown: &CancellationToken, event: CreatedEvent) {
        // Per-op deadlines bound each call; the shutdown token is only
        // consulted between followers so the one in flight can finish.
        let op_token = CancellationToken::new();

        let tweet_id: i64 = match event.payload.trim().parse() {
            Ok(id) => id,
            Err(e) => {
                log::warn!(
                    "dropping malformed tweet-created event {}: {e}",
                    event.entry_id
                );
                self.ack(&op_token, &event).await;
                return;
            }
        };

        let tweet = match self.cache.tweet(&op_token, tweet_id).await {
            Ok(tweet) => tweet,
            Err(FeedError::NotFound(_)) => {
                log::warn!("tweet {tweet_id} expired before fan-out, dropping event");
                self.ack(&op_token, &event).await;
                return;
            }
            Err(e @ FeedError::Serialization(_)) => {
                log::warn!("tweet {tweet_id} unreadable, dropping event: {e}");
                self.ack(&op_token, &event).await;
                return;
            }
            Err(e) => {
                // Left unacked so the stream redelivers it
                log::error!("failed to resolve tweet {tweet_id}: {e}");
                return;
            }
        };

        let followers = match self.resolve_followers(&op_token, tweet.user_id).await {
            Ok(followers) => followers,
            Err(e) => {
                log::error!(
                    "failed to resolve followers of user {}: {e}",
                    tweet.user_id
                );
                return;
            }
        };

        let report = self.distribute(shutdown, &op_token, &tweet, &followers).await;
        if report.failures.is_empty() {
            log::info!(
                "tweet {} fanned out to {} followers",
                report.tweet_id,
                report.followers
            );
        } else {
            log::warn!(
                "tweet {} fan-out: {}/{} feed writes, {}/{} pushes, {} failures",
                report.tweet_id,
                report.feed_ok,
                report.followers,
                report.push_ok,
                report.followers,
                report.failures.len()
            );
        }
        self.ack(&op_token, &event).await;
    }

    /// Follower ids from the cache, read through the upstream API when the
    /// snapshot is missing. An empty snapshot is indistinguishable from a
    /// missing one, so empty triggers the fallback too.
    async fn resolve_followers(
        &self,
        token: &CancellationToken,
        author_id: i64,
    ) -> Result<Vec<i64>, FeedError> {
        let cached = self.cache.followers(token, author_id).await?;
        if !cached.is_empty() {
            return Ok(cached);
        }
        let fetched = self.api.followers(token, author_id).await?;
        self.cache.set_followers(token, author_id, &fetched).await?;
        Ok(fetched.iter().map(|u| u.id).collect())
    }

    /// Bounded-concurrency distribution. Both sub-steps are attempted for
    /// every follower regardless of what happened to the others.
    pub async fn distribute(
        &self,
        shutdown: &CancellationToken,
        token: &CancellationToken,
        tweet: &Tweet,
        followers: &[i64],
    ) -> FanoutReport {
        let outcomes: Vec<(i64, Result<(), FeedError>, Result<(), FeedError>)> =
            futures_util::stream::iter(followers.iter().copied())
                .map(|follower_id| {
                    let cache = Arc::clone(&self.cache);
                    let tweet = tweet.clone();
                    async move {
                        if shutdown.is_cancelled() {
                            let skipped = || {
                                Err(FeedError::Transient(
                                    "skipped during shutdown".to_string(),
                                ))
                            };
                            return (follower_id, skipped(), skipped());
                        }
                        let feed = cache
                            .push_to_user_feed(token, follower_id, tweet.id)
                            .await;
                        let envelope = FanoutEnvelope {
                            user_id: follower_id,
                            tweet: tweet.clone(),
                        };
                        let push = cache.publish_envelope(token, &envelope).await;
                        (follower_id, feed, push)
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut report = FanoutReport {
            tweet_id: tweet.id,
            followers: followers.len(),
            feed_ok: 0,
            push_ok: 0,
            failures: Vec::new(),
        };
        for (follower_id, feed, push) in outcomes {
            match feed {
                Ok(()) => report.feed_ok += 1,
                Err(error) => {
                    log::warn!("feed write for follower {follower_id} failed: {error}");
                    report.failures.push(FanoutFailure {
                        follower_id,
                        stage: FanoutStage::FeedWrite,
                        error,
                    });
                }
            }
            match push {
                Ok(()) => report.push_ok += 1,
                Err(error) => {
                    log::warn!("live push for follower {follower_id} failed: {error}");
                    report.failures.push(FanoutFailure {
                        follower_id,
                        stage: FanoutStage::LivePush,
                        error,
                    });
                }
            }
        }
        report
    }

    async fn ack(&self, token: &CancellationToken, event: &CreatedEvent) {
        if let Err(e) = self.cache.ack_created(token, &event.entry_id).await {
            log::error!("failed to ack event {}: {e}", event.entry_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{short_block_config, tweet_at, user_at, StaticReadApi};
    use lib_common::connections::MemoryCache;
    use lib_common::TimelineCache;

    fn worker(cache: Arc<MemoryCache>, api: StaticReadApi) -> FanoutWorker {
        FanoutWorker::new(
            cache as Arc<dyn TimelineCache>,
            Arc::new(api),
            &short_block_config(),
        )
    }

    #[tokio::test]
    async fn every_follower_gets_a_feed_write_and_a_push() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let token = CancellationToken::new();
        let tweet = tweet_at(1, 1, "hi");
        cache.push_tweet(&token, &tweet).await.unwrap();

        let worker = worker(cache.clone(), StaticReadApi::default());
        let followers = vec![2, 3, 4];
        let report = worker
            .distribute(&token, &token, &tweet, &followers)
            .await;

        assert_eq!(report.followers, 3);
        assert_eq!(report.feed_ok, 3);
        assert_eq!(report.push_ok, 3);
        assert!(report.failures.is_empty());

        for follower in followers {
            assert_eq!(cache.timeline_snapshot(follower).await, vec![1]);
        }
        let published = cache.published().await;
        assert_eq!(published.len(), 3);
        assert!(published.iter().all(|e| e.tweet.id == 1));
    }

    #[tokio::test]
    async fn one_failing_follower_does_not_abort_the_rest() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let token = CancellationToken::new();
        cache.inject_feed_failure(3).await;
        let tweet = tweet_at(1, 1, "hi");

        let worker = worker(cache.clone(), StaticReadApi::default());
        let report = worker
            .distribute(&token, &token, &tweet, &[2, 3, 4])
            .await;

        assert_eq!(report.feed_ok, 2);
        // The push is still attempted for the follower whose feed write failed
        assert_eq!(report.push_ok, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].follower_id, 3);
        assert_eq!(report.failures[0].stage, FanoutStage::FeedWrite);

        assert_eq!(cache.timeline_snapshot(2).await, vec![1]);
        assert_eq!(cache.timeline_snapshot(3).await, Vec::<i64>::new());
        assert_eq!(cache.timeline_snapshot(4).await, vec![1]);
    }

    #[tokio::test]
    async fn expired_tweet_event_is_acked_and_dropped() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let token = CancellationToken::new();
        // Event exists but the tweet object was never cached
        let event = CreatedEvent {
            entry_id: "1-1".to_string(),
            payload: "42".to_string(),
        };

        let worker = worker(cache.clone(), StaticReadApi::default());
        worker.process_event(&token, event).await;

        assert!(cache.published().await.is_empty());
        assert_eq!(cache.pending_count().await, 0);
    }

    #[tokio::test]
    async fn missing_follower_snapshot_reads_through_the_api() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let token = CancellationToken::new();
        let tweet = tweet_at(7, 1, "hello");
        cache.push_tweet(&token, &tweet).await.unwrap();

        let mut api = StaticReadApi::default();
        api.followers.insert(1, vec![user_at(2), user_at(3)]);

        let worker = worker(cache.clone(), api);
        let events = cache.read_created(&token, "c1", 10).await.unwrap();
        worker.process_event(&token, events[0].clone()).await;

        // Snapshot materialized and both followers served
        assert_eq!(cache.follower_snapshot(1).await, vec![2, 3]);
        assert_eq!(cache.timeline_snapshot(2).await, vec![7]);
        assert_eq!(cache.timeline_snapshot(3).await, vec![7]);
        assert_eq!(cache.pending_count().await, 0);
    }

    #[tokio::test]
    async fn run_drains_and_exits_on_cancellation() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let token = CancellationToken::new();
        let worker = worker(cache.clone(), StaticReadApi::default());

        let handle = {
            let worker = worker.clone();
            let token = token.clone();
            tokio::spawn(async move { worker.run(token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let res = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop after cancellation")
            .unwrap();
        assert!(res.is_ok());
    }
}
