//! # Capability Interfaces
//!
//! One trait per collaborator: the cache/broker (`TimelineCache`), the
//! authoritative store (`TweetStore`) and the upstream read API
//! (`ReadApi`). Services hold `Arc<dyn …>` so production connectors and
//! in-memory doubles are interchangeable. Every operation takes a
//! cancellation token and is expected to finish within the connector's
//! configured deadline; `with_deadline` is the guard the connectors share.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::model::{CreatedEvent, FanoutEnvelope, Follow, Tweet, User};

/// Runs `fut` until it finishes, the deadline elapses (`Transient`) or the
/// token is cancelled (`Transient`). Cooperative cancellation at every
/// suspension point comes down to wrapping each blocking call in this.
pub async fn with_deadline<T>(
    token: &CancellationToken,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, FeedError>>,
) -> Result<T, FeedError> {
    tokio::select! {
        _ = token.cancelled() => Err(FeedError::Transient("operation cancelled".to_string())),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(elapsed) => Err(elapsed.into()),
        },
    }
}

/// The cache/broker contract: bounded TTL'd timeline lists, ephemeral
/// tweet objects, follower-set snapshots, the durable tweet-created
/// stream and the fan-out push channel.
#[async_trait]
pub trait TimelineCache: Send + Sync {
    /// Atomically caches the tweet object with its TTL, appends the id to
    /// the capped global list and records a tweet-created event.
    async fn push_tweet(&self, token: &CancellationToken, tweet: &Tweet) -> Result<(), FeedError>;

    /// Fetches a cached tweet object. Expiry reads as `NotFound`.
    async fn tweet(&self, token: &CancellationToken, tweet_id: i64) -> Result<Tweet, FeedError>;

    /// Inserts a tweet id at the head of one follower's timeline, trims to
    /// the configured cap and refreshes the TTL, as one atomic step.
    async fn push_to_user_feed(
        &self,
        token: &CancellationToken,
        user_id: i64,
        tweet_id: i64,
    ) -> Result<(), FeedError>;

    /// Reads a windowed prefix of a user's timeline, newest first.
    async fn user_timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>, FeedError>;

    async fn timeline_exists(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<bool, FeedError>;

    /// Materializes a timeline fetched from upstream. `tweets` arrives
    /// newest first; afterwards the newest id sits at the list head.
    async fn store_timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
        tweets: &[Tweet],
    ) -> Result<(), FeedError>;

    /// Reads a windowed prefix of the global recent-tweets list.
    async fn recent_global(
        &self,
        token: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<i64>, FeedError>;

    /// Follower ids for a user. An empty result is indistinguishable from
    /// a missing snapshot; callers fall back to the read API.
    async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<i64>, FeedError>;

    /// Wholesale snapshot overwrite. Concurrent readers observe either the
    /// old or the new complete set, never a partial one.
    async fn set_followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
        followers: &[User],
    ) -> Result<(), FeedError>;

    /// Single-edge append used by explicit follow actions.
    async fn add_follower(&self, token: &CancellationToken, follow: &Follow)
        -> Result<(), FeedError>;

    /// Publishes a push envelope to whoever is subscribed right now.
    async fn publish_envelope(
        &self,
        token: &CancellationToken,
        envelope: &FanoutEnvelope,
    ) -> Result<(), FeedError>;

    /// Subscribes to the push channel. The receiver yields raw payloads
    /// until the token is cancelled or the broker connection is lost, at
    /// which point the channel closes.
    async fn subscribe_envelopes(
        &self,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, FeedError>;

    /// Blocking read of the next batch of unclaimed tweet-created events
    /// for this consumer. Returns an empty batch on an idle period or on
    /// cancellation. Events stay pending until acknowledged.
    async fn read_created(
        &self,
        token: &CancellationToken,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<CreatedEvent>, FeedError>;

    /// Acknowledges a processed (or poison) tweet-created event.
    async fn ack_created(
        &self,
        token: &CancellationToken,
        entry_id: &str,
    ) -> Result<(), FeedError>;
}

/// Authoritative persistence for tweets, users and follow edges.
#[async_trait]
pub trait TweetStore: Send + Sync {
    /// Persists a tweet and returns the assigned id.
    async fn new_tweet(&self, token: &CancellationToken, tweet: &Tweet) -> Result<i64, FeedError>;

    async fn tweet(&self, token: &CancellationToken, id: i64) -> Result<Tweet, FeedError>;

    /// Tweets authored by the user, newest first.
    async fn users_tweets(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError>;

    /// Tweets authored by the users this user follows, newest first.
    async fn timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError>;

    async fn follow(&self, token: &CancellationToken, follow: &Follow) -> Result<(), FeedError>;

    async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError>;

    async fn following(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError>;

    async fn create_user(&self, token: &CancellationToken, user: &User) -> Result<i64, FeedError>;

    async fn user(&self, token: &CancellationToken, id: i64) -> Result<User, FeedError>;
}

/// Read-through client for the upstream API, used when the cache has no
/// materialized view yet.
#[async_trait]
pub trait ReadApi: Send + Sync {
    async fn user(&self, token: &CancellationToken, user_id: i64) -> Result<User, FeedError>;

    async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError>;

    async fn timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError>;

    async fn tweet(&self, token: &CancellationToken, tweet_id: i64) -> Result<Tweet, FeedError>;
}
