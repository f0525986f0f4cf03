//! # Tweet Ingestion
//!
//! Writes go to the authoritative store first, then to the cache/broker.
//! A cache or announce failure after the store write is a degraded
//! success: the record is durable, distribution may lag, and the caller
//! hears about it instead of the failure being swallowed.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use lib_common::{
    FeedError, Follow, NewTweet, NewUser, PublishError, TimelineCache, Tweet, TweetStore, User,
};

pub struct TweetService {
    store: Arc<dyn TweetStore>,
    cache: Arc<dyn TimelineCache>,
}

impl TweetService {
    pub fn new(store: Arc<dyn TweetStore>, cache: Arc<dyn TimelineCache>) -> Self {
        TweetService { store, cache }
    }

    /// Persists the tweet, then caches the object and records the
    /// tweet-created event in one atomic cache write. No rollback on the
    /// second step: the store remains the source of truth.
    pub async fn publish(
        &self,
        token: &CancellationToken,
        new: NewTweet,
    ) -> Result<Tweet, PublishError> {
        let mut tweet = Tweet {
            id: 0,
            user_id: new.user_id,
            content: new.content,
            created_at: Utc::now(),
        };
        tweet.id = self.store.new_tweet(token, &tweet).await?;

        if let Err(source) = self.cache.push_tweet(token, &tweet).await {
            return Err(PublishError::Degraded {
                id: tweet.id,
                source,
            });
        }
        Ok(tweet)
    }

    /// Persists the follow edge, then appends the single edge to the
    /// followee's snapshot. Both users must exist; following yourself is
    /// rejected outright.
    pub async fn follow(
        &self,
        token: &CancellationToken,
        follower_id: i64,
        followee_id: i64,
    ) -> Result<Follow, PublishError> {
        if follower_id == followee_id {
            return Err(PublishError::Rejected(
                "a user cannot follow themselves".to_string(),
            ));
        }
        self.store.user(token, follower_id).await?;
        self.store.user(token, followee_id).await?;

        let follow = Follow {
            follower_id,
            followee_id,
            created_at: Utc::now(),
        };
        self.store.follow(token, &follow).await?;

        if let Err(source) = self.cache.add_follower(token, &follow).await {
            return Err(PublishError::Degraded {
                id: followee_id,
                source,
            });
        }
        Ok(follow)
    }

    pub async fn create_user(
        &self,
        token: &CancellationToken,
        new: NewUser,
    ) -> Result<i64, FeedError> {
        let user = User {
            id: 0,
            username: new.username,
            display_name: new.display_name,
            created_at: Utc::now(),
        };
        self.store.create_user(token, &user).await
    }

    pub async fn user(&self, token: &CancellationToken, id: i64) -> Result<User, FeedError> {
        self.store.user(token, id).await
    }

    pub async fn tweet(&self, token: &CancellationToken, id: i64) -> Result<Tweet, FeedError> {
        self.store.tweet(token, id).await
    }

    pub async fn users_tweets(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        self.store.users_tweets(token, user_id).await
    }

    pub async fn timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        self.store.timeline(token, user_id).await
    }

    pub async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        self.store.followers(token, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{short_block_config, FailingStore};
    use lib_common::connections::{MemoryCache, MemoryStore};

    async fn seeded() -> (TweetService, Arc<MemoryCache>, CancellationToken) {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let store = Arc::new(MemoryStore::new());
        let token = CancellationToken::new();
        for name in ["alice", "bob"] {
            store
                .create_user(
                    &token,
                    &User {
                        id: 0,
                        username: name.to_string(),
                        display_name: name.to_string(),
                        created_at: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }
        (
            TweetService::new(store, cache.clone() as Arc<dyn TimelineCache>),
            cache,
            token,
        )
    }

    #[tokio::test]
    async fn publish_assigns_id_and_records_created_event() {
        let (service, cache, token) = seeded().await;
        let tweet = service
            .publish(
                &token,
                NewTweet {
                    user_id: 1,
                    content: "hello".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(tweet.id, 1);

        // Cached object is readable and the created event is queued
        assert_eq!(cache.tweet(&token, tweet.id).await.unwrap().content, "hello");
        let events = cache.read_created(&token, "c1", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, "1");
    }

    #[tokio::test]
    async fn store_failure_aborts_before_anything_is_announced() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let service = TweetService::new(
            Arc::new(FailingStore),
            cache.clone() as Arc<dyn TimelineCache>,
        );
        let token = CancellationToken::new();

        let err = service
            .publish(
                &token,
                NewTweet {
                    user_id: 1,
                    content: "hello".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Persistence(_)));
        assert!(cache.read_created(&token, "c1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn self_follow_is_rejected() {
        let (service, _cache, token) = seeded().await;
        let err = service.follow(&token, 1, 1).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
    }

    #[tokio::test]
    async fn follow_appends_single_edge_to_snapshot() {
        let (service, cache, token) = seeded().await;
        service.follow(&token, 2, 1).await.unwrap();
        assert_eq!(cache.follower_snapshot(1).await, vec![2]);
    }

    #[tokio::test]
    async fn follow_unknown_user_is_a_not_found() {
        let (service, _cache, token) = seeded().await;
        let err = service.follow(&token, 2, 99).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::Persistence(FeedError::NotFound(_))
        ));
    }
}
