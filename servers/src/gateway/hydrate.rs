//! Feed hydration for a freshly connected user.
//!
//! Order matters: the follower snapshot is refreshed wholesale first so
//! future fan-outs see this user; the timeline is only materialized when
//! the cache has none (read-through on miss, not a refresh); the page is
//! then resolved id by id, cache first, API second, skipping whatever
//! neither side can produce.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lib_common::{FeedError, ReadApi, TimelineCache, Tweet};

pub async fn hydrate(
    cache: &Arc<dyn TimelineCache>,
    api: &Arc<dyn ReadApi>,
    token: &CancellationToken,
    user_id: i64,
    page_size: usize,
) -> Result<Vec<Tweet>, FeedError> {
    let user = api.user(token, user_id).await?;
    let followers = api.followers(token, user.id).await?;
    cache.set_followers(token, user_id, &followers).await?;

    if !cache.timeline_exists(token, user_id).await? {
        let timeline = api.timeline(token, user_id).await?;
        cache.store_timeline(token, user_id, &timeline).await?;
    }

    let ids = cache.user_timeline(token, user_id, page_size).await?;
    let mut tweets = Vec::with_capacity(ids.len());
    for id in ids {
        match cache.tweet(token, id).await {
            Ok(tweet) => tweets.push(tweet),
            Err(_) => match api.tweet(token, id).await {
                Ok(tweet) => tweets.push(tweet),
                Err(e) => {
                    log::warn!("tweet {id} unresolved while hydrating user {user_id}: {e}");
                }
            },
        }
    }
    Ok(tweets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{short_block_config, tweet_at, user_at, StaticReadApi};
    use lib_common::connections::MemoryCache;

    fn api_for_user_5() -> StaticReadApi {
        let mut api = StaticReadApi::default();
        api.users.insert(5, user_at(5));
        api.followers.insert(5, vec![user_at(8), user_at(9)]);
        api.timelines
            .insert(5, vec![tweet_at(3, 1, "c"), tweet_at(2, 1, "b"), tweet_at(1, 1, "a")]);
        api.tweets.insert(3, tweet_at(3, 1, "c"));
        api.tweets.insert(2, tweet_at(2, 1, "b"));
        api.tweets.insert(1, tweet_at(1, 1, "a"));
        api
    }

    #[tokio::test]
    async fn fresh_user_is_populated_from_the_api() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let dyn_cache: Arc<dyn TimelineCache> = cache.clone();
        let api: Arc<dyn ReadApi> = Arc::new(api_for_user_5());
        let token = CancellationToken::new();

        let tweets = hydrate(&dyn_cache, &api, &token, 5, 10).await.unwrap();

        // Follower snapshot and timeline both materialized, newest first
        assert_eq!(cache.follower_snapshot(5).await, vec![8, 9]);
        assert_eq!(cache.timeline_snapshot(5).await, vec![3, 2, 1]);
        assert_eq!(
            tweets.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
    }

    #[tokio::test]
    async fn hydration_is_idempotent() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let dyn_cache: Arc<dyn TimelineCache> = cache.clone();
        let api: Arc<dyn ReadApi> = Arc::new(api_for_user_5());
        let token = CancellationToken::new();

        hydrate(&dyn_cache, &api, &token, 5, 10).await.unwrap();
        hydrate(&dyn_cache, &api, &token, 5, 10).await.unwrap();

        // The existing timeline is not re-populated and the snapshot is
        // overwritten, not appended
        assert_eq!(cache.timeline_snapshot(5).await, vec![3, 2, 1]);
        assert_eq!(cache.follower_snapshot(5).await, vec![8, 9]);
    }

    #[tokio::test]
    async fn unresolvable_tweets_are_skipped_not_fatal() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let dyn_cache: Arc<dyn TimelineCache> = cache.clone();
        let mut api = api_for_user_5();
        // Tweet 2 is gone from both the cache and the API
        api.tweets.remove(&2);
        let api: Arc<dyn ReadApi> = Arc::new(api);
        let token = CancellationToken::new();

        let tweets = hydrate(&dyn_cache, &api, &token, 5, 10).await.unwrap();
        assert_eq!(
            tweets.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![3, 1]
        );
    }

    #[tokio::test]
    async fn unknown_user_aborts_hydration() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let dyn_cache: Arc<dyn TimelineCache> = cache.clone();
        let api: Arc<dyn ReadApi> = Arc::new(StaticReadApi::default());
        let token = CancellationToken::new();

        let err = hydrate(&dyn_cache, &api, &token, 42, 10).await.unwrap_err();
        assert!(matches!(err, FeedError::NotFound(_)));
        assert!(cache.follower_snapshot(42).await.is_empty());
    }
}
