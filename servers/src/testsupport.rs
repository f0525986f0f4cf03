//! Constructible doubles and fixtures shared by the unit tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use lib_common::configs::Config;
use lib_common::{FeedError, Follow, ReadApi, Tweet, TweetStore, User};

/// Default config with a short stream block so tests never sit in a
/// five-second poll.
pub fn short_block_config() -> Config {
    Config {
        stream_block: Duration::from_millis(50),
        ..Config::default()
    }
}

pub fn tweet_at(id: i64, author: i64, content: &str) -> Tweet {
    Tweet {
        id,
        user_id: author,
        content: content.to_string(),
        created_at: Utc::now(),
    }
}

pub fn user_at(id: i64) -> User {
    User {
        id,
        username: format!("user{id}"),
        display_name: format!("User {id}"),
        created_at: Utc::now(),
    }
}

/// Read API double backed by plain maps; anything absent is a NotFound.
#[derive(Default)]
pub struct StaticReadApi {
    pub users: HashMap<i64, User>,
    pub followers: HashMap<i64, Vec<User>>,
    pub timelines: HashMap<i64, Vec<Tweet>>,
    pub tweets: HashMap<i64, Tweet>,
}

#[async_trait]
impl ReadApi for StaticReadApi {
    async fn user(&self, _token: &CancellationToken, user_id: i64) -> Result<User, FeedError> {
        self.users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(format!("user {user_id}")))
    }

    async fn followers(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        Ok(self.followers.get(&user_id).cloned().unwrap_or_default())
    }

    async fn timeline(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        Ok(self.timelines.get(&user_id).cloned().unwrap_or_default())
    }

    async fn tweet(&self, _token: &CancellationToken, tweet_id: i64) -> Result<Tweet, FeedError> {
        self.tweets
            .get(&tweet_id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(format!("tweet {tweet_id}")))
    }
}

/// Store double whose writes always fail, for the nothing-stored paths.
pub struct FailingStore;

#[async_trait]
impl TweetStore for FailingStore {
    async fn new_tweet(&self, _token: &CancellationToken, _tweet: &Tweet) -> Result<i64, FeedError> {
        Err(FeedError::Persistence("store is down".to_string()))
    }

    async fn tweet(&self, _token: &CancellationToken, id: i64) -> Result<Tweet, FeedError> {
        Err(FeedError::NotFound(format!("tweet {id}")))
    }

    async fn users_tweets(
        &self,
        _token: &CancellationToken,
        _user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        Err(FeedError::Persistence("store is down".to_string()))
    }

    async fn timeline(
        &self,
        _token: &CancellationToken,
        _user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        Err(FeedError::Persistence("store is down".to_string()))
    }

    async fn follow(&self, _token: &CancellationToken, _follow: &Follow) -> Result<(), FeedError> {
        Err(FeedError::Persistence("store is down".to_string()))
    }

    async fn followers(
        &self,
        _token: &CancellationToken,
        _user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        Err(FeedError::Persistence("store is down".to_string()))
    }

    async fn following(
        &self,
        _token: &CancellationToken,
        _user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        Err(FeedError::Persistence("store is down".to_string()))
    }

    async fn create_user(&self, _token: &CancellationToken, _user: &User) -> Result<i64, FeedError> {
        Err(FeedError::Persistence("store is down".to_string()))
    }

    async fn user(&self, _token: &CancellationToken, id: i64) -> Result<User, FeedError> {
        Err(FeedError::NotFound(format!("user {id}")))
    }
}
