//! In-memory `TweetStore`, selectable with `database_driver = "memory"`
//! for local development and used directly by service unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::interfaces::TweetStore;
use crate::model::{Follow, Tweet, User};

struct Inner {
    tweets: HashMap<i64, Tweet>,
    user_tweets: HashMap<i64, Vec<i64>>,
    follows: HashMap<i64, HashSet<i64>>, // follower -> followees
    users: HashMap<i64, User>,
    next_tweet_id: i64,
    next_user_id: i64,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                tweets: HashMap::new(),
                user_tweets: HashMap::new(),
                follows: HashMap::new(),
                users: HashMap::new(),
                next_tweet_id: 1,
                next_user_id: 1,
            })),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TweetStore for MemoryStore {
    async fn new_tweet(&self, _token: &CancellationToken, tweet: &Tweet) -> Result<i64, FeedError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_tweet_id;
        inner.next_tweet_id += 1;

        let mut stored = tweet.clone();
        stored.id = id;
        inner.tweets.insert(id, stored);
        inner.user_tweets.entry(tweet.user_id).or_default().push(id);
        Ok(id)
    }

    async fn tweet(&self, _token: &CancellationToken, id: i64) -> Result<Tweet, FeedError> {
        self.inner
            .lock()
            .await
            .tweets
            .get(&id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(format!("tweet {id}")))
    }

    async fn users_tweets(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        let inner = self.inner.lock().await;
        let mut tweets: Vec<Tweet> = inner
            .user_tweets
            .get(&user_id)
            .map(|ids| ids.iter().filter_map(|id| inner.tweets.get(id).cloned()).collect())
            .unwrap_or_default();
        tweets.sort_by_key(|t| std::cmp::Reverse(t.id));
        Ok(tweets)
    }

    async fn timeline(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        let inner = self.inner.lock().await;
        let mut timeline: Vec<Tweet> = Vec::new();
        if let Some(followees) = inner.follows.get(&user_id) {
            for followee in followees {
                if let Some(ids) = inner.user_tweets.get(followee) {
                    timeline.extend(ids.iter().filter_map(|id| inner.tweets.get(id).cloned()));
                }
            }
        }
        timeline.sort_by_key(|t| std::cmp::Reverse(t.id));
        Ok(timeline)
    }

    async fn follow(&self, _token: &CancellationToken, follow: &Follow) -> Result<(), FeedError> {
        self.inner
            .lock()
            .await
            .follows
            .entry(follow.follower_id)
            .or_default()
            .insert(follow.followee_id);
        Ok(())
    }

    async fn followers(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        let inner = self.inner.lock().await;
        let mut followers: Vec<User> = inner
            .follows
            .iter()
            .filter(|(_, followees)| followees.contains(&user_id))
            .filter_map(|(follower, _)| inner.users.get(follower).cloned())
            .collect();
        followers.sort_by_key(|u| u.id);
        Ok(followers)
    }

    async fn following(
        &self,
        _token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        let inner = self.inner.lock().await;
        let mut following: Vec<User> = inner
            .follows
            .get(&user_id)
            .map(|followees| {
                followees
                    .iter()
                    .filter_map(|id| inner.users.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        following.sort_by_key(|u| u.id);
        Ok(following)
    }

    async fn create_user(&self, _token: &CancellationToken, user: &User) -> Result<i64, FeedError> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_user_id;
        inner.next_user_id += 1;

        let mut stored = user.clone();
        stored.id = id;
        inner.users.insert(id, stored);
        Ok(id)
    }

    async fn user(&self, _token: &CancellationToken, id: i64) -> Result<User, FeedError> {
        self.inner
            .lock()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| FeedError::NotFound(format!("user {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(name: &str) -> User {
        User {
            id: 0,
            username: name.to_string(),
            display_name: name.to_uppercase(),
            created_at: Utc::now(),
        }
    }

    fn tweet(user_id: i64, content: &str) -> Tweet {
        Tweet {
            id: 0,
            user_id,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_timeline_covers_followees() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();

        let alice = store.create_user(&token, &user("alice")).await.unwrap();
        let bob = store.create_user(&token, &user("bob")).await.unwrap();
        assert_eq!((alice, bob), (1, 2));

        store
            .follow(
                &token,
                &Follow {
                    follower_id: bob,
                    followee_id: alice,
                    created_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let t1 = store.new_tweet(&token, &tweet(alice, "first")).await.unwrap();
        let t2 = store.new_tweet(&token, &tweet(alice, "second")).await.unwrap();
        assert!(t2 > t1);

        let timeline = store.timeline(&token, bob).await.unwrap();
        assert_eq!(
            timeline.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![t2, t1]
        );

        let followers = store.followers(&token, alice).await.unwrap();
        assert_eq!(followers.len(), 1);
        assert_eq!(followers[0].id, bob);
    }

    #[tokio::test]
    async fn duplicate_follow_edges_are_deduped() {
        let store = MemoryStore::new();
        let token = CancellationToken::new();
        let alice = store.create_user(&token, &user("alice")).await.unwrap();
        let bob = store.create_user(&token, &user("bob")).await.unwrap();

        for _ in 0..2 {
            store
                .follow(
                    &token,
                    &Follow {
                        follower_id: bob,
                        followee_id: alice,
                        created_at: Utc::now(),
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(store.followers(&token, alice).await.unwrap().len(), 1);
    }
}
