//! # Redis Cache/Broker
//!
//! The single piece of shared mutable state every service leans on:
//! ephemeral tweet objects (`tweet:<id>`, TTL'd), capped timeline lists
//! (`timeline:<user_id>`, `tweets:global`), follower-set snapshots
//! (`followers:<user_id>`), the pub/sub push channel (`workers:channel`)
//! and the durable tweet-created stream (`tweets:stream`) consumed through
//! a consumer group so a worker restart re-reads unacknowledged events.
//!
//! Multi-step writes run as MULTI/EXEC pipelines, so a concurrent reader
//! never observes a half-trimmed list or a partially overwritten
//! follower set.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::configs::Config;
use crate::error::FeedError;
use crate::interfaces::{with_deadline, TimelineCache};
use crate::model::{CreatedEvent, FanoutEnvelope, Follow, Tweet, User};

pub const GLOBAL_TWEETS_KEY: &str = "tweets:global";
pub const TWEETS_STREAM_KEY: &str = "tweets:stream";
pub const FANOUT_GROUP: &str = "fanout";
pub const WORKERS_CHANNEL: &str = "workers:channel";

pub fn tweet_key(tweet_id: i64) -> String {
    format!("tweet:{tweet_id}")
}

pub fn timeline_key(user_id: i64) -> String {
    format!("timeline:{user_id}")
}

pub fn followers_key(user_id: i64) -> String {
    format!("followers:{user_id}")
}

pub struct RedisCache {
    client: Client,
    manager: ConnectionManager,
    max_timeline_items: usize,
    max_global_tweets: usize,
    tweet_ttl: Duration,
    timeline_ttl: Duration,
    followers_ttl: Duration,
    op_timeout: Duration,
    stream_block: Duration,
}

impl RedisCache {
    /// Opens the connection manager and makes sure the fan-out consumer
    /// group exists on the tweet-created stream.
    pub async fn connect(cfg: &Config) -> Result<Self, FeedError> {
        let client = Client::open(cfg.redis_url.as_str())?;
        let manager = client.get_connection_manager().await?;

        let cache = RedisCache {
            client,
            manager,
            max_timeline_items: cfg.max_timeline_items,
            max_global_tweets: cfg.max_global_tweets,
            tweet_ttl: cfg.tweet_ttl,
            timeline_ttl: cfg.timeline_ttl,
            followers_ttl: cfg.followers_ttl,
            op_timeout: cfg.op_timeout,
            stream_block: cfg.stream_block,
        };
        cache.ensure_group().await?;
        Ok(cache)
    }

    async fn ensure_group(&self) -> Result<(), FeedError> {
        let mut conn = self.manager.clone();
        let res: Result<String, redis::RedisError> = conn
            .xgroup_create_mkstream(TWEETS_STREAM_KEY, FANOUT_GROUP, "$")
            .await;
        match res {
            Ok(_) => Ok(()),
            // The group surviving a restart is the normal case
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TimelineCache for RedisCache {
    async fn push_tweet(&self, token: &CancellationToken, tweet: &Tweet) -> Result<(), FeedError> {
        let payload = serde_json::to_string(tweet)?;
        let mut conn = self.manager.clone();
        let key = tweet_key(tweet.id);
        let ttl = self.tweet_ttl.as_secs();
        let cap = self.max_global_tweets as isize;
        let id = tweet.id;
        with_deadline(token, self.op_timeout, async move {
            let _: () = redis::pipe()
                .atomic()
                .set_ex(&key, payload, ttl)
                .ignore()
                .xadd(TWEETS_STREAM_KEY, "*", &[("tweet_id", id)])
                .ignore()
                .lpush(GLOBAL_TWEETS_KEY, id)
                .ignore()
                .ltrim(GLOBAL_TWEETS_KEY, 0, cap - 1)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn tweet(&self, token: &CancellationToken, tweet_id: i64) -> Result<Tweet, FeedError> {
        let mut conn = self.manager.clone();
        let key = tweet_key(tweet_id);
        with_deadline(token, self.op_timeout, async move {
            let raw: Option<String> = conn.get(&key).await?;
            let raw = raw.ok_or_else(|| FeedError::NotFound(format!("tweet {tweet_id}")))?;
            Ok(serde_json::from_str(&raw)?)
        })
        .await
    }

    async fn push_to_user_feed(
        &self,
        token: &CancellationToken,
        user_id: i64,
        tweet_id: i64,
    ) -> Result<(), FeedError> {
        let mut conn = self.manager.clone();
        let key = timeline_key(user_id);
        let cap = self.max_timeline_items as isize;
        let ttl = self.timeline_ttl.as_secs() as i64;
        with_deadline(token, self.op_timeout, async move {
            let _: () = redis::pipe()
                .atomic()
                .lpush(&key, tweet_id)
                .ignore()
                .ltrim(&key, 0, cap - 1)
                .ignore()
                .expire(&key, ttl)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn user_timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<i64>, FeedError> {
        let mut conn = self.manager.clone();
        let key = timeline_key(user_id);
        with_deadline(token, self.op_timeout, async move {
            let values: Vec<String> = conn.lrange(&key, 0, limit as isize - 1).await?;
            parse_ids(values)
        })
        .await
    }

    async fn timeline_exists(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<bool, FeedError> {
        let mut conn = self.manager.clone();
        let key = timeline_key(user_id);
        with_deadline(token, self.op_timeout, async move {
            let exists: bool = conn.exists(&key).await?;
            Ok(exists)
        })
        .await
    }

    async fn store_timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
        tweets: &[Tweet],
    ) -> Result<(), FeedError> {
        if tweets.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let key = timeline_key(user_id);
        let cap = self.max_timeline_items as isize;
        let ttl = self.timeline_ttl.as_secs() as i64;
        // Input arrives newest first; pushing in reverse leaves the newest
        // id at the list head.
        let ids: Vec<i64> = tweets.iter().rev().map(|t| t.id).collect();
        with_deadline(token, self.op_timeout, async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in ids {
                pipe.lpush(&key, id).ignore();
            }
            pipe.ltrim(&key, 0, cap - 1).ignore();
            pipe.expire(&key, ttl).ignore();
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn recent_global(
        &self,
        token: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<i64>, FeedError> {
        let mut conn = self.manager.clone();
        with_deadline(token, self.op_timeout, async move {
            let values: Vec<String> = conn.lrange(GLOBAL_TWEETS_KEY, 0, limit as isize - 1).await?;
            parse_ids(values)
        })
        .await
    }

    async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<i64>, FeedError> {
        let mut conn = self.manager.clone();
        let key = followers_key(user_id);
        with_deadline(token, self.op_timeout, async move {
            let values: Vec<String> = conn.lrange(&key, 0, -1).await?;
            parse_ids(values)
        })
        .await
    }

    async fn set_followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
        followers: &[User],
    ) -> Result<(), FeedError> {
        let mut conn = self.manager.clone();
        let key = followers_key(user_id);
        let ttl = self.followers_ttl.as_secs() as i64;
        let ids: Vec<i64> = followers.iter().map(|u| u.id).collect();
        with_deadline(token, self.op_timeout, async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(&key).ignore();
            for id in ids {
                pipe.lpush(&key, id).ignore();
            }
            pipe.expire(&key, ttl).ignore();
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn add_follower(
        &self,
        token: &CancellationToken,
        follow: &Follow,
    ) -> Result<(), FeedError> {
        let mut conn = self.manager.clone();
        let key = followers_key(follow.followee_id);
        let follower_id = follow.follower_id;
        let ttl = self.followers_ttl.as_secs() as i64;
        with_deadline(token, self.op_timeout, async move {
            let _: () = redis::pipe()
                .atomic()
                .lpush(&key, follower_id)
                .ignore()
                .expire(&key, ttl)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn publish_envelope(
        &self,
        token: &CancellationToken,
        envelope: &FanoutEnvelope,
    ) -> Result<(), FeedError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.manager.clone();
        with_deadline(token, self.op_timeout, async move {
            let _: i64 = conn.publish(WORKERS_CHANNEL, payload).await?;
            Ok(())
        })
        .await
    }

    async fn subscribe_envelopes(
        &self,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, FeedError> {
        let mut pubsub = with_deadline(&token, self.op_timeout, async {
            Ok(self.client.get_async_pubsub().await?)
        })
        .await?;
        with_deadline(&token, self.op_timeout, async {
            pubsub.subscribe(WORKERS_CHANNEL).await?;
            Ok(())
        })
        .await?;

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = messages.next() => match msg {
                        Some(msg) => match msg.get_payload::<String>() {
                            Ok(payload) => {
                                if tx.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("{WORKERS_CHANNEL} payload decode failed: {e}"),
                        },
                        // Broker connection lost; dropping tx closes the
                        // receiver and the subscriber decides what's fatal.
                        None => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn read_created(
        &self,
        token: &CancellationToken,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<CreatedEvent>, FeedError> {
        let mut conn = self.manager.clone();
        let opts = StreamReadOptions::default()
            .group(FANOUT_GROUP, consumer)
            .count(max)
            .block(self.stream_block.as_millis() as usize);
        tokio::select! {
            _ = token.cancelled() => Ok(Vec::new()),
            res = async move {
                let reply: StreamReadReply = conn
                    .xread_options(&[TWEETS_STREAM_KEY], &[">"], &opts)
                    .await?;
                let mut events = Vec::new();
                for key in reply.keys {
                    for entry in key.ids {
                        let payload: String = entry.get("tweet_id").unwrap_or_default();
                        events.push(CreatedEvent {
                            entry_id: entry.id.clone(),
                            payload,
                        });
                    }
                }
                Ok(events)
            } => res,
        }
    }

    async fn ack_created(
        &self,
        token: &CancellationToken,
        entry_id: &str,
    ) -> Result<(), FeedError> {
        let mut conn = self.manager.clone();
        let entry = entry_id.to_string();
        with_deadline(token, self.op_timeout, async move {
            let _: i64 = conn.xack(TWEETS_STREAM_KEY, FANOUT_GROUP, &[entry]).await?;
            Ok(())
        })
        .await
    }
}

fn parse_ids(values: Vec<String>) -> Result<Vec<i64>, FeedError> {
    values
        .into_iter()
        .map(|v| {
            v.parse::<i64>()
                .map_err(|e| FeedError::Serialization(format!("failed to parse id '{v}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_space_matches_contract() {
        assert_eq!(tweet_key(7), "tweet:7");
        assert_eq!(timeline_key(7), "timeline:7");
        assert_eq!(followers_key(7), "followers:7");
    }

    #[test]
    fn parse_ids_surfaces_bad_entries_as_serialization() {
        assert_eq!(
            parse_ids(vec!["3".into(), "2".into(), "1".into()]).unwrap(),
            vec![3, 2, 1]
        );
        let err = parse_ids(vec!["3".into(), "x".into()]).unwrap_err();
        assert!(matches!(err, FeedError::Serialization(_)));
    }
}
