//! # Redis Cache/Broker Contract Check
//!
//! Exercises the cache contract against a live Redis instance: pipeline
//! atomicity effects, trim bounds, read-back order, wholesale follower
//! overwrite, pub/sub delivery, the tweet-created consumer group and TTL
//! expiry. Destructive on the keys it touches; point it at a scratch
//! database.
//!
//! Run with: `cargo run -p project_tests --bin test_cache_redis`
//! (`CHIRP_REDIS_URL` overrides the default `redis://127.0.0.1:6379/`).

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use lib_common::configs::Config;
use lib_common::connections::RedisCache;
use lib_common::{FanoutEnvelope, FeedError, TimelineCache, Tweet, User};

// High ids so a shared scratch database is unlikely to collide
const AUTHOR: i64 = 910_001;
const FOLLOWER_A: i64 = 910_002;
const FOLLOWER_B: i64 = 910_003;
const TWEET_ID: i64 = 990_001;

fn sample_tweet(id: i64) -> Tweet {
    Tweet {
        id,
        user_id: AUTHOR,
        content: "hello from the contract check".to_string(),
        created_at: Utc::now(),
    }
}

fn sample_user(id: i64) -> User {
    User {
        id,
        username: format!("user{id}"),
        display_name: format!("User {id}"),
        created_at: Utc::now(),
    }
}

async fn cleanup(redis_url: &str) -> Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = client.get_connection_manager().await?;
    let keys = vec![
        format!("tweet:{TWEET_ID}"),
        format!("timeline:{FOLLOWER_A}"),
        format!("timeline:{FOLLOWER_B}"),
        format!("followers:{AUTHOR}"),
    ];
    let _: i64 = redis::cmd("DEL")
        .arg(&keys)
        .query_async(&mut conn)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let redis_url = std::env::var("CHIRP_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());

    let cfg = Config {
        redis_url: redis_url.clone(),
        max_timeline_items: 3,
        tweet_ttl: Duration::from_secs(2),
        stream_block: Duration::from_millis(500),
        ..Config::default()
    };

    cleanup(&redis_url).await?;
    let cache = RedisCache::connect(&cfg)
        .await
        .context("is Redis running?")?;
    let token = CancellationToken::new();
    println!("--- redis cache/broker contract check ({redis_url}) ---");

    // Subscribe before publishing anything
    let mut pushes = cache.subscribe_envelopes(token.clone()).await?;

    // [1] tweet object round-trip
    let tweet = sample_tweet(TWEET_ID);
    cache.push_tweet(&token, &tweet).await?;
    let cached = cache.tweet(&token, TWEET_ID).await?;
    ensure!(cached == tweet, "cached tweet differs from the original");
    println!("[1] tweet object round-trip");

    // [2] timeline cap and read-back order (newest first)
    for id in 1..=5 {
        cache.push_to_user_feed(&token, FOLLOWER_A, id).await?;
    }
    let timeline = cache.user_timeline(&token, FOLLOWER_A, 10).await?;
    ensure!(
        timeline == vec![5, 4, 3],
        "timeline was {timeline:?}, expected [5, 4, 3]"
    );
    ensure!(cache.timeline_exists(&token, FOLLOWER_A).await?);
    ensure!(!cache.timeline_exists(&token, FOLLOWER_B).await?);
    println!("[2] timeline capped at {} and newest first", cfg.max_timeline_items);

    // [3] wholesale follower overwrite, then a single-edge append
    cache
        .set_followers(
            &token,
            AUTHOR,
            &[sample_user(FOLLOWER_A), sample_user(FOLLOWER_B)],
        )
        .await?;
    cache
        .set_followers(&token, AUTHOR, &[sample_user(FOLLOWER_A)])
        .await?;
    let followers = cache.followers(&token, AUTHOR).await?;
    ensure!(
        followers == vec![FOLLOWER_A],
        "followers were {followers:?} after overwrite"
    );
    cache
        .add_follower(
            &token,
            &lib_common::Follow {
                follower_id: FOLLOWER_B,
                followee_id: AUTHOR,
                created_at: Utc::now(),
            },
        )
        .await?;
    ensure!(cache.followers(&token, AUTHOR).await?.len() == 2);
    println!("[3] follower snapshot overwrite and append");

    // [4] pub/sub delivery to the live subscriber
    let envelope = FanoutEnvelope {
        user_id: FOLLOWER_A,
        tweet: tweet.clone(),
    };
    cache.publish_envelope(&token, &envelope).await?;
    let payload = tokio::time::timeout(Duration::from_secs(2), pushes.recv())
        .await
        .context("no pub/sub delivery")?
        .context("subscription closed")?;
    let received: FanoutEnvelope = serde_json::from_str(&payload)?;
    ensure!(received == envelope, "envelope changed in transit");
    println!("[4] pub/sub envelope delivery");

    // [5] consumer group: the event from [1] is pending for us
    let mut found = None;
    for _ in 0..10 {
        let events = cache.read_created(&token, "contract-check", 16).await?;
        if let Some(event) = events
            .iter()
            .find(|e| e.payload == TWEET_ID.to_string())
        {
            found = Some(event.clone());
            break;
        }
        if events.is_empty() {
            break;
        }
        // Foreign events from earlier runs: ack and keep scanning
        for event in &events {
            cache.ack_created(&token, &event.entry_id).await?;
        }
    }
    let event = found.context("tweet-created event never surfaced")?;
    cache.ack_created(&token, &event.entry_id).await?;
    println!("[5] tweet-created stream delivered and acked");

    // [6] TTL expiry reads as NotFound
    tokio::time::sleep(cfg.tweet_ttl + Duration::from_secs(1)).await;
    match cache.tweet(&token, TWEET_ID).await {
        Err(FeedError::NotFound(_)) => println!("[6] tweet object expired into NotFound"),
        other => anyhow::bail!("expected NotFound after TTL, got {other:?}"),
    }

    token.cancel();
    cleanup(&redis_url).await?;
    println!("--- all contract checks passed ---");
    Ok(())
}
