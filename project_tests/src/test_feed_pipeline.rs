//! # Feed Pipeline End-to-End (in-memory)
//!
//! Drives the whole delivery path over the in-memory connectors, no
//! external services required: create users, follow, publish a tweet,
//! fan it out, check the cached timelines, the live push to the one
//! connected follower, and a cold-user hydration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lib_common::configs::Config;
use lib_common::connections::{MemoryCache, MemoryStore};
use lib_common::{FeedError, NewTweet, NewUser, ReadApi, TimelineCache, Tweet, TweetStore, User};
use servers::fanout::FanoutWorker;
use servers::gateway::{self, ConnectionRegistry, GatewayState};
use servers::ingest::TweetService;

/// The read API tier, served straight from the store: same data the HTTP
/// surface would return, minus the HTTP.
struct StoreReadApi {
    store: MemoryStore,
}

#[async_trait]
impl ReadApi for StoreReadApi {
    async fn user(&self, token: &CancellationToken, user_id: i64) -> Result<User, FeedError> {
        self.store.user(token, user_id).await
    }

    async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        self.store.followers(token, user_id).await
    }

    async fn timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        self.store.timeline(token, user_id).await
    }

    async fn tweet(&self, token: &CancellationToken, tweet_id: i64) -> Result<Tweet, FeedError> {
        self.store.tweet(token, tweet_id).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("--- feed pipeline end-to-end (in-memory) ---");

    let cfg = Config {
        stream_block: Duration::from_millis(50),
        ..Config::default()
    };
    let cache = Arc::new(MemoryCache::new(&cfg));
    let store = MemoryStore::new();
    let token = CancellationToken::new();

    let service = TweetService::new(
        Arc::new(store.clone()),
        cache.clone() as Arc<dyn TimelineCache>,
    );

    // Users and follow edges: bob and carol follow alice
    let mut ids = Vec::new();
    for name in ["alice", "bob", "carol"] {
        let id = service
            .create_user(
                &token,
                NewUser {
                    username: name.to_string(),
                    display_name: name.to_uppercase(),
                },
            )
            .await?;
        ids.push(id);
    }
    let (alice, bob, carol) = (ids[0], ids[1], ids[2]);
    for follower in [bob, carol] {
        service
            .follow(&token, follower, alice)
            .await
            .map_err(|e| anyhow::anyhow!("follow failed: {e}"))?;
    }
    println!("[1] users and follow edges created");

    // Gateway with one live connection (carol)
    let api: Arc<dyn ReadApi> = Arc::new(StoreReadApi {
        store: store.clone(),
    });
    let state = GatewayState {
        registry: ConnectionRegistry::new(),
        cache: cache.clone() as Arc<dyn TimelineCache>,
        api: api.clone(),
        hydrate_page_size: 10,
        shutdown: token.clone(),
    };
    let relay = tokio::spawn(gateway::relay_envelopes(state.clone()));
    while cache.subscriber_count().await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let (_, mut pushes) = state.registry.register(carol).await;
    println!("[2] relay running, carol connected");

    // Publish and fan out
    let tweet = service
        .publish(
            &token,
            NewTweet {
                user_id: alice,
                content: "hi".to_string(),
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("publish failed: {e}"))?;

    let worker = FanoutWorker::new(cache.clone() as Arc<dyn TimelineCache>, api.clone(), &cfg);
    let events = cache.read_created(&token, "pipeline", 10).await?;
    ensure!(events.len() == 1, "expected one created event");
    worker.process_event(&token, events[0].clone()).await;
    println!("[3] tweet {} published and fanned out", tweet.id);

    // Both followers hold the tweet at the head of their cached timeline
    for follower in [bob, carol] {
        let timeline = cache.timeline_snapshot(follower).await;
        ensure!(
            timeline.first() == Some(&tweet.id),
            "follower {follower} timeline head is {timeline:?}"
        );
    }
    ensure!(cache.pending_count().await == 0, "event was not acked");
    println!("[4] cached timelines updated");

    // Carol gets the live push; bob has no connection and loses nothing
    let pushed = tokio::time::timeout(Duration::from_secs(1), pushes.recv())
        .await
        .context("live push did not arrive")?
        .context("push channel closed")?;
    ensure!(pushed.id == tweet.id && pushed.user_id == alice && pushed.content == "hi");
    ensure!(!state.registry.is_connected(bob).await);
    println!("[5] live push delivered to the connected follower only");

    // Cold-user hydration: dave follows alice after the fact
    let dave = service
        .create_user(
            &token,
            NewUser {
                username: "dave".to_string(),
                display_name: "DAVE".to_string(),
            },
        )
        .await?;
    service
        .follow(&token, dave, alice)
        .await
        .map_err(|e| anyhow::anyhow!("follow failed: {e}"))?;

    let feed = gateway::hydrate(&state.cache, &state.api, &token, dave, 10).await?;
    ensure!(
        feed.iter().map(|t| t.id).collect::<Vec<_>>() == vec![tweet.id],
        "hydrated feed was {feed:?}"
    );
    ensure!(cache.timeline_snapshot(dave).await == vec![tweet.id]);
    println!("[6] cold-user hydration populated the cache and returned the feed");

    token.cancel();
    relay.await??;
    println!("--- all pipeline checks passed ---");
    Ok(())
}
