//! # Real-Time Gateway
//!
//! Maps long-lived websocket connections to user ids and keeps them fed:
//! one initial JSON array on hydration, then single-tweet pushes relayed
//! from the fan-out channel. Hydration failure degrades to an un-hydrated
//! but registered connection instead of closing it.

pub mod hydrate;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use lib_common::{FanoutEnvelope, FeedError, ReadApi, TimelineCache};

pub use hydrate::hydrate;
pub use registry::ConnectionRegistry;

#[derive(Clone)]
pub struct GatewayState {
    pub registry: ConnectionRegistry,
    pub cache: Arc<dyn TimelineCache>,
    pub api: Arc<dyn ReadApi>,
    pub hydrate_page_size: usize,
    pub shutdown: CancellationToken,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Binds and serves until the shutdown token fires.
pub async fn run(port: u16, state: GatewayState, token: CancellationToken) -> anyhow::Result<()> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    log::info!("Gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            log::info!("Gateway shutting down.");
        })
        .await?;
    Ok(())
}

/// Relays fan-out envelopes to connected clients. Losing the broker
/// subscription is fatal for this gateway instance: without it connected
/// clients silently stop receiving pushes, so the whole process restarts.
pub async fn relay_envelopes(state: GatewayState) -> Result<(), FeedError> {
    let mut payloads = state
        .cache
        .subscribe_envelopes(state.shutdown.clone())
        .await?;

    while let Some(payload) = payloads.recv().await {
        let envelope: FanoutEnvelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("discarding malformed fan-out envelope: {e}");
                continue;
            }
        };
        if !state
            .registry
            .deliver(envelope.user_id, envelope.tweet)
            .await
        {
            log::debug!("user {} not connected, push dropped", envelope.user_id);
        }
    }

    if state.shutdown.is_cancelled() {
        Ok(())
    } else {
        state.shutdown.cancel();
        Err(FeedError::Transient(
            "fan-out subscription closed unexpectedly".to_string(),
        ))
    }
}

#[derive(Deserialize)]
struct WsQuery {
    user_id: i64,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, user_id: i64) {
    let (generation, mut pushes) = state.registry.register(user_id).await;
    log::info!("user {user_id} connected");

    // Un-hydrated is better than disconnected: on failure the connection
    // stays registered and still receives live pushes
    match hydrate(
        &state.cache,
        &state.api,
        &state.shutdown,
        user_id,
        state.hydrate_page_size,
    )
    .await
    {
        Ok(tweets) => match serde_json::to_string(&tweets) {
            Ok(body) => {
                if socket.send(Message::Text(body.into())).await.is_err() {
                    state.registry.deregister(user_id, generation).await;
                    return;
                }
            }
            Err(e) => log::error!("failed to serialize initial feed for user {user_id}: {e}"),
        },
        Err(e) => log::warn!("hydration failed for user {user_id}: {e}"),
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            pushed = pushes.recv() => match pushed {
                Some(tweet) => {
                    let body = match serde_json::to_string(&tweet) {
                        Ok(body) => body,
                        Err(e) => {
                            log::error!("failed to serialize push for user {user_id}: {e}");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(body.into())).await.is_err() {
                        break;
                    }
                }
                // Channel closed: this connection was replaced by a newer one
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // clients have nothing to say
                Some(Err(_)) => break,
            },
        }
    }

    state.registry.deregister(user_id, generation).await;
    log::info!("user {user_id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{short_block_config, tweet_at, StaticReadApi};
    use lib_common::connections::MemoryCache;

    fn state(cache: Arc<MemoryCache>) -> GatewayState {
        GatewayState {
            registry: ConnectionRegistry::new(),
            cache: cache as Arc<dyn TimelineCache>,
            api: Arc::new(StaticReadApi::default()),
            hydrate_page_size: 10,
            shutdown: CancellationToken::new(),
        }
    }

    async fn wait_for_subscriber(cache: &MemoryCache) {
        for _ in 0..100 {
            if cache.subscriber_count().await > 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("relay never subscribed");
    }

    #[tokio::test]
    async fn relay_delivers_to_connected_user_and_drops_the_rest() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let state = state(cache.clone());
        let relay = tokio::spawn(relay_envelopes(state.clone()));
        wait_for_subscriber(&cache).await;

        let (_, mut pushes) = state.registry.register(3).await;

        let token = CancellationToken::new();
        for recipient in [2, 3] {
            cache
                .publish_envelope(
                    &token,
                    &FanoutEnvelope {
                        user_id: recipient,
                        tweet: tweet_at(1, 1, "hi"),
                    },
                )
                .await
                .unwrap();
        }

        let pushed = tokio::time::timeout(std::time::Duration::from_secs(1), pushes.recv())
            .await
            .expect("push did not arrive")
            .unwrap();
        assert_eq!(pushed.id, 1);
        assert_eq!(pushed.user_id, 1);
        assert_eq!(pushed.content, "hi");

        state.shutdown.cancel();
        let res = relay.await.unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn relay_skips_malformed_envelopes() {
        let cache = Arc::new(MemoryCache::new(&short_block_config()));
        let state = state(cache.clone());
        let relay = tokio::spawn(relay_envelopes(state.clone()));
        wait_for_subscriber(&cache).await;
        let (_, mut pushes) = state.registry.register(2).await;

        // A broken payload followed by a good one: the good one still arrives
        cache.publish_raw("{not json").await;
        let token = CancellationToken::new();
        cache
            .publish_envelope(
                &token,
                &FanoutEnvelope {
                    user_id: 2,
                    tweet: tweet_at(5, 1, "ok"),
                },
            )
            .await
            .unwrap();

        let pushed = tokio::time::timeout(std::time::Duration::from_secs(1), pushes.recv())
            .await
            .expect("push did not arrive")
            .unwrap();
        assert_eq!(pushed.id, 5);

        state.shutdown.cancel();
        relay.await.unwrap().unwrap();
    }
}
