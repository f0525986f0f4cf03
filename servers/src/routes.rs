//! # API Server Routes
//!
//! The read surface consumed by the worker and the gateway as fallback,
//! plus the write surface (tweet, follow, user). Handlers stay thin and
//! delegate to the `TweetService`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use lib_common::{FeedError, Follow, NewTweet, NewUser, PublishError, Tweet, User};

use crate::ingest::TweetService;

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TweetService>,
    pub shutdown: CancellationToken,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/get_user", get(get_user))
        .route("/api/v1/followers", get(followers))
        .route("/api/v1/tweets", get(timeline))
        .route("/api/v1/get_tweet", get(get_tweet))
        .route("/api/v1/tweet_by_user", get(tweet_by_user))
        .route("/api/v1/tweet", post(new_tweet))
        .route("/api/v1/follow_user", get(follow_user))
        .route("/api/v1/user", post(create_user))
        .route("/health", get(health))
        .with_state(state)
}

/// Maps the error taxonomy onto HTTP statuses with the `{"error": …}`
/// body shape clients already expect.
pub struct ApiError(pub FeedError);

impl From<FeedError> for ApiError {
    fn from(e: FeedError) -> Self {
        ApiError(e)
    }
}

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::Rejected(msg) => ApiError(FeedError::Protocol(msg)),
            PublishError::Persistence(inner) => ApiError(inner),
            // Callers special-case Degraded before converting
            PublishError::Degraded { source, .. } => ApiError(source),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FeedError::NotFound(_) => StatusCode::NOT_FOUND,
            FeedError::Serialization(_) | FeedError::Protocol(_) => StatusCode::BAD_REQUEST,
            FeedError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            FeedError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Deserialize)]
struct UserQuery {
    user: i64,
}

#[derive(Deserialize)]
struct TweetQuery {
    tweet: i64,
}

#[derive(Deserialize)]
struct FollowQuery {
    user: i64,
    followee: i64,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn get_user(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.service.user(&state.shutdown, query.user).await?))
}

async fn followers(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    Ok(Json(
        state.service.followers(&state.shutdown, query.user).await?,
    ))
}

async fn timeline(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<Tweet>>, ApiError> {
    Ok(Json(
        state.service.timeline(&state.shutdown, query.user).await?,
    ))
}

async fn get_tweet(
    State(state): State<ApiState>,
    Query(query): Query<TweetQuery>,
) -> Result<Json<Tweet>, ApiError> {
    Ok(Json(state.service.tweet(&state.shutdown, query.tweet).await?))
}

async fn tweet_by_user(
    State(state): State<ApiState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<Tweet>>, ApiError> {
    Ok(Json(
        state
            .service
            .users_tweets(&state.shutdown, query.user)
            .await?,
    ))
}

async fn new_tweet(State(state): State<ApiState>, Json(body): Json<NewTweet>) -> Response {
    match state.service.publish(&state.shutdown, body).await {
        Ok(tweet) => (StatusCode::CREATED, Json(tweet)).into_response(),
        Err(PublishError::Degraded { id, source }) => {
            log::warn!("tweet {id} stored but announce failed: {source}");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "id": id, "warning": "tweet stored; distribution is delayed" })),
            )
                .into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn follow_user(State(state): State<ApiState>, Query(query): Query<FollowQuery>) -> Response {
    match state
        .service
        .follow(&state.shutdown, query.user, query.followee)
        .await
    {
        Ok(follow) => Json::<Follow>(follow).into_response(),
        Err(PublishError::Degraded { id, source }) => {
            log::warn!("follow edge stored but snapshot append failed for user {id}: {source}");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "warning": "follow stored; follower cache will catch up" })),
            )
                .into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn create_user(
    State(state): State<ApiState>,
    Json(body): Json<NewUser>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.service.create_user(&state.shutdown, body).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}
