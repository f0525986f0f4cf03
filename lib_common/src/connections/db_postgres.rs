//! # PostgreSQL Store
//!
//! The authoritative store for tweets, users and follow edges, pooled
//! through `deadpool-postgres`. Expected schema:
//!
//! ```sql
//! CREATE TABLE users (
//!     id           BIGSERIAL PRIMARY KEY,
//!     username     TEXT NOT NULL UNIQUE,
//!     display_name TEXT NOT NULL DEFAULT '',
//!     created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE TABLE tweets (
//!     id         BIGSERIAL PRIMARY KEY,
//!     user_id    BIGINT NOT NULL REFERENCES users (id),
//!     content    TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE TABLE follows (
//!     follower_id BIGINT NOT NULL REFERENCES users (id),
//!     followed_id BIGINT NOT NULL REFERENCES users (id),
//!     created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     PRIMARY KEY (follower_id, followed_id)
//! );
//! ```

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use tokio_util::sync::CancellationToken;

use crate::configs::Config;
use crate::error::FeedError;
use crate::interfaces::{with_deadline, TweetStore};
use crate::model::{Follow, Tweet, User};

pub struct PostgresStore {
    pool: Pool,
    op_timeout: Duration,
}

impl PostgresStore {
    /// Builds the connection pool. Connections are established lazily, so
    /// this does not touch the database yet.
    pub fn connect(cfg: &Config) -> Result<Self, FeedError> {
        let mut pool_cfg = PoolConfig::new();
        pool_cfg.url = Some(cfg.database_url.clone());
        pool_cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = pool_cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| FeedError::Persistence(format!("failed to create pool: {e}")))?;
        Ok(PostgresStore {
            pool,
            op_timeout: cfg.op_timeout,
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, FeedError> {
        self.pool
            .get()
            .await
            .map_err(|e| FeedError::Transient(format!("pool: {e}")))
    }
}

fn persistence(e: tokio_postgres::Error) -> FeedError {
    FeedError::Persistence(e.to_string())
}

fn tweet_from_row(row: &Row) -> Tweet {
    Tweet {
        id: row.get("id"),
        user_id: row.get("user_id"),
        content: row.get("content"),
        created_at: row.get("created_at"),
    }
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl TweetStore for PostgresStore {
    async fn new_tweet(&self, token: &CancellationToken, tweet: &Tweet) -> Result<i64, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let row = client
                .query_one(
                    "INSERT INTO tweets (user_id, content, created_at)
                     VALUES ($1, $2, $3)
                     RETURNING id",
                    &[&tweet.user_id, &tweet.content, &tweet.created_at],
                )
                .await
                .map_err(persistence)?;
            Ok(row.get::<_, i64>(0))
        })
        .await
    }

    async fn tweet(&self, token: &CancellationToken, id: i64) -> Result<Tweet, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let row = client
                .query_opt(
                    "SELECT id, user_id, content, created_at
                     FROM tweets
                     WHERE id = $1",
                    &[&id],
                )
                .await
                .map_err(persistence)?;
            row.map(|r| tweet_from_row(&r))
                .ok_or_else(|| FeedError::NotFound(format!("tweet {id}")))
        })
        .await
    }

    async fn users_tweets(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT id, user_id, content, created_at
                     FROM tweets
                     WHERE user_id = $1
                     ORDER BY created_at DESC",
                    &[&user_id],
                )
                .await
                .map_err(persistence)?;
            Ok(rows.iter().map(tweet_from_row).collect())
        })
        .await
    }

    async fn timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT t.id, t.user_id, t.content, t.created_at
                     FROM tweets t
                     JOIN follows f ON t.user_id = f.followed_id
                     WHERE f.follower_id = $1
                     ORDER BY t.created_at DESC",
                    &[&user_id],
                )
                .await
                .map_err(persistence)?;
            Ok(rows.iter().map(tweet_from_row).collect())
        })
        .await
    }

    async fn follow(&self, token: &CancellationToken, follow: &Follow) -> Result<(), FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            client
                .execute(
                    "INSERT INTO follows (follower_id, followed_id, created_at)
                     VALUES ($1, $2, $3)
                     ON CONFLICT DO NOTHING",
                    &[&follow.follower_id, &follow.followee_id, &follow.created_at],
                )
                .await
                .map_err(persistence)?;
            Ok(())
        })
        .await
    }

    async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT u.id, u.username, u.display_name, u.created_at
                     FROM users u
                     JOIN follows f ON f.follower_id = u.id
                     WHERE f.followed_id = $1",
                    &[&user_id],
                )
                .await
                .map_err(persistence)?;
            Ok(rows.iter().map(user_from_row).collect())
        })
        .await
    }

    async fn following(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let rows = client
                .query(
                    "SELECT u.id, u.username, u.display_name, u.created_at
                     FROM users u
                     JOIN follows f ON f.followed_id = u.id
                     WHERE f.follower_id = $1",
                    &[&user_id],
                )
                .await
                .map_err(persistence)?;
            Ok(rows.iter().map(user_from_row).collect())
        })
        .await
    }

    async fn create_user(&self, token: &CancellationToken, user: &User) -> Result<i64, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let row = client
                .query_one(
                    "INSERT INTO users (username, display_name, created_at)
                     VALUES ($1, $2, $3)
                     RETURNING id",
                    &[&user.username, &user.display_name, &user.created_at],
                )
                .await
                .map_err(persistence)?;
            Ok(row.get::<_, i64>(0))
        })
        .await
    }

    async fn user(&self, token: &CancellationToken, id: i64) -> Result<User, FeedError> {
        with_deadline(token, self.op_timeout, async {
            let client = self.client().await?;
            let row = client
                .query_opt(
                    "SELECT id, username, display_name, created_at
                     FROM users
                     WHERE id = $1",
                    &[&id],
                )
                .await
                .map_err(persistence)?;
            row.map(|r| user_from_row(&r))
                .ok_or_else(|| FeedError::NotFound(format!("user {id}")))
        })
        .await
    }
}
