//! # Upstream Read API Client
//!
//! Synchronous-looking HTTP reads against the API tier, used by the
//! fan-out worker and the gateway when the cache has no materialized view
//! yet. Built on `reqwest_middleware` with exponential-backoff retries so
//! a single flaky round-trip does not surface as a Transient failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FeedError;
use crate::interfaces::{with_deadline, ReadApi};
use crate::model::{Tweet, User};

pub struct ReadApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    op_timeout: Duration,
}

impl ReadApiClient {
    /// `base_url` is the root of the API tier, e.g. `http://api:8080`.
    pub fn new(base_url: &str, op_timeout: Duration) -> Result<Self, FeedError> {
        // A trailing slash matters to Url::join
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let inner = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(ReadApiClient {
            inner,
            base_url,
            op_timeout,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        token: &CancellationToken,
        path_and_query: &str,
    ) -> Result<T, FeedError> {
        let url = self.base_url.join(path_and_query)?;
        with_deadline(token, self.op_timeout, async move {
            let response = self.inner.get(url.clone()).send().await?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(FeedError::NotFound(format!("{path_and_query}")));
            }
            if !status.is_success() {
                return Err(FeedError::Transient(format!(
                    "upstream api returned {status} for {path_and_query}"
                )));
            }
            response
                .json::<T>()
                .await
                .map_err(|e| FeedError::Serialization(e.to_string()))
        })
        .await
    }
}

#[async_trait]
impl ReadApi for ReadApiClient {
    async fn user(&self, token: &CancellationToken, user_id: i64) -> Result<User, FeedError> {
        self.fetch(token, &format!("api/v1/get_user?user={user_id}"))
            .await
    }

    async fn followers(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<User>, FeedError> {
        self.fetch(token, &format!("api/v1/followers?user={user_id}"))
            .await
    }

    async fn timeline(
        &self,
        token: &CancellationToken,
        user_id: i64,
    ) -> Result<Vec<Tweet>, FeedError> {
        self.fetch(token, &format!("api/v1/tweets?user={user_id}"))
            .await
    }

    async fn tweet(&self, token: &CancellationToken, tweet_id: i64) -> Result<Tweet, FeedError> {
        self.fetch(token, &format!("api/v1/get_tweet?tweet={tweet_id}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_join_keeps_api_prefix() {
        let client = ReadApiClient::new("http://api:8080", Duration::from_secs(1)).unwrap();
        let url = client.base_url.join("api/v1/get_user?user=5").unwrap();
        assert_eq!(url.as_str(), "http://api:8080/api/v1/get_user?user=5");

        // The same works when the configured base already has the slash
        let client = ReadApiClient::new("http://api:8080/", Duration::from_secs(1)).unwrap();
        let url = client.base_url.join("api/v1/tweets?user=5").unwrap();
        assert_eq!(url.as_str(), "http://api:8080/api/v1/tweets?user=5");
    }
}
