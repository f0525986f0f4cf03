//! # Error Taxonomy
//!
//! Every fallible operation in the system resolves to one of five kinds:
//! `NotFound` (absent or expired cache/store entries), `Transient`
//! (connectivity and deadline problems, retryable), `Serialization`
//! (malformed payloads), `Protocol` (bad requests, upgrade failures) and
//! `Persistence` (authoritative store failures). Conversions from the
//! driver crates live here so call sites can lean on `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("persistence: {0}")]
    Persistence(String),
}

impl FeedError {
    /// Retry is only worthwhile for transient failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Transient(_))
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for FeedError {
    fn from(e: redis::RedisError) -> Self {
        // A type error means the stored value had an unexpected shape
        if e.kind() == redis::ErrorKind::UnexpectedReturnType {
            FeedError::Serialization(e.to_string())
        } else {
            FeedError::Transient(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for FeedError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        FeedError::Transient("deadline exceeded".to_string())
    }
}

impl From<reqwest_middleware::Error> for FeedError {
    fn from(e: reqwest_middleware::Error) -> Self {
        FeedError::Transient(e.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FeedError::Serialization(e.to_string())
        } else {
            FeedError::Transient(e.to_string())
        }
    }
}

impl From<url::ParseError> for FeedError {
    fn from(e: url::ParseError) -> Self {
        FeedError::Protocol(e.to_string())
    }
}

/// Outcome of a write that goes through the store first and the cache
/// second. `Degraded` means the record is durable but the announce step
/// failed, so distribution may not happen until the cache recovers.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Persistence(#[from] FeedError),
    #[error("stored as {id} but announce failed: {source}")]
    Degraded {
        id: i64,
        #[source]
        source: FeedError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_maps_to_transient() {
        let res = tokio::time::timeout(
            Duration::from_millis(10),
            std::future::pending::<()>(),
        )
        .await;
        let err: FeedError = res.unwrap_err().into();
        assert!(err.is_retryable());
        assert!(matches!(err, FeedError::Transient(_)));
    }

    #[test]
    fn malformed_json_maps_to_serialization() {
        let err: FeedError = serde_json::from_str::<crate::model::Tweet>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, FeedError::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
