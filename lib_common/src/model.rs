//! Domain types shared by every service.
//!
//! Field names are the wire format: the same JSON shapes travel through
//! the cache, the pub/sub channel, the read API and the websocket pushes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tweet {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    pub follower_id: i64,
    pub followee_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Push payload published on `workers:channel` once per follower.
/// `user_id` is the recipient; the author is `tweet.user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEnvelope {
    pub user_id: i64,
    pub tweet: Tweet,
}

/// One entry read from the durable tweet-created stream. The payload is
/// the raw tweet id as written by ingestion; parsing is the consumer's
/// problem so a malformed entry can still be acknowledged and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedEvent {
    pub entry_id: String,
    pub payload: String,
}

/// Request body for publishing a tweet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTweet {
    pub user_id: i64,
    pub content: String,
}

/// Request body for creating a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub display_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_tweet() -> Tweet {
        Tweet {
            id: 42,
            user_id: 1,
            content: "hi".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn tweet_wire_format_keeps_original_field_names() {
        let value = serde_json::to_value(sample_tweet()).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["user_id"], 1);
        assert_eq!(value["content"], "hi");
        assert!(value.get("created_at").is_some());
    }

    #[test]
    fn envelope_carries_recipient_and_full_tweet() {
        let envelope = FanoutEnvelope {
            user_id: 3,
            tweet: sample_tweet(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["user_id"], 3);
        assert_eq!(value["tweet"]["id"], 42);
        assert_eq!(value["tweet"]["user_id"], 1);

        let back: FanoutEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }
}
