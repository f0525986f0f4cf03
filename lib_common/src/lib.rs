//! Shared library for the chirp feed-delivery services.
//!
//! Holds the domain model, the error taxonomy, the capability traits the
//! services program against, and the concrete connectors: Redis
//! cache/broker, Postgres store, in-memory doubles and the upstream read
//! API client.

// Declare the modules to re-export
pub mod configs;
pub mod connections;
pub mod error;
pub mod interfaces;
pub mod loggers;
pub mod model;
pub mod retrieve;

// Re-export the types almost every consumer needs
pub use error::{FeedError, PublishError};
pub use interfaces::{with_deadline, ReadApi, TimelineCache, TweetStore};
pub use model::{CreatedEvent, FanoutEnvelope, Follow, NewTweet, NewUser, Tweet, User};
