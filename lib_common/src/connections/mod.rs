//! Concrete connectors for the cache/broker and the authoritative store.

pub mod cache_memory;
pub mod cache_redis;
pub mod db_memory;
pub mod db_postgres;

pub use cache_memory::MemoryCache;
pub use cache_redis::RedisCache;
pub use db_memory::MemoryStore;
pub use db_postgres::PostgresStore;
