//! Infrastructure event bus implementations.
//!
//! The bus abstractions and in-memory buses live in `horizon-events` as pure
//! mechanics. This module provides Redis-backed buses and connection handling.

pub mod reconnect;

#[cfg(feature = "redis")]
pub mod redis_pubsub;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use reconnect::{connect_with_retry, BackoffStrategy, ReconnectPolicy};

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisPubSubBus;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBus, RedisStreamsConfig};
