//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `courier-events` as pure mechanics. This
//! module provides infrastructure-backed implementations (e.g. Redis) so
//! several gateway instances can share delivery notifications.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisNotificationBus};
