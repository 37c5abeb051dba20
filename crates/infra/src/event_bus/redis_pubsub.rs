//! Redis pub/sub-backed notification bus (optional).
//!
//! Redis pub/sub is not durable: notifications published while a subscriber
//! is offline are lost. That matches notification semantics; the data store
//! stays the source of truth for delivery status.
//!
//! Each tenant gets its own channel (`<prefix>:<tenant_id>`), so other
//! consumers can subscribe to one tenant without filtering.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::warn;

use courier_core::TenantId;
use courier_events::{EventBus, Notification, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for gateway notifications.
#[derive(Debug, Clone)]
pub struct RedisNotificationBus {
    client: redis::Client,
    prefix: String,
}

impl RedisNotificationBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    pub fn channel_for(&self, tenant_id: TenantId) -> String {
        format!("{}:{}", self.prefix, tenant_id)
    }
}

impl EventBus<Notification> for RedisNotificationBus {
    type Error = RedisBusError;

    fn publish(&self, message: Notification) -> Result<(), Self::Error> {
        let payload =
            serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(self.channel_for(message.tenant_id), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    /// Subscribe to every tenant's channel.
    fn subscribe(&self) -> Subscription<Notification> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let pattern = format!("{}:*", self.prefix);

        // Background thread that receives pub/sub messages and forwards them.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "redis notification subscriber could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.psubscribe(&pattern) {
                warn!(error = %e, pattern = %pattern, "redis psubscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let notification: Notification = match serde_json::from_str(&payload) {
                    Ok(n) => n,
                    Err(_) => continue,
                };

                if tx.send(notification).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
