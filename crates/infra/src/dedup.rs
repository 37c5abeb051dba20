//! Suppression of repeated outbound sends.
//!
//! The key covers the session, the recipient and a bounded prefix of the
//! content. Two different messages sharing that prefix collide; this trades
//! rare false positives for a cheap key.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use courier_core::SessionId;

use crate::jobs::types::to_chrono;

/// Deduplicator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a processed key suppresses repeats.
    #[serde(with = "crate::config::duration_secs")]
    pub ttl: Duration,
    /// Characters of content that take part in the key.
    pub prefix_chars: usize,
    #[serde(with = "crate::config::duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            prefix_chars: 100,
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Derive the dedup key: hex SHA-256 over session, recipient and the first
/// `prefix_chars` characters of `content`.
pub fn dedup_key(session: &SessionId, recipient: &str, content: &str, prefix_chars: usize) -> String {
    let prefix: String = content.chars().take(prefix_chars).collect();

    let mut hasher = Sha256::new();
    hasher.update(session.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(recipient.as_bytes());
    hasher.update([0u8]);
    hasher.update(prefix.as_bytes());
    hex::encode(hasher.finalize())
}

/// Processed-key cache with a TTL.
#[derive(Debug)]
pub struct Deduplicator {
    config: DedupConfig,
    processed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            processed: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.processed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn compute_key(&self, session: &SessionId, recipient: &str, content: &str) -> String {
        dedup_key(session, recipient, content, self.config.prefix_chars)
    }

    pub fn is_duplicate(&self, key: &str) -> bool {
        self.is_duplicate_at(key, Utc::now())
    }

    /// Whether `key` was marked processed less than `ttl` ago.
    pub fn is_duplicate_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let ttl = to_chrono(self.config.ttl);
        self.lock()
            .get(key)
            .is_some_and(|marked| now - *marked < ttl)
    }

    pub fn mark_processed(&self, key: &str) {
        self.mark_processed_at(key, Utc::now());
    }

    /// Record a successful send. Call only after the transport accepted it.
    pub fn mark_processed_at(&self, key: &str, now: DateTime<Utc>) {
        self.lock().insert(key.to_string(), now);
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drop expired keys. Returns how many were removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = to_chrono(self.config.ttl);
        let mut processed = self.lock();
        let before = processed.len();
        processed.retain(|_, marked| now - *marked < ttl);
        let removed = before - processed.len();
        if removed > 0 {
            debug!(removed, remaining = processed.len(), "dedup keys expired");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
