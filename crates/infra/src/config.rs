//! Gateway configuration.
//!
//! Every section has documented defaults (`Default`) and can be deserialized
//! from any serde source. `GatewayConfig::from_env()` applies `COURIER_*`
//! environment overrides on top of the defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dead_letter::{AutoRetryConfig, DeadLetterConfig};
use crate::dedup::DedupConfig;
use crate::delivery::DeliveryTrackerConfig;
use crate::jobs::{QueueConfig, WorkerConfig};
use crate::metrics::MetricsConfig;
use crate::rate_limit::RateLimitConfig;
use crate::sessions::SessionRegistryConfig;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub queues: QueueConfig,
    pub workers: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub transport_breaker: CircuitBreakerConfig,
    pub data_store_breaker: CircuitBreakerConfig,
    pub dedup: DedupConfig,
    pub sessions: SessionRegistryConfig,
    pub delivery: DeliveryTrackerConfig,
    pub auto_retry: AutoRetryConfig,
    pub dead_letter: DeadLetterConfig,
    pub metrics: MetricsConfig,
}

impl GatewayConfig {
    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let env = Env(&lookup);

        env.set("COURIER_WORKER_CONCURRENCY", &mut cfg.workers.concurrency)?;
        env.set("COURIER_MAX_JOBS_PER_SECOND", &mut cfg.workers.max_jobs_per_second)?;
        env.set_secs("COURIER_JOB_TIMEOUT_SECS", &mut cfg.workers.job_timeout)?;
        env.set_secs("COURIER_DRAIN_TIMEOUT_SECS", &mut cfg.workers.drain_timeout)?;

        env.set("COURIER_MAX_ATTEMPTS", &mut cfg.queues.default_job_options.max_attempts)?;
        env.set_secs("COURIER_JOB_LEASE_SECS", &mut cfg.queues.lease)?;

        env.set("COURIER_RATE_LIMIT_PER_MINUTE", &mut cfg.rate_limit.per_minute)?;
        env.set("COURIER_RATE_LIMIT_PER_HOUR", &mut cfg.rate_limit.per_hour)?;
        env.set_secs("COURIER_RATE_LIMIT_BLOCK_SECS", &mut cfg.rate_limit.block_duration)?;

        env.set(
            "COURIER_BREAKER_FAILURE_THRESHOLD",
            &mut cfg.transport_breaker.failure_threshold,
        )?;
        env.set(
            "COURIER_BREAKER_SUCCESS_THRESHOLD",
            &mut cfg.transport_breaker.success_threshold,
        )?;
        env.set_secs(
            "COURIER_BREAKER_RESET_TIMEOUT_SECS",
            &mut cfg.transport_breaker.reset_timeout,
        )?;
        env.set_secs(
            "COURIER_TRANSPORT_TIMEOUT_SECS",
            &mut cfg.transport_breaker.call_timeout,
        )?;

        env.set_secs("COURIER_DEDUP_TTL_SECS", &mut cfg.dedup.ttl)?;
        env.set("COURIER_DEDUP_PREFIX_CHARS", &mut cfg.dedup.prefix_chars)?;

        env.set_secs(
            "COURIER_SESSION_INACTIVITY_SECS",
            &mut cfg.sessions.inactivity_threshold,
        )?;
        env.set("COURIER_SESSION_ERROR_THRESHOLD", &mut cfg.sessions.error_threshold)?;

        env.set("COURIER_DELIVERY_MAX_CHECKS", &mut cfg.delivery.max_status_checks)?;

        env.set("COURIER_AUTO_RETRY_ENABLED", &mut cfg.auto_retry.enabled)?;
        env.set("COURIER_AUTO_RETRY_MAX", &mut cfg.auto_retry.max_auto_retries)?;
        env.set_secs("COURIER_AUTO_RETRY_COOLDOWN_SECS", &mut cfg.auto_retry.cooldown)?;

        if let Some(days) = env.parse::<u64>("COURIER_DEAD_LETTER_RETENTION_DAYS")? {
            cfg.dead_letter.retention = Duration::from_secs(days * 24 * 60 * 60);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks across sections that single values cannot express.
    ///
    /// A job must outlive its transport call: a job cancelled first never
    /// lets the breaker count the hung call as a failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.job_timeout <= self.transport_breaker.call_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "job timeout {:?} must exceed transport call timeout {:?}",
                self.workers.job_timeout, self.transport_breaker.call_timeout
            )));
        }
        Ok(())
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(var) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::Invalid {
                    var: var.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    fn set<T>(&self, var: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse(var)? {
            *slot = value;
        }
        Ok(())
    }

    fn set_secs(&self, var: &str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(secs) = self.parse::<u64>(var)? {
            *slot = Duration::from_secs(secs);
        }
        Ok(())
    }
}

/// Serde helper: `Duration` as whole seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Serde helper: `Duration` as milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
