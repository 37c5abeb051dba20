//! Dead-letter store and the auto-retry manager.
//!
//! A job that fails for good is copied into a dead-letter entry: the job
//! itself stays in its queue's failed set (retention-capped), the entry is
//! what operators list, replay and clean up, and what the data store keeps
//! as an audit trail.
//!
//! Automatic and bulk retries leave the entry in place, marked with the job
//! that retried it. Only a manual replay or the retention cleanup removes
//! an entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::TenantId;

use crate::jobs::{BackoffPolicy, Job, JobAttemptRecord, JobId};

pub mod manager;

pub use manager::{AutoRetryReport, DeadLetterManager};

/// Auto-retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRetryConfig {
    pub enabled: bool,
    /// How often failed sets are scanned.
    #[serde(with = "crate::config::duration_secs")]
    pub interval: Duration,
    /// Minimum age of a failure before it is retried.
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
    /// Auto-retries per job lineage.
    pub max_auto_retries: u32,
}

impl Default for AutoRetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(5 * 60),
            max_auto_retries: 3,
        }
    }
}

/// Dead-letter retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Entries older than this are removed by `cleanup`.
    #[serde(with = "crate::config::duration_secs")]
    pub retention: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// A terminally failed job, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub job_id: JobId,
    pub queue: String,
    pub job_name: String,
    pub tenant_id: TenantId,
    pub payload: serde_json::Value,
    pub priority: u32,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub auto_retries: u32,
    pub history: Vec<JobAttemptRecord>,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Job that re-ran this failure, once it has been retried.
    #[serde(default)]
    pub retried_as: Option<JobId>,
    #[serde(default)]
    pub retried_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: job.id,
            queue: job.queue.clone(),
            job_name: job.name.clone(),
            tenant_id: job.tenant_id,
            payload: job.payload.clone(),
            priority: job.priority,
            failure_reason: job.failed_reason.clone().unwrap_or_default(),
            failed_at: job.finished_at.unwrap_or(now),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            auto_retries: job.auto_retries,
            history: job.history.clone(),
            backoff: job.backoff.clone(),
            retried_as: None,
            retried_at: None,
        }
    }

    pub fn is_retried(&self) -> bool {
        self.retried_as.is_some()
    }
}
