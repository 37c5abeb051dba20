//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::TenantId;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Scheduled for later (initial delay or retry backoff).
    Delayed,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts (or failed permanently); owned by the dead-letter side.
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay policy between attempts of the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to spread retries of jobs that failed together
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// Calculate delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Delay before the first attempt.
    pub delay: Option<Duration>,
    /// Lower runs first; jobs with equal priority are served FIFO.
    pub priority: u32,
    /// Total attempts allowed (the first run counts as attempt 1).
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: None,
            priority: DEFAULT_PRIORITY,
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

pub const DEFAULT_PRIORITY: u32 = 10;

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A queued unit of work.
///
/// The payload is fixed at enqueue time. Only the state, attempt counter and
/// bookkeeping timestamps change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Job name, used to route to a handler (e.g. `send_text`).
    pub name: String,
    pub tenant_id: TenantId,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: u32,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may run.
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Claim token; acks must present the token of the current claim.
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub stalled_count: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    /// How many times the auto-retry manager re-enqueued this work.
    pub auto_retries: u32,
    /// The failed job this one was re-enqueued from, if any.
    pub retry_of: Option<JobId>,
    pub history: Vec<JobAttemptRecord>,
    /// Enqueue sequence, FIFO tie-breaker within a priority tier.
    pub(crate) seq: u64,
}

impl Job {
    /// Create a new waiting (or delayed) job.
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        tenant_id: TenantId,
        payload: serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let scheduled_at = match options.delay {
            Some(delay) if !delay.is_zero() => now + to_chrono(delay),
            _ => now,
        };
        Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            tenant_id,
            payload,
            state: if scheduled_at > now {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            priority: options.priority,
            attempts_made: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff.clone(),
            enqueued_at: now,
            scheduled_at,
            started_at: None,
            finished_at: None,
            lease_token: None,
            lease_expires_at: None,
            stalled_count: 0,
            failed_reason: None,
            return_value: None,
            auto_retries: 0,
            retry_of: None,
            history: Vec::new(),
            seq: 0,
        }
    }

    /// Options that reproduce this job's policy on a fresh enqueue.
    pub fn options(&self) -> JobOptions {
        JobOptions {
            delay: None,
            priority: self.priority,
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
        }
    }

    /// Check if the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.scheduled_at <= now
    }

    /// Mark job as claimed by a worker.
    pub fn mark_active(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.started_at = Some(now);
        self.lease_token = Some(Uuid::new_v4());
        self.lease_expires_at = Some(now + to_chrono(lease));
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, return_value: serde_json::Value, now: DateTime<Utc>) {
        self.push_history(true, None, now);
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.return_value = Some(return_value);
        self.clear_lease();
    }

    /// Mark job as failed; reschedules with backoff while attempts remain.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) -> FailureDisposition {
        self.push_history(false, Some(error.clone()), now);
        self.failed_reason = Some(error);
        self.clear_lease();

        if self.attempts_made < self.max_attempts {
            let delay = self.backoff.delay_for_attempt(self.attempts_made);
            self.scheduled_at = now + to_chrono(delay);
            self.state = JobState::Delayed;
            FailureDisposition::Retry { delay }
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            FailureDisposition::Terminal
        }
    }

    /// Fail the job without further retries, whatever its remaining budget.
    pub fn mark_terminal(&mut self, error: String, now: DateTime<Utc>) {
        self.push_history(false, Some(error.clone()), now);
        self.failed_reason = Some(error);
        self.clear_lease();
        self.state = JobState::Failed;
        self.finished_at = Some(now);
    }

    /// Hand the claim back without consuming an attempt.
    pub fn release(&mut self, delay: Duration, now: DateTime<Utc>) {
        self.attempts_made = self.attempts_made.saturating_sub(1);
        self.clear_lease();
        self.started_at = None;
        self.scheduled_at = now + to_chrono(delay);
        self.state = if delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };
    }

    fn clear_lease(&mut self) {
        self.lease_token = None;
        self.lease_expires_at = None;
    }

    fn push_history(&mut self, success: bool, error: Option<String>, now: DateTime<Utc>) {
        let started_at = self.started_at.unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts_made,
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Rescheduled after `delay`.
    Retry { delay: Duration },
    /// No attempts left.
    Terminal,
}

/// Result of handling a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Job completed successfully, with an optional return value.
    Completed(serde_json::Value),
    /// Transient failure; retried with backoff while attempts remain.
    Failed(String),
    /// Permanent failure; never retried.
    Terminal(String),
    /// The job could not run because a shared resource is unhealthy. The
    /// attempt is not counted and the job becomes claimable after `delay`.
    Release { delay: Duration, reason: String },
}

/// Reference to an enqueued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    pub name: String,
}

impl From<&Job> for JobHandle {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue: job.queue.clone(),
            name: job.name.clone(),
        }
    }
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(max_attempts: u32) -> Job {
        Job::new(
            "outbound",
            "send_text",
            TenantId::new(),
            serde_json::json!({"key": "value"}),
            &JobOptions::default()
                .with_max_attempts(max_attempts)
                .with_backoff(BackoffPolicy::exponential(
                    Duration::from_millis(100),
                    Duration::from_secs(10),
                )),
            Utc::now(),
        )
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn delayed_jobs_start_in_delayed_state() {
        let now = Utc::now();
        let job = Job::new(
            "q",
            "n",
            TenantId::new(),
            serde_json::json!({}),
            &JobOptions::default().with_delay(Duration::from_secs(30)),
            now,
        );
        assert_eq!(job.state, JobState::Delayed);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job(3);
        let now = Utc::now();

        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);

        job.mark_active(now, Duration::from_secs(30));
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.attempts_made, 1);
        assert!(job.lease_token.is_some());

        job.mark_completed(serde_json::json!({"ok": true}), now);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert!(job.lease_token.is_none());
    }

    #[test]
    fn job_failure_and_retry() {
        let mut job = job(2);
        let now = Utc::now();

        job.mark_active(now, Duration::from_secs(30));
        let first = job.mark_failed("error 1".to_string(), now);
        assert_eq!(
            first,
            FailureDisposition::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(job.state, JobState::Delayed);

        job.mark_active(now, Duration::from_secs(30));
        let second = job.mark_failed("error 2".to_string(), now);
        assert_eq!(second, FailureDisposition::Terminal);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.failed_reason.as_deref(), Some("error 2"));
        assert_eq!(job.history.len(), 2);
    }

    #[test]
    fn release_does_not_consume_an_attempt() {
        let mut job = job(3);
        let now = Utc::now();

        job.mark_active(now, Duration::from_secs(30));
        job.release(Duration::from_secs(5), now);

        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.history.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn exponential_delay_is_monotonic_and_capped(
                base_ms in 1u64..5_000,
                cap_ms in 1u64..600_000,
                attempt in 1u32..200,
            ) {
                let policy = BackoffPolicy::exponential(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(cap_ms),
                );
                let this = policy.delay_for_attempt(attempt);
                let next = policy.delay_for_attempt(attempt + 1);
                prop_assert!(this <= next);
                prop_assert!(next <= Duration::from_millis(cap_ms.max(base_ms)));
            }

            #[test]
            fn attempts_never_exceed_budget(max_attempts in 1u32..10, failures in 1usize..20) {
                let mut job = job(max_attempts);
                let now = Utc::now();
                for i in 0..failures {
                    if job.state == JobState::Failed {
                        break;
                    }
                    job.mark_active(now, Duration::from_secs(30));
                    job.mark_failed(format!("error {i}"), now);
                }
                prop_assert!(job.attempts_made <= job.max_attempts);
                let exhausted = failures as u32 >= max_attempts;
                prop_assert_eq!(job.state == JobState::Failed, exhausted);
            }
        }
    }
}
