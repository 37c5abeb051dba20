//! Queue facade: enqueue/claim/ack on top of a `JobStore`, with transition
//! events and worker wakeups.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use courier_core::{GatewayError, TenantId};
use courier_events::{EventBus, InMemoryEventBus, Subscription};

use super::store::{JobStore, JobStoreError};
use super::types::{FailureDisposition, Job, JobCounts, JobHandle, JobId, JobOptions, JobOutcome, JobState};

/// Queue-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a claim is valid before the stall reaper may hand the job
    /// to another worker.
    #[serde(with = "crate::config::duration_secs")]
    pub lease: Duration,
    /// Lease expiries tolerated before a job is failed as stalled.
    pub max_stalled: u32,
    /// How often the stall reaper runs.
    #[serde(with = "crate::config::duration_secs")]
    pub stalled_check_interval: Duration,
    /// Completed jobs kept per queue for inspection.
    pub keep_completed: usize,
    /// Failed jobs kept per queue (the dead-letter store keeps its own copy).
    pub keep_failed: usize,
    /// Defaults applied by producers.
    pub default_job_options: JobOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(60),
            max_stalled: 1,
            stalled_check_interval: Duration::from_secs(30),
            keep_completed: 1_000,
            keep_failed: 5_000,
            default_job_options: JobOptions::default(),
        }
    }
}

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobQueueError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("job {0} is not claimed")]
    NotClaimed(JobId),
}

impl From<JobQueueError> for GatewayError {
    fn from(err: JobQueueError) -> Self {
        GatewayError::store(err.to_string())
    }
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum QueueEventKind {
    Waiting,
    Delayed { until: DateTime<Utc> },
    Active { attempt: u32 },
    Completed,
    Retrying { attempt: u32, delay_ms: u64, reason: String },
    Failed { attempts: u32, reason: String },
    Released { delay_ms: u64, reason: String },
    Stalled,
    DeadLettered,
    Removed,
}

/// A job state transition, published on the queue's event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub queue: String,
    pub job_id: JobId,
    pub job_name: String,
    pub tenant_id: TenantId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: QueueEventKind,
}

/// Job queue.
///
/// Wraps a `JobStore` with the at-least-once contract used by workers:
///
/// 1. `claim(queue)` hands out the next ready job with a fresh lease
/// 2. the worker runs it and calls `ack(job, outcome)`
/// 3. `requeue_stalled(queue)` returns jobs whose lease ran out
///
/// Each transition is published as a `QueueEvent`. Publish failures are
/// logged and never undo the transition.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    events: Arc<InMemoryEventBus<QueueEvent>>,
    wakeups: Mutex<HashMap<String, Arc<Notify>>>,
    config: QueueConfig,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            events: Arc::new(InMemoryEventBus::new()),
            wakeups: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to every job transition of every queue.
    pub fn subscribe(&self) -> Subscription<QueueEvent> {
        self.events.subscribe()
    }

    /// Add a job to `queue`.
    pub fn enqueue(
        &self,
        queue: &str,
        name: &str,
        tenant_id: TenantId,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<JobHandle, JobQueueError> {
        let job = Job::new(queue, name, tenant_id, payload, options, Utc::now());
        self.insert(job)
    }

    /// Enqueue a fresh copy of `previous` (same queue, name and payload)
    /// under new options. The new job records where it came from.
    pub fn enqueue_copy(
        &self,
        previous: &Job,
        options: &JobOptions,
        auto_retries: u32,
    ) -> Result<JobHandle, JobQueueError> {
        let mut job = Job::new(
            previous.queue.clone(),
            previous.name.clone(),
            previous.tenant_id,
            previous.payload.clone(),
            options,
            Utc::now(),
        );
        job.auto_retries = auto_retries;
        job.retry_of = Some(previous.id);
        self.insert(job)
    }

    fn insert(&self, job: Job) -> Result<JobHandle, JobQueueError> {
        let handle = JobHandle::from(&job);
        let kind = match job.state {
            JobState::Delayed => QueueEventKind::Delayed {
                until: job.scheduled_at,
            },
            _ => QueueEventKind::Waiting,
        };
        self.store.insert(job.clone())?;

        debug!(queue = %job.queue, job_id = %job.id, job = %job.name, "job enqueued");
        self.announce(&job, kind);
        self.wake(&job.queue);
        Ok(handle)
    }

    /// Claim the next ready job of `queue`, if any.
    pub fn claim(&self, queue: &str) -> Result<Option<Job>, JobQueueError> {
        let claimed = self.store.claim_next(queue, Utc::now(), self.config.lease)?;
        if let Some(job) = &claimed {
            self.announce(
                job,
                QueueEventKind::Active {
                    attempt: job.attempts_made,
                },
            );
        }
        Ok(claimed)
    }

    /// Report the outcome of a claimed job. Returns the job as stored after
    /// the transition; `JobState::Failed` means it is now the dead-letter
    /// component's responsibility.
    pub fn ack(&self, job: &Job, outcome: JobOutcome) -> Result<Job, JobQueueError> {
        let token = job.lease_token.ok_or(JobQueueError::NotClaimed(job.id))?;
        let now = Utc::now();

        let updated = match outcome {
            JobOutcome::Completed(value) => {
                let done = self.store.complete(job.id, token, value, now)?;
                self.announce(&done, QueueEventKind::Completed);
                self.store
                    .trim(&done.queue, JobState::Completed, self.config.keep_completed)?;
                done
            }
            JobOutcome::Failed(reason) => {
                let (failed, disposition) = self.store.fail(job.id, token, reason.clone(), now)?;
                match disposition {
                    FailureDisposition::Retry { delay } => {
                        self.announce(
                            &failed,
                            QueueEventKind::Retrying {
                                attempt: failed.attempts_made,
                                delay_ms: delay.as_millis() as u64,
                                reason,
                            },
                        );
                        self.wake(&failed.queue);
                    }
                    FailureDisposition::Terminal => self.failed(&failed, reason)?,
                }
                failed
            }
            JobOutcome::Terminal(reason) => {
                let failed = self.store.fail_terminal(job.id, token, reason.clone(), now)?;
                self.failed(&failed, reason)?;
                failed
            }
            JobOutcome::Release { delay, reason } => {
                let released = self.store.release(job.id, token, delay, now)?;
                self.announce(
                    &released,
                    QueueEventKind::Released {
                        delay_ms: delay.as_millis() as u64,
                        reason,
                    },
                );
                self.wake(&released.queue);
                released
            }
        };

        Ok(updated)
    }

    fn failed(&self, job: &Job, reason: String) -> Result<(), JobQueueError> {
        self.announce(
            job,
            QueueEventKind::Failed {
                attempts: job.attempts_made,
                reason,
            },
        );
        self.store
            .trim(&job.queue, JobState::Failed, self.config.keep_failed)?;
        Ok(())
    }

    /// Requeue jobs of `queue` whose lease expired. Returns the jobs that
    /// stalled too often and were failed instead.
    pub fn requeue_stalled(&self, queue: &str) -> Result<Vec<Job>, JobQueueError> {
        let touched = self
            .store
            .requeue_stalled(queue, Utc::now(), self.config.max_stalled)?;

        let mut failed = Vec::new();
        for job in touched {
            warn!(
                queue = %queue,
                job_id = %job.id,
                stalled_count = job.stalled_count,
                "job lease expired"
            );
            self.announce(&job, QueueEventKind::Stalled);
            if job.state == JobState::Failed {
                let reason = job.failed_reason.clone().unwrap_or_default();
                self.failed(&job, reason)?;
                failed.push(job);
            }
        }
        if !failed.is_empty() || self.counts(queue)?.waiting > 0 {
            self.wake(queue);
        }
        Ok(failed)
    }

    /// Wait until `queue` probably has work: an enqueue/retry wakeup, the
    /// earliest delayed job becoming due, or `max_wait` elapsing.
    pub async fn wait_for_work(&self, queue: &str, max_wait: Duration) {
        let notify = self.notifier(queue);
        let notified = notify.notified();

        let wait = match self.store.next_scheduled_at(queue) {
            Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(max_wait),
            _ => max_wait,
        };
        if wait.is_zero() {
            return;
        }

        let _ = tokio::time::timeout(wait, notified).await;
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.store.get(job_id)?)
    }

    pub fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobQueueError> {
        Ok(self.store.list(queue, state, limit)?)
    }

    pub fn counts(&self, queue: &str) -> Result<JobCounts, JobQueueError> {
        Ok(self.store.counts(queue)?)
    }

    pub fn queue_names(&self) -> Result<Vec<String>, JobQueueError> {
        Ok(self.store.queue_names()?)
    }

    /// Remove a job. Active jobs are left alone; their worker still owns them.
    pub fn remove(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        match self.store.get(job_id)? {
            Some(job) if job.state == JobState::Active => Ok(None),
            Some(_) => {
                let removed = self.store.remove(job_id)?;
                if let Some(job) = &removed {
                    self.announce(job, QueueEventKind::Removed);
                }
                Ok(removed)
            }
            None => Ok(None),
        }
    }

    /// Publish a transition for `job`.
    pub fn announce(&self, job: &Job, kind: QueueEventKind) {
        let event = QueueEvent {
            queue: job.queue.clone(),
            job_id: job.id,
            job_name: job.name.clone(),
            tenant_id: job.tenant_id,
            at: Utc::now(),
            kind,
        };
        if let Err(e) = self.events.publish(event) {
            warn!(queue = %job.queue, job_id = %job.id, error = ?e, "failed to publish queue event");
        }
    }

    /// Wake every worker waiting on `queue` (used on shutdown as well).
    pub fn wake(&self, queue: &str) {
        self.notifier(queue).notify_waiters();
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        match self.wakeups.lock() {
            Ok(mut map) => map.entry(queue.to_string()).or_default().clone(),
            // A poisoned map only costs wakeups; waiters still time out.
            Err(_) => Arc::new(Notify::new()),
        }
    }
}
