//! Job storage implementations.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{FailureDisposition, Job, JobCounts, JobId, JobState};

/// Job store abstraction.
///
/// Every transition of a claimed job (`complete`, `fail`, `release`) must
/// present the lease token handed out by `claim_next`. A worker whose lease
/// expired and whose job was re-queued by the stall reaper gets
/// `LeaseMismatch` instead of clobbering the newer claim.
pub trait JobStore: Send + Sync {
    /// Insert a new job. Assigns the FIFO sequence number.
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim the next ready job of `queue`: lowest priority value first,
    /// then enqueue order. Returns None if nothing is ready.
    fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Mark a claimed job completed.
    fn complete(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        return_value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Record a failed attempt; the job is rescheduled or becomes `Failed`.
    fn fail(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<(Job, FailureDisposition), JobStoreError>;

    /// Fail a claimed job permanently.
    fn fail_terminal(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Give a claimed job back without consuming the attempt.
    fn release(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Put active jobs whose lease expired back in the queue. A job that
    /// stalls more than `max_stalled` times is failed instead.
    fn requeue_stalled(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// List jobs of a queue, optionally filtered by state, oldest first.
    fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Per-state counts of a queue.
    fn counts(&self, queue: &str) -> Result<JobCounts, JobStoreError>;

    /// Names of every queue that holds at least one job.
    fn queue_names(&self) -> Result<Vec<String>, JobStoreError>;

    /// Remove a job regardless of its state.
    fn remove(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Keep only the `keep` most recently finished jobs in `state`
    /// (which must be terminal). Returns how many were dropped.
    fn trim(&self, queue: &str, state: JobState, keep: usize) -> Result<usize, JobStoreError>;

    /// Earliest `scheduled_at` among waiting/delayed jobs of `queue`.
    fn next_scheduled_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lease for job {0} is no longer held")]
    LeaseMismatch(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    seq: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn with_claimed<T>(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.state != JobState::Active || job.lease_token != Some(lease_token) {
            return Err(JobStoreError::LeaseMismatch(job_id));
        }
        Ok(f(job))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, mut job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        job.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;

        let next = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_ready(now))
            .min_by_key(|j| (j.priority, j.seq))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_active(now, lease);
                job.clone()
            })
        }))
    }

    fn complete(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        return_value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.with_claimed(job_id, lease_token, |job| {
            job.mark_completed(return_value, now);
            job.clone()
        })
    }

    fn fail(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<(Job, FailureDisposition), JobStoreError> {
        self.with_claimed(job_id, lease_token, |job| {
            let disposition = job.mark_failed(error, now);
            (job.clone(), disposition)
        })
    }

    fn fail_terminal(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.with_claimed(job_id, lease_token, |job| {
            job.mark_terminal(error, now);
            job.clone()
        })
    }

    fn release(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.with_claimed(job_id, lease_token, |job| {
            job.release(delay, now);
            job.clone()
        })
    }

    fn requeue_stalled(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut touched = Vec::new();

        for job in jobs.values_mut().filter(|j| {
            j.queue == queue
                && j.state == JobState::Active
                && j.lease_expires_at.is_some_and(|exp| exp <= now)
        }) {
            job.stalled_count += 1;
            if job.stalled_count > max_stalled {
                job.mark_terminal(
                    format!("job stalled more than {max_stalled} times"),
                    now,
                );
            } else {
                job.release(Duration::ZERO, now);
            }
            touched.push(job.clone());
        }

        Ok(touched)
    }

    fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.seq);
        result.truncate(limit);
        Ok(result)
    }

    fn counts(&self, queue: &str) -> Result<JobCounts, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut counts = JobCounts::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            match job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn queue_names(&self) -> Result<Vec<String>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let names: BTreeSet<_> = jobs.values().map(|j| j.queue.clone()).collect();
        Ok(names.into_iter().collect())
    }

    fn remove(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        Ok(jobs.remove(&job_id))
    }

    fn trim(&self, queue: &str, state: JobState, keep: usize) -> Result<usize, JobStoreError> {
        if !state.is_terminal() {
            return Ok(0);
        }
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;

        let mut finished: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && j.state == state)
            .map(|j| (j.finished_at, j.seq, j.id))
            .collect();
        if finished.len() <= keep {
            return Ok(0);
        }

        // Newest first; everything past `keep` goes.
        finished.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        let dropped = finished.len() - keep;
        for (_, _, id) in finished.into_iter().skip(keep) {
            jobs.remove(&id);
        }
        Ok(dropped)
    }

    fn next_scheduled_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs
            .values()
            .filter(|j| {
                j.queue == queue && matches!(j.state, JobState::Waiting | JobState::Delayed)
            })
            .map(|j| j.scheduled_at)
            .min())
    }
}

// Allow using `Arc<T>` where a `JobStore` is expected.
impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(queue, now, lease)
    }

    fn complete(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        return_value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).complete(job_id, lease_token, return_value, now)
    }

    fn fail(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<(Job, FailureDisposition), JobStoreError> {
        (**self).fail(job_id, lease_token, error, now)
    }

    fn fail_terminal(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).fail_terminal(job_id, lease_token, error, now)
    }

    fn release(
        &self,
        job_id: JobId,
        lease_token: Uuid,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).release(job_id, lease_token, delay, now)
    }

    fn requeue_stalled(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        max_stalled: u32,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).requeue_stalled(queue, now, max_stalled)
    }

    fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(queue, state, limit)
    }

    fn counts(&self, queue: &str) -> Result<JobCounts, JobStoreError> {
        (**self).counts(queue)
    }

    fn queue_names(&self) -> Result<Vec<String>, JobStoreError> {
        (**self).queue_names()
    }

    fn remove(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).remove(job_id)
    }

    fn trim(&self, queue: &str, state: JobState, keep: usize) -> Result<usize, JobStoreError> {
        (**self).trim(queue, state, keep)
    }

    fn next_scheduled_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        (**self).next_scheduled_at(queue)
    }
}
