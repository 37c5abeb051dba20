use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::{GatewayError, GatewayResult};

use super::{AutoRetryConfig, DeadLetterConfig, DeadLetterEntry};
use crate::circuit_breaker::CircuitBreaker;
use crate::jobs::types::to_chrono;
use crate::jobs::{DeadLetterSink, Job, JobHandle, JobId, JobOptions, JobQueue, JobState, QueueEventKind};
use crate::ports::{DataStore, DataStoreError};

/// What an auto-retry sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutoRetryReport {
    pub retried: usize,
    /// Failures still inside the cooldown.
    pub cooling_down: usize,
    /// Failures whose lineage used up its auto-retries.
    pub exhausted: usize,
}

/// Owns dead-letter entries and the automatic/manual retry of failed jobs.
pub struct DeadLetterManager {
    queue: Arc<JobQueue>,
    store: Arc<dyn DataStore>,
    store_breaker: Arc<CircuitBreaker>,
    auto_retry: AutoRetryConfig,
    config: DeadLetterConfig,
    entries: RwLock<HashMap<Uuid, DeadLetterEntry>>,
}

impl std::fmt::Debug for DeadLetterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterManager")
            .field("auto_retry", &self.auto_retry)
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl DeadLetterManager {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn DataStore>,
        store_breaker: Arc<CircuitBreaker>,
        auto_retry: AutoRetryConfig,
        config: DeadLetterConfig,
    ) -> Self {
        Self {
            queue,
            store,
            store_breaker,
            auto_retry,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn auto_retry_config(&self) -> &AutoRetryConfig {
        &self.auto_retry
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, DeadLetterEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, DeadLetterEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy a terminally failed job into the dead-letter store.
    pub async fn record(&self, job: &Job) -> DeadLetterEntry {
        let entry = DeadLetterEntry::from_job(job, Utc::now());

        warn!(
            queue = %entry.queue,
            job_id = %entry.job_id,
            job = %entry.job_name,
            tenant_id = %entry.tenant_id,
            attempts = entry.attempts_made,
            reason = %entry.failure_reason,
            "job dead-lettered"
        );

        if let Err(e) = self
            .store_breaker
            .call(|| self.store.save_dead_letter(&entry))
            .await
        {
            warn!(entry_id = %entry.id, error = %e, "failed to persist dead-letter entry");
        }

        self.write().insert(entry.id, entry.clone());
        self.queue.announce(job, QueueEventKind::DeadLettered);
        entry
    }

    /// Restore entries persisted by an earlier run.
    pub async fn load_from_store(&self) -> Result<usize, DataStoreError> {
        let loaded = self.store.load_dead_letters().await?;
        let count = loaded.len();
        let mut entries = self.write();
        for entry in loaded {
            entries.insert(entry.id, entry);
        }
        Ok(count)
    }

    /// Entries, newest first, optionally restricted to one queue.
    pub fn list(&self, queue: Option<&str>, limit: usize) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<DeadLetterEntry> = self
            .read()
            .values()
            .filter(|e| queue.is_none_or(|q| e.queue == q))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit);
        entries
    }

    pub fn get(&self, entry_id: Uuid) -> Option<DeadLetterEntry> {
        self.read().get(&entry_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-enqueue an entry's job with a single fresh attempt, then drop the
    /// entry and the failed job it came from.
    ///
    /// The entry leaves the map before the job is enqueued, so concurrent
    /// replays of one entry enqueue it once. Entries already retried as
    /// another job are refused.
    pub async fn replay(&self, entry_id: Uuid) -> GatewayResult<JobHandle> {
        let entry = self.take_replayable(entry_id)?;

        let options = JobOptions::default()
            .with_priority(entry.priority)
            .with_max_attempts(1)
            .with_backoff(entry.backoff.clone());
        let handle = match self.queue.enqueue(
            &entry.queue,
            &entry.job_name,
            entry.tenant_id,
            entry.payload.clone(),
            &options,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.write().insert(entry.id, entry);
                return Err(e.into());
            }
        };

        info!(
            entry_id = %entry.id,
            old_job_id = %entry.job_id,
            job_id = %handle.id,
            queue = %entry.queue,
            "dead-letter entry replayed"
        );

        if let Err(e) = self.queue.remove(entry.job_id) {
            warn!(job_id = %entry.job_id, error = %e, "failed to remove replayed failed job");
        }
        self.delete_persisted(entry_id).await;
        Ok(handle)
    }

    fn take_replayable(&self, entry_id: Uuid) -> GatewayResult<DeadLetterEntry> {
        let mut entries = self.write();
        let Some(entry) = entries.remove(&entry_id) else {
            return Err(GatewayError::validation(format!(
                "unknown dead-letter entry {entry_id}"
            )));
        };
        match entry.retried_as {
            Some(job_id) => {
                entries.insert(entry_id, entry);
                Err(GatewayError::validation(format!(
                    "dead-letter entry {entry_id} was already retried as job {job_id}"
                )))
            }
            None => Ok(entry),
        }
    }

    /// Re-enqueue every failed job of `queue` with its original attempt
    /// budget.
    pub async fn retry_all_failed(&self, queue: &str) -> GatewayResult<Vec<JobHandle>> {
        let failed = self.queue.list(queue, Some(JobState::Failed), usize::MAX)?;
        let mut handles = Vec::with_capacity(failed.len());
        for job in failed {
            handles.push(self.requeue(&job, job.auto_retries).await?);
        }
        info!(queue, retried = handles.len(), "retried all failed jobs");
        Ok(handles)
    }

    async fn requeue(&self, job: &Job, auto_retries: u32) -> GatewayResult<JobHandle> {
        let handle = self.queue.enqueue_copy(job, &job.options(), auto_retries)?;
        self.queue.remove(job.id)?;
        self.mark_retried(job.id, handle.id).await;
        Ok(handle)
    }

    /// Keep the entry of a requeued job as audit, pointing at its retry.
    async fn mark_retried(&self, job_id: JobId, retried_as: JobId) {
        let marked = self
            .write()
            .values_mut()
            .find(|e| e.job_id == job_id)
            .map(|entry| {
                entry.retried_as = Some(retried_as);
                entry.retried_at = Some(Utc::now());
                entry.clone()
            });
        let Some(entry) = marked else {
            return;
        };
        if let Err(e) = self
            .store_breaker
            .call(|| self.store.save_dead_letter(&entry))
            .await
        {
            warn!(entry_id = %entry.id, error = %e, "failed to persist retried dead-letter entry");
        }
    }

    async fn resolve(&self, entry_id: Uuid) {
        if self.write().remove(&entry_id).is_none() {
            return;
        }
        self.delete_persisted(entry_id).await;
    }

    async fn delete_persisted(&self, entry_id: Uuid) {
        if let Err(e) = self
            .store_breaker
            .call(|| self.store.delete_dead_letter(entry_id))
            .await
        {
            warn!(entry_id = %entry_id, error = %e, "failed to delete dead-letter entry");
        }
    }

    pub async fn auto_retry_sweep(&self) -> GatewayResult<AutoRetryReport> {
        self.auto_retry_sweep_at(Utc::now()).await
    }

    /// Re-enqueue failed jobs whose failure is older than the cooldown and
    /// whose lineage has auto-retries left. Only jobs that used up their
    /// attempts are considered; permanent rejections stay failed.
    pub async fn auto_retry_sweep_at(&self, now: DateTime<Utc>) -> GatewayResult<AutoRetryReport> {
        let mut report = AutoRetryReport::default();
        if !self.auto_retry.enabled {
            return Ok(report);
        }

        let cooldown = to_chrono(self.auto_retry.cooldown);
        for queue in self.queue.queue_names()? {
            for job in self.queue.list(&queue, Some(JobState::Failed), usize::MAX)? {
                if job.attempts_made < job.max_attempts {
                    continue;
                }
                if job.auto_retries >= self.auto_retry.max_auto_retries {
                    report.exhausted += 1;
                    continue;
                }
                let failed_at = job.finished_at.unwrap_or(job.enqueued_at);
                if failed_at + cooldown > now {
                    report.cooling_down += 1;
                    continue;
                }

                let handle = self.requeue(&job, job.auto_retries + 1).await?;
                debug!(
                    queue = %queue,
                    old_job_id = %job.id,
                    job_id = %handle.id,
                    auto_retry = job.auto_retries + 1,
                    "failed job auto-retried"
                );
                report.retried += 1;
            }
        }

        if report.retried > 0 {
            info!(
                retried = report.retried,
                exhausted = report.exhausted,
                "auto-retry sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now()).await
    }

    /// Remove entries (and their failed jobs) older than the retention
    /// window.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(self.config.retention);
        let expired: Vec<DeadLetterEntry> = self
            .read()
            .values()
            .filter(|e| e.failed_at < cutoff)
            .cloned()
            .collect();

        for entry in &expired {
            if let Err(e) = self.queue.remove(entry.job_id) {
                warn!(job_id = %entry.job_id, error = %e, "failed to remove expired failed job");
            }
            self.resolve(entry.id).await;
        }

        if !expired.is_empty() {
            info!(removed = expired.len(), "dead-letter cleanup finished");
        }
        expired.len()
    }

    /// Requeue stalled jobs of `queue`; those that stalled too often are
    /// dead-lettered. Returns how many were.
    pub async fn reap_stalled(&self, queue: &str) -> GatewayResult<usize> {
        let failed = self.queue.requeue_stalled(queue)?;
        for job in &failed {
            self.record(job).await;
        }
        Ok(failed.len())
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterManager {
    async fn on_terminal_failure(&self, job: &Job) {
        self.record(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::jobs::{InMemoryJobStore, JobOutcome, QueueConfig};
    use crate::store::InMemoryDataStore;
    use courier_core::TenantId;
    use serde_json::json;

    struct Fixture {
        queue: Arc<JobQueue>,
        store: Arc<InMemoryDataStore>,
        manager: DeadLetterManager,
    }

    fn fixture(auto_retry: AutoRetryConfig) -> Fixture {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default()));
        let store = Arc::new(InMemoryDataStore::new());
        let manager = DeadLetterManager::new(
            queue.clone(),
            store.clone(),
            Arc::new(CircuitBreaker::new("data_store", CircuitBreakerConfig::default())),
            auto_retry,
            DeadLetterConfig::default(),
        );
        Fixture {
            queue,
            store,
            manager,
        }
    }

    /// Enqueue a job and fail it until it is terminal.
    fn fail_for_good(queue: &JobQueue, max_attempts: u32) -> Job {
        let options = JobOptions::default()
            .with_max_attempts(max_attempts)
            .with_backoff(crate::jobs::BackoffPolicy::fixed(std::time::Duration::ZERO));
        queue
            .enqueue("outbound", "send_text", TenantId::new(), json!({"to": "+1"}), &options)
            .unwrap();
        loop {
            let job = queue.claim("outbound").unwrap().unwrap();
            let updated = queue
                .ack(&job, JobOutcome::Failed("provider down".to_string()))
                .unwrap();
            if updated.state == JobState::Failed {
                return updated;
            }
        }
    }

    #[tokio::test]
    async fn records_terminal_failures_verbatim() {
        let f = fixture(AutoRetryConfig::default());
        let job = fail_for_good(&f.queue, 3);

        f.manager.on_terminal_failure(&job).await;

        let entries = f.manager.list(Some("outbound"), 10);
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.payload, json!({"to": "+1"}));
        assert_eq!(entry.attempts_made, 3);
        assert_eq!(entry.failure_reason, "provider down");
        assert_eq!(entry.history.len(), 3);
        assert_eq!(f.store.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn replay_starts_from_a_fresh_single_attempt() {
        let f = fixture(AutoRetryConfig::default());
        let job = fail_for_good(&f.queue, 3);
        let entry = f.manager.record(&job).await;

        let handle = f.manager.replay(entry.id).await.unwrap();

        let replayed = f.queue.get(handle.id).unwrap().unwrap();
        assert_eq!(replayed.attempts_made, 0);
        assert_eq!(replayed.max_attempts, 1);
        assert_eq!(replayed.payload, job.payload);
        assert_eq!(replayed.backoff, job.backoff);
        assert!(f.queue.get(job.id).unwrap().is_none());
        assert!(f.manager.is_empty());
        assert!(f.store.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn concurrent_replays_enqueue_once() {
        let f = fixture(AutoRetryConfig::default());
        let job = fail_for_good(&f.queue, 3);
        let entry = f.manager.record(&job).await;

        let (first, second) = tokio::join!(f.manager.replay(entry.id), f.manager.replay(entry.id));
        assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);
        assert_eq!(f.queue.counts("outbound").unwrap().waiting, 1);
        assert!(f.manager.is_empty());
    }

    #[tokio::test]
    async fn replay_of_unknown_entry_is_a_validation_error() {
        let f = fixture(AutoRetryConfig::default());
        let err = f.manager.replay(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn auto_retry_respects_cooldown_and_cap() {
        let f = fixture(AutoRetryConfig {
            max_auto_retries: 1,
            ..AutoRetryConfig::default()
        });
        let job = fail_for_good(&f.queue, 1);
        f.manager.record(&job).await;
        let failed_at = job.finished_at.unwrap();

        let early = f.manager.auto_retry_sweep_at(failed_at).await.unwrap();
        assert_eq!(early.cooling_down, 1);
        assert_eq!(early.retried, 0);

        let later = failed_at + chrono::Duration::minutes(6);
        let report = f.manager.auto_retry_sweep_at(later).await.unwrap();
        assert_eq!(report.retried, 1);

        // The copy fails again; its lineage has no auto-retries left.
        let copy = f.queue.claim("outbound").unwrap().unwrap();
        assert_eq!(copy.auto_retries, 1);
        assert_eq!(copy.retry_of, Some(job.id));
        assert_eq!(f.manager.list(None, 10)[0].retried_as, Some(copy.id));
        let failed = f
            .queue
            .ack(&copy, JobOutcome::Failed("still down".to_string()))
            .unwrap();
        f.manager.record(&failed).await;

        let much_later = failed.finished_at.unwrap() + chrono::Duration::hours(1);
        let report = f.manager.auto_retry_sweep_at(much_later).await.unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(report.exhausted, 1);
        assert_eq!(f.manager.len(), 2);
    }

    #[tokio::test]
    async fn auto_retry_keeps_the_audit_record() {
        let f = fixture(AutoRetryConfig::default());
        let job = fail_for_good(&f.queue, 2);
        let entry = f.manager.record(&job).await;

        let later = job.finished_at.unwrap() + chrono::Duration::hours(1);
        assert_eq!(f.manager.auto_retry_sweep_at(later).await.unwrap().retried, 1);
        let copy = f.queue.claim("outbound").unwrap().unwrap();

        let stored = f.store.load_dead_letters().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, entry.id);
        assert_eq!(stored[0].failure_reason, "provider down");
        assert_eq!(stored[0].history.len(), 2);
        assert_eq!(stored[0].retried_as, Some(copy.id));
        assert!(stored[0].retried_at.is_some());
        assert_eq!(f.manager.get(entry.id), Some(stored[0].clone()));

        // Its job already ran again; replaying it would send twice.
        let err = f.manager.replay(entry.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(f.manager.len(), 1);
    }

    #[tokio::test]
    async fn disabled_auto_retry_does_nothing() {
        let f = fixture(AutoRetryConfig {
            enabled: false,
            ..AutoRetryConfig::default()
        });
        let job = fail_for_good(&f.queue, 1);
        let later = job.finished_at.unwrap() + chrono::Duration::hours(1);
        assert_eq!(
            f.manager.auto_retry_sweep_at(later).await.unwrap(),
            AutoRetryReport::default()
        );
    }

    #[tokio::test]
    async fn retry_all_failed_restores_the_full_budget() {
        let f = fixture(AutoRetryConfig::default());
        let a = fail_for_good(&f.queue, 2);
        let b = fail_for_good(&f.queue, 2);
        f.manager.record(&a).await;
        f.manager.record(&b).await;

        let handles = f.manager.retry_all_failed("outbound").await.unwrap();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            let job = f.queue.get(handle.id).unwrap().unwrap();
            assert_eq!(job.attempts_made, 0);
            assert_eq!(job.max_attempts, 2);
        }
        assert_eq!(f.queue.counts("outbound").unwrap().failed, 0);
        assert_eq!(f.manager.len(), 2);
        assert!(f.manager.list(None, 10).iter().all(DeadLetterEntry::is_retried));
        assert!(f.store.dead_letters().iter().all(DeadLetterEntry::is_retried));
    }

    #[tokio::test]
    async fn cleanup_drops_entries_past_retention() {
        let f = fixture(AutoRetryConfig::default());
        let job = fail_for_good(&f.queue, 1);
        f.manager.record(&job).await;
        let failed_at = job.finished_at.unwrap();

        assert_eq!(f.manager.cleanup_at(failed_at + chrono::Duration::days(29)).await, 0);
        assert_eq!(f.manager.cleanup_at(failed_at + chrono::Duration::days(31)).await, 1);
        assert!(f.manager.is_empty());
        assert!(f.queue.get(job.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_survive_a_restart() {
        let f = fixture(AutoRetryConfig::default());
        let job = fail_for_good(&f.queue, 1);
        let entry = f.manager.record(&job).await;

        let restarted = DeadLetterManager::new(
            f.queue.clone(),
            f.store.clone(),
            Arc::new(CircuitBreaker::new("data_store", CircuitBreakerConfig::default())),
            AutoRetryConfig::default(),
            DeadLetterConfig::default(),
        );
        assert_eq!(restarted.load_from_store().await.unwrap(), 1);
        assert_eq!(restarted.get(entry.id), Some(entry));
    }

    #[tokio::test]
    async fn store_outages_do_not_lose_entries() {
        let f = fixture(AutoRetryConfig::default());
        f.store.fail_writes(true);
        let job = fail_for_good(&f.queue, 1);

        f.manager.record(&job).await;
        assert_eq!(f.manager.len(), 1);
        assert!(f.store.dead_letters().is_empty());
    }
}
