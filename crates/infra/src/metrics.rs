//! Queue metrics: live counts plus running totals folded from queue events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use courier_events::Subscription;

use crate::jobs::{JobCounts, JobQueue, JobQueueError, QueueEvent, QueueEventKind};

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// How often a summary line is logged per queue.
    #[serde(with = "crate::config::duration_secs")]
    pub log_interval: Duration,
    /// Waiting jobs above which a queue is degraded.
    pub backlog_threshold: usize,
    /// Failure rate (failed / finished) above which a queue is degraded.
    pub degraded_failure_rate: f64,
    /// Failure rate above which a queue is unhealthy.
    pub unhealthy_failure_rate: f64,
    /// Finished jobs needed before failure rates count.
    pub min_samples: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_interval: Duration::from_secs(60),
            backlog_threshold: 1_000,
            degraded_failure_rate: 0.1,
            unhealthy_failure_rate: 0.5,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Running totals since start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTotals {
    pub enqueued: u64,
    pub started: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub released: u64,
    pub stalled: u64,
    pub dead_lettered: u64,
}

impl QueueTotals {
    fn apply(&mut self, kind: &QueueEventKind) {
        match kind {
            QueueEventKind::Waiting | QueueEventKind::Delayed { .. } => self.enqueued += 1,
            QueueEventKind::Active { .. } => self.started += 1,
            QueueEventKind::Completed => self.completed += 1,
            QueueEventKind::Retrying { .. } => self.retried += 1,
            QueueEventKind::Failed { .. } => self.failed += 1,
            QueueEventKind::Released { .. } => self.released += 1,
            QueueEventKind::Stalled => self.stalled += 1,
            QueueEventKind::DeadLettered => self.dead_lettered += 1,
            QueueEventKind::Removed => {}
        }
    }

    /// Failed attempts over finished attempts.
    pub fn failure_rate(&self) -> f64 {
        let failures = self.failed + self.retried;
        let finished = failures + self.completed;
        if finished == 0 {
            0.0
        } else {
            failures as f64 / finished as f64
        }
    }
}

/// One queue's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queue: String,
    pub counts: JobCounts,
    pub totals: QueueTotals,
    pub failure_rate: f64,
    pub health: QueueHealth,
}

/// Folds queue events into per-queue totals.
pub struct QueueMetrics {
    config: MetricsConfig,
    queue: Arc<JobQueue>,
    events: Mutex<Subscription<QueueEvent>>,
    totals: Mutex<HashMap<String, QueueTotals>>,
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueueMetrics {
    /// Subscribes to `queue`; only events published afterwards are counted.
    pub fn new(queue: Arc<JobQueue>, config: MetricsConfig) -> Self {
        let events = queue.subscribe();
        Self {
            config,
            queue,
            events: Mutex::new(events),
            totals: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Fold every buffered event into the totals. Returns how many there were.
    pub fn collect(&self) -> usize {
        let drained = self
            .events
            .lock()
            .map(|sub| sub.drain())
            .unwrap_or_else(|e| e.into_inner().drain());
        if drained.is_empty() {
            return 0;
        }

        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        for event in &drained {
            totals
                .entry(event.queue.clone())
                .or_default()
                .apply(&event.kind);
        }
        drained.len()
    }

    pub fn totals(&self, queue: &str) -> QueueTotals {
        self.collect();
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self, queue: &str) -> Result<QueueSnapshot, JobQueueError> {
        let counts = self.queue.counts(queue)?;
        let totals = self.totals(queue);
        let failure_rate = totals.failure_rate();
        let health = self.health(&counts, &totals);
        Ok(QueueSnapshot {
            queue: queue.to_string(),
            counts,
            totals,
            failure_rate,
            health,
        })
    }

    /// Snapshots of every queue that has jobs or totals.
    pub fn snapshot_all(&self) -> Result<Vec<QueueSnapshot>, JobQueueError> {
        self.collect();
        let mut names = self.queue.queue_names()?;
        names.extend(
            self.totals
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .cloned(),
        );
        names.sort();
        names.dedup();
        names.iter().map(|q| self.snapshot(q)).collect()
    }

    fn health(&self, counts: &JobCounts, totals: &QueueTotals) -> QueueHealth {
        let finished = totals.completed + totals.failed + totals.retried;
        let rate = if finished >= self.config.min_samples {
            totals.failure_rate()
        } else {
            0.0
        };

        if rate >= self.config.unhealthy_failure_rate {
            QueueHealth::Unhealthy
        } else if rate >= self.config.degraded_failure_rate
            || counts.waiting >= self.config.backlog_threshold
        {
            QueueHealth::Degraded
        } else {
            QueueHealth::Healthy
        }
    }

    /// Log one summary line per queue.
    pub fn log_summary(&self) -> Result<(), JobQueueError> {
        for snapshot in self.snapshot_all()? {
            info!(
                queue = %snapshot.queue,
                waiting = snapshot.counts.waiting,
                active = snapshot.counts.active,
                delayed = snapshot.counts.delayed,
                completed = snapshot.totals.completed,
                failed = snapshot.totals.failed,
                dead_lettered = snapshot.totals.dead_lettered,
                health = ?snapshot.health,
                "queue metrics"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{BackoffPolicy, InMemoryJobStore, JobOptions, JobOutcome, QueueConfig};
    use courier_core::TenantId;
    use serde_json::json;

    fn setup() -> (Arc<JobQueue>, QueueMetrics) {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default()));
        let metrics = QueueMetrics::new(
            queue.clone(),
            MetricsConfig {
                min_samples: 2,
                ..MetricsConfig::default()
            },
        );
        (queue, metrics)
    }

    fn run(queue: &JobQueue, outcome: JobOutcome) {
        let options = JobOptions::default()
            .with_max_attempts(1)
            .with_backoff(BackoffPolicy::fixed(Duration::ZERO));
        queue
            .enqueue("q", "work", TenantId::new(), json!({}), &options)
            .unwrap();
        let job = queue.claim("q").unwrap().unwrap();
        queue.ack(&job, outcome).unwrap();
    }

    #[test]
    fn totals_follow_queue_events() {
        let (queue, metrics) = setup();
        run(&queue, JobOutcome::Completed(json!(null)));
        run(&queue, JobOutcome::Failed("boom".to_string()));

        let totals = metrics.totals("q");
        assert_eq!(totals.enqueued, 2);
        assert_eq!(totals.started, 2);
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.failed, 1);
    }

    #[test]
    fn health_reflects_failure_rate() {
        let (queue, metrics) = setup();
        run(&queue, JobOutcome::Completed(json!(null)));
        run(&queue, JobOutcome::Completed(json!(null)));
        assert_eq!(metrics.snapshot("q").unwrap().health, QueueHealth::Healthy);

        run(&queue, JobOutcome::Failed("boom".to_string()));
        run(&queue, JobOutcome::Failed("boom".to_string()));
        let snapshot = metrics.snapshot("q").unwrap();
        assert_eq!(snapshot.failure_rate, 0.5);
        assert_eq!(snapshot.health, QueueHealth::Unhealthy);
    }

    #[test]
    fn backlog_degrades_a_queue() {
        let queue = Arc::new(JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default()));
        let metrics = QueueMetrics::new(
            queue.clone(),
            MetricsConfig {
                backlog_threshold: 3,
                ..MetricsConfig::default()
            },
        );
        for _ in 0..3 {
            queue
                .enqueue("q", "work", TenantId::new(), json!({}), &JobOptions::default())
                .unwrap();
        }
        let all = metrics.snapshot_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].counts.waiting, 3);
        assert_eq!(all[0].health, QueueHealth::Degraded);
    }
}
