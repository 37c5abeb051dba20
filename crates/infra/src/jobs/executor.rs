//! Worker pool: claims jobs from a queue and runs them with registered handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{JobQueue, JobQueueError};
use super::throttle::Throttle;
use super::types::{Job, JobOutcome, JobState};

/// Runs one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobOutcome;
}

/// Adapter turning an async closure into a `JobHandler`.
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send,
{
    async fn handle(&self, job: &Job) -> JobOutcome {
        (self.0)(job.clone()).await
    }
}

/// Receives jobs that failed for good.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn on_terminal_failure(&self, job: &Job);
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent workers per queue.
    pub concurrency: usize,
    /// Pool-wide cap on job starts per second (0 = unlimited).
    pub max_jobs_per_second: u32,
    /// Hard timeout for one handler run; a timeout is a failed attempt.
    #[serde(with = "crate::config::duration_secs")]
    pub job_timeout: Duration,
    /// Longest idle wait before re-polling the queue.
    #[serde(with = "crate::config::duration_millis")]
    pub poll_interval: Duration,
    /// How long `shutdown` waits for in-flight jobs.
    #[serde(with = "crate::config::duration_secs")]
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_jobs_per_second: 10,
            job_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1_000),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_released: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct SharedStats {
    started: Instant,
    stats: Mutex<ExecutorStats>,
}

impl SharedStats {
    fn update(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    fn snapshot(&self) -> ExecutorStats {
        let mut snapshot = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        snapshot.uptime_secs = self.started.elapsed().as_secs();
        snapshot
    }
}

/// Handle to control a running worker pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    queue_name: String,
    queue: Arc<JobQueue>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<SharedStats>,
    drain_timeout: Duration,
}

impl WorkerPoolHandle {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot()
    }

    /// Stop claiming, let in-flight jobs finish (up to the drain timeout),
    /// then abort whatever is left. Aborted jobs keep their lease and are
    /// picked up again by the stall reaper.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.queue.wake(&self.queue_name);

        let aborts: Vec<_> = self.workers.iter().map(|w| w.abort_handle()).collect();
        let drained = tokio::time::timeout(self.drain_timeout, async {
            for worker in self.workers {
                let _ = worker.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(queue = %self.queue_name, "drain timeout elapsed, aborting workers");
            for abort in aborts {
                abort.abort();
            }
        }
        info!(queue = %self.queue_name, "worker pool stopped");
    }
}

/// Background job executor.
///
/// Claims jobs from one queue, executes them with registered handlers and
/// acks the outcome. Terminal failures go to the dead-letter sink.
pub struct JobExecutor {
    queue: Arc<JobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    stats: Arc<SharedStats>,
}

impl JobExecutor {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            dead_letters: None,
            stats: Arc::new(SharedStats {
                started: Instant::now(),
                stats: Mutex::new(ExecutorStats::default()),
            }),
        }
    }

    /// Statistics of every job this executor processed.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot()
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Register a handler for a job name. Patterns: exact name, `prefix.*`
    /// or `*`.
    pub fn register_handler(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    fn handler_for(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        // Try exact match first
        if let Some(h) = self.handlers.get(name) {
            return Some(h.clone());
        }

        // Try category match (e.g., "send.*" matches "send.text")
        for (pattern, handler) in &self.handlers {
            if let Some(prefix) = pattern.strip_suffix(".*") {
                if name.starts_with(prefix) {
                    return Some(handler.clone());
                }
            }
        }

        // Try wildcard
        self.handlers.get("*").cloned()
    }

    /// Run a claimed job to its outcome and ack it.
    pub async fn process(&self, job: Job, timeout: Duration) -> Result<Job, JobQueueError> {
        let outcome = match self.handler_for(&job.name) {
            Some(handler) => match tokio::time::timeout(timeout, handler.handle(&job)).await {
                Ok(outcome) => outcome,
                Err(_) => JobOutcome::Failed(format!("job timed out after {}ms", timeout.as_millis())),
            },
            None => {
                warn!(queue = %job.queue, job_id = %job.id, job = %job.name, "no handler for job");
                JobOutcome::Terminal(format!("no handler registered for job: {}", job.name))
            }
        };

        match &outcome {
            JobOutcome::Completed(_) => self.stats.update(|s| s.jobs_succeeded += 1),
            JobOutcome::Failed(reason) | JobOutcome::Terminal(reason) => {
                debug!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    error = %reason,
                    "job attempt failed"
                );
                self.stats.update(|s| s.jobs_failed += 1);
            }
            JobOutcome::Release { .. } => self.stats.update(|s| s.jobs_released += 1),
        }

        let updated = self.queue.ack(&job, outcome)?;

        if updated.state == JobState::Failed {
            warn!(
                queue = %updated.queue,
                job_id = %updated.id,
                attempts = updated.attempts_made,
                reason = updated.failed_reason.as_deref().unwrap_or(""),
                "job failed terminally"
            );
            self.stats.update(|s| s.jobs_dead_lettered += 1);
            if let Some(sink) = &self.dead_letters {
                sink.on_terminal_failure(&updated).await;
            }
        }

        Ok(updated)
    }

    /// Spawn `config.concurrency` workers on the current tokio runtime.
    pub fn spawn(self, queue_name: impl Into<String>, config: WorkerConfig) -> WorkerPoolHandle {
        let queue_name = queue_name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let throttle = Arc::new(Throttle::new(config.max_jobs_per_second));
        let queue = self.queue.clone();
        let executor = Arc::new(self);

        let workers = (0..config.concurrency.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    executor.clone(),
                    queue_name.clone(),
                    worker,
                    config.clone(),
                    throttle.clone(),
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(queue = %queue_name, concurrency = config.concurrency, "worker pool started");

        WorkerPoolHandle {
            queue_name,
            queue,
            shutdown: shutdown_tx,
            workers,
            stats,
            drain_timeout: config.drain_timeout,
        }
    }
}

async fn worker_loop(
    executor: Arc<JobExecutor>,
    queue_name: String,
    worker: usize,
    config: WorkerConfig,
    throttle: Arc<Throttle>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<SharedStats>,
) {
    debug!(queue = %queue_name, worker, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match executor.queue.claim(&queue_name) {
            Ok(Some(job)) => {
                throttle.acquire().await;
                stats.update(|s| s.current_running += 1);

                let result = executor.process(job, config.job_timeout).await;

                stats.update(|s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.jobs_processed += 1;
                });

                if let Err(e) = result {
                    error!(queue = %queue_name, worker, error = %e, "failed to ack job");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = executor.queue.wait_for_work(&queue_name, config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                error!(queue = %queue_name, worker, error = %e, "failed to claim job");
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    debug!(queue = %queue_name, worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::jobs::queue::QueueConfig;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{BackoffPolicy, JobOptions};
    use courier_core::TenantId;

    fn queue() -> Arc<JobQueue> {
        Arc::new(JobQueue::new(InMemoryJobStore::arc(), QueueConfig::default()))
    }

    fn options(max_attempts: u32) -> JobOptions {
        JobOptions::default()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffPolicy::fixed(Duration::ZERO))
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<Job>>);

    #[async_trait]
    impl DeadLetterSink for CollectingSink {
        async fn on_terminal_failure(&self, job: &Job) {
            self.0.lock().unwrap().push(job.clone());
        }
    }

    #[tokio::test]
    async fn execute_successful_job() {
        let q = queue();
        let mut executor = JobExecutor::new(q.clone());
        executor.register_handler(
            "send_text",
            Arc::new(handler_fn(|_job| async { JobOutcome::Completed(serde_json::json!({"ok": true})) })),
        );

        q.enqueue("outbound", "send_text", TenantId::new(), serde_json::json!({}), &options(3))
            .unwrap();
        let job = q.claim("outbound").unwrap().unwrap();

        let done = executor.process(job, Duration::from_secs(1)).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
    }

    #[tokio::test]
    async fn exhausted_jobs_reach_the_sink() {
        let q = queue();
        let sink = Arc::new(CollectingSink::default());
        let mut executor = JobExecutor::new(q.clone()).with_dead_letter_sink(sink.clone());
        executor.register_handler(
            "*",
            Arc::new(handler_fn(|_job| async { JobOutcome::Failed("provider down".into()) })),
        );

        q.enqueue("outbound", "send_text", TenantId::new(), serde_json::json!({"to": "a"}), &options(2))
            .unwrap();

        for _ in 0..2 {
            let job = q.claim("outbound").unwrap().unwrap();
            executor.process(job, Duration::from_secs(1)).await.unwrap();
        }

        let dead = sink.0.lock().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts_made, 2);
        assert_eq!(dead[0].payload, serde_json::json!({"to": "a"}));
    }

    #[tokio::test]
    async fn missing_handler_is_terminal() {
        let q = queue();
        let executor = JobExecutor::new(q.clone());
        q.enqueue("outbound", "unknown", TenantId::new(), serde_json::json!({}), &options(3))
            .unwrap();
        let job = q.claim("outbound").unwrap().unwrap();

        let failed = executor.process(job, Duration::from_secs(1)).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.attempts_made, 1);
    }

    #[tokio::test]
    async fn category_handler_matches_prefix() {
        let q = queue();
        let mut executor = JobExecutor::new(q.clone());
        executor.register_handler(
            "send.*",
            Arc::new(handler_fn(|_job| async { JobOutcome::Completed(serde_json::Value::Null) })),
        );
        q.enqueue("outbound", "send.text", TenantId::new(), serde_json::json!({}), &options(1))
            .unwrap();
        let job = q.claim("outbound").unwrap().unwrap();

        let done = executor.process(job, Duration::from_secs(1)).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
    }

    #[tokio::test]
    async fn slow_handlers_time_out() {
        let q = queue();
        let mut executor = JobExecutor::new(q.clone());
        executor.register_handler(
            "*",
            Arc::new(handler_fn(|_job| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                JobOutcome::Completed(serde_json::Value::Null)
            })),
        );
        q.enqueue("outbound", "send_text", TenantId::new(), serde_json::json!({}), &options(1))
            .unwrap();
        let job = q.claim("outbound").unwrap().unwrap();

        let failed = executor.process(job, Duration::from_millis(20)).await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.failed_reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn spawned_pool_drains_the_queue() {
        let q = queue();
        let processed = Arc::new(AtomicUsize::new(0));
        let mut executor = JobExecutor::new(q.clone());
        {
            let processed = processed.clone();
            executor.register_handler(
                "*",
                Arc::new(handler_fn(move |_job| {
                    let processed = processed.clone();
                    async move {
                        processed.fetch_add(1, Ordering::SeqCst);
                        JobOutcome::Completed(serde_json::Value::Null)
                    }
                })),
            );
        }

        let pool = executor.spawn(
            "outbound",
            WorkerConfig {
                max_jobs_per_second: 0,
                poll_interval: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
        );
        for _ in 0..10 {
            q.enqueue("outbound", "send_text", TenantId::new(), serde_json::json!({}), &options(1))
                .unwrap();
        }

        for _ in 0..100 {
            if pool.stats().jobs_processed == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(processed.load(Ordering::SeqCst), 10);
        assert_eq!(pool.stats().jobs_succeeded, 10);
        pool.shutdown().await;
    }
}
