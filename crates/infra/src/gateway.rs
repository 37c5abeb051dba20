//! Gateway composition root.
//!
//! `GatewayBuilder` wires every component once; `Gateway::start` loads
//! persisted state, spawns the worker pools and the maintenance timers,
//! and `Gateway::shutdown` drains them.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use courier_core::{GatewayError, GatewayResult};
use courier_events::{InMemoryEventBus, Notification};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, DATA_STORE, TRANSPORT};
use crate::config::GatewayConfig;
use crate::dead_letter::DeadLetterManager;
use crate::dedup::Deduplicator;
use crate::delivery::DeliveryTracker;
use crate::dispatch::{INBOUND_QUEUE, InboundReceiver, OUTBOUND_QUEUE, OutboundDispatcher, RECEIVE_JOB};
use crate::jobs::{
    ExecutorStats, InMemoryJobStore, JobExecutor, JobQueue, JobStore, WorkerPoolHandle,
};
use crate::metrics::QueueMetrics;
use crate::notify::{FanoutSink, NotificationSink};
use crate::ports::{ChannelTransport, DataStore};
use crate::producer::Producer;
use crate::rate_limit::RateLimiter;
use crate::sessions::SessionRegistry;
use crate::store::InMemoryDataStore;
use crate::transport::LoopbackTransport;

/// Outbound job names handled by the dispatcher.
const SEND_JOBS: [&str; 3] = ["send_text", "send_media", "send_location"];

/// Builds a [`Gateway`]. Anything not supplied falls back to the in-process
/// implementation (in-memory stores, loopback transport).
#[derive(Default)]
pub struct GatewayBuilder {
    config: GatewayConfig,
    data_store: Option<Arc<dyn DataStore>>,
    job_store: Option<Arc<dyn JobStore>>,
    transport: Option<Arc<dyn ChannelTransport>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(store);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Extra destination for notifications (e.g. a Redis channel).
    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Gateway {
        let config = self.config;
        let store: Arc<dyn DataStore> = self
            .data_store
            .unwrap_or_else(|| Arc::new(InMemoryDataStore::new()));
        let job_store = self
            .job_store
            .unwrap_or_else(|| InMemoryJobStore::arc() as Arc<dyn JobStore>);
        let transport: Arc<dyn ChannelTransport> = self
            .transport
            .unwrap_or_else(|| Arc::new(LoopbackTransport::new()));

        let notifications = Arc::new(InMemoryEventBus::<Notification>::new());
        let notifier: Arc<dyn NotificationSink> = if self.sinks.is_empty() {
            notifications.clone()
        } else {
            let fanout = self
                .sinks
                .into_iter()
                .fold(FanoutSink::new().with(notifications.clone()), FanoutSink::with);
            Arc::new(fanout)
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let transport_breaker =
            breakers.get_or_create(TRANSPORT, config.transport_breaker.clone());
        let store_breaker = breakers.get_or_create(DATA_STORE, config.data_store_breaker.clone());

        let queue = Arc::new(JobQueue::new(job_store, config.queues.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let dedup = Arc::new(Deduplicator::new(config.dedup.clone()));

        let sessions = Arc::new(SessionRegistry::new(
            config.sessions.clone(),
            store.clone(),
            store_breaker.clone(),
            transport.clone(),
            notifier.clone(),
        ));
        let delivery = Arc::new(DeliveryTracker::new(
            config.delivery.clone(),
            store.clone(),
            store_breaker.clone(),
            transport.clone(),
            notifier.clone(),
        ));
        let dead_letters = Arc::new(DeadLetterManager::new(
            queue.clone(),
            store.clone(),
            store_breaker.clone(),
            config.auto_retry.clone(),
            config.dead_letter.clone(),
        ));
        let metrics = Arc::new(QueueMetrics::new(queue.clone(), config.metrics.clone()));
        let producer = Arc::new(Producer::new(
            queue.clone(),
            sessions.clone(),
            limiter.clone(),
            transport_breaker.clone(),
            dedup.clone(),
            config.queues.default_job_options.clone(),
        ));

        Gateway {
            config,
            store,
            transport,
            notifier,
            notifications,
            breakers,
            transport_breaker,
            store_breaker,
            queue,
            limiter,
            dedup,
            sessions,
            delivery,
            dead_letters,
            metrics,
            producer,
            running: Mutex::new(None),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    pools: Vec<WorkerPoolHandle>,
    tasks: Vec<JoinHandle<()>>,
}

/// The assembled dispatch gateway.
pub struct Gateway {
    config: GatewayConfig,
    store: Arc<dyn DataStore>,
    transport: Arc<dyn ChannelTransport>,
    notifier: Arc<dyn NotificationSink>,
    notifications: Arc<InMemoryEventBus<Notification>>,
    breakers: Arc<CircuitBreakerRegistry>,
    transport_breaker: Arc<CircuitBreaker>,
    store_breaker: Arc<CircuitBreaker>,
    queue: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    dedup: Arc<Deduplicator>,
    sessions: Arc<SessionRegistry>,
    delivery: Arc<DeliveryTracker>,
    dead_letters: Arc<DeadLetterManager>,
    metrics: Arc<QueueMetrics>,
    producer: Arc<Producer>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("sessions", &self.sessions.len())
            .field("dead_letters", &self.dead_letters.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.is_some())
            .unwrap_or_else(|e| e.into_inner().is_some())
    }

    /// Load persisted sessions and dead letters, then spawn the worker pools
    /// and maintenance timers. Calling `start` on a running gateway is a no-op.
    pub async fn start(&self) -> GatewayResult<()> {
        if self.is_running() {
            return Ok(());
        }
        self.config
            .validate()
            .map_err(|e| GatewayError::validation(e.to_string()))?;

        let sessions = self.sessions.load_from_store().await.map_err(GatewayError::from)?;
        let dead_letters = self
            .dead_letters
            .load_from_store()
            .await
            .map_err(GatewayError::from)?;
        info!(sessions, dead_letters, "restored gateway state");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pools = vec![self.spawn_outbound(), self.spawn_inbound()];
        let tasks = self.spawn_maintenance(&shutdown_rx);

        let lost_race = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if running.is_some() {
                Some((shutdown_tx, pools))
            } else {
                *running = Some(Running {
                    shutdown: shutdown_tx,
                    pools,
                    tasks,
                });
                None
            }
        };
        if let Some((shutdown_tx, pools)) = lost_race {
            // A concurrent start won; undo ours.
            let _ = shutdown_tx.send(true);
            for pool in pools {
                pool.shutdown().await;
            }
            return Ok(());
        }
        info!(
            concurrency = self.config.workers.concurrency,
            "gateway started"
        );
        Ok(())
    }

    fn spawn_outbound(&self) -> WorkerPoolHandle {
        let dispatcher = Arc::new(OutboundDispatcher::new(
            self.sessions.clone(),
            self.dedup.clone(),
            self.limiter.clone(),
            self.transport_breaker.clone(),
            self.transport.clone(),
            self.delivery.clone(),
        ));
        let mut executor =
            JobExecutor::new(self.queue.clone()).with_dead_letter_sink(self.dead_letters.clone());
        for name in SEND_JOBS {
            executor.register_handler(name, dispatcher.clone());
        }
        executor.spawn(OUTBOUND_QUEUE, self.config.workers.clone())
    }

    fn spawn_inbound(&self) -> WorkerPoolHandle {
        let receiver = Arc::new(InboundReceiver::new(
            self.sessions.clone(),
            self.store.clone(),
            self.store_breaker.clone(),
            self.notifier.clone(),
        ));
        let mut executor =
            JobExecutor::new(self.queue.clone()).with_dead_letter_sink(self.dead_letters.clone());
        executor.register_handler(RECEIVE_JOB, receiver);
        executor.spawn(INBOUND_QUEUE, self.config.workers.clone())
    }

    fn spawn_maintenance(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let cfg = &self.config;
        let mut tasks = Vec::new();

        let sessions = self.sessions.clone();
        tasks.push(spawn_periodic(
            "session_health",
            cfg.sessions.health_interval,
            shutdown.clone(),
            move || {
                let sessions = sessions.clone();
                async move {
                    let report = sessions.health_sweep().await;
                    debug!(?report, "session health sweep");
                }
            },
        ));

        let limiter = self.limiter.clone();
        tasks.push(spawn_periodic(
            "rate_limit_sweep",
            cfg.rate_limit.sweep_interval,
            shutdown.clone(),
            move || {
                let limiter = limiter.clone();
                async move {
                    let removed = limiter.sweep();
                    debug!(removed, "rate limit sweep");
                }
            },
        ));

        let dedup = self.dedup.clone();
        tasks.push(spawn_periodic(
            "dedup_sweep",
            cfg.dedup.sweep_interval,
            shutdown.clone(),
            move || {
                let dedup = dedup.clone();
                async move {
                    let removed = dedup.sweep();
                    debug!(removed, "dedup sweep");
                }
            },
        ));

        let delivery = self.delivery.clone();
        tasks.push(spawn_periodic(
            "delivery_checks",
            cfg.delivery.check_interval,
            shutdown.clone(),
            move || {
                let delivery = delivery.clone();
                async move {
                    let report = delivery.check_pending().await;
                    debug!(?report, "delivery status checks");
                }
            },
        ));

        if cfg.auto_retry.enabled {
            let dead_letters = self.dead_letters.clone();
            tasks.push(spawn_periodic(
                "auto_retry",
                cfg.auto_retry.interval,
                shutdown.clone(),
                move || {
                    let dead_letters = dead_letters.clone();
                    async move {
                        match dead_letters.auto_retry_sweep().await {
                            Ok(report) => debug!(?report, "auto-retry sweep"),
                            Err(e) => warn!(error = %e, "auto-retry sweep failed"),
                        }
                    }
                },
            ));
        }

        let dead_letters = self.dead_letters.clone();
        tasks.push(spawn_periodic(
            "dead_letter_cleanup",
            cfg.dead_letter.cleanup_interval,
            shutdown.clone(),
            move || {
                let dead_letters = dead_letters.clone();
                async move {
                    let removed = dead_letters.cleanup().await;
                    debug!(removed, "dead-letter cleanup");
                }
            },
        ));

        let dead_letters = self.dead_letters.clone();
        tasks.push(spawn_periodic(
            "stalled_reaper",
            cfg.queues.stalled_check_interval,
            shutdown.clone(),
            move || {
                let dead_letters = dead_letters.clone();
                async move {
                    for queue in [OUTBOUND_QUEUE, INBOUND_QUEUE] {
                        if let Err(e) = dead_letters.reap_stalled(queue).await {
                            warn!(queue, error = %e, "stalled job reaper failed");
                        }
                    }
                }
            },
        ));

        let metrics = self.metrics.clone();
        tasks.push(spawn_periodic(
            "metrics_log",
            cfg.metrics.log_interval,
            shutdown.clone(),
            move || {
                let metrics = metrics.clone();
                async move {
                    if let Err(e) = metrics.log_summary() {
                        warn!(error = %e, "failed to collect queue metrics");
                    }
                }
            },
        ));

        tasks
    }

    /// Stop the timers, then drain the worker pools. Safe to call twice.
    pub async fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        for task in running.tasks {
            let _ = task.await;
        }
        for pool in running.pools {
            pool.shutdown().await;
        }
        info!("gateway stopped");
    }

    /// Stats per running worker pool, keyed by queue name.
    pub fn worker_stats(&self) -> Vec<(String, ExecutorStats)> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| {
                r.pools
                    .iter()
                    .map(|p| (p.queue_name().to_string(), p.stats()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn deduplicator(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn transport_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.transport_breaker
    }

    pub fn data_store_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.store_breaker
    }

    pub fn delivery(&self) -> &Arc<DeliveryTracker> {
        &self.delivery
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterManager> {
        &self.dead_letters
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    pub fn data_store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn ChannelTransport> {
        &self.transport
    }

    /// Local notification bus; subscribe here for SSE streams.
    pub fn notifications(&self) -> &Arc<InMemoryEventBus<Notification>> {
        &self.notifications
    }
}

/// Run `tick` every `every` until `shutdown` flips. The first run happens one
/// period after start.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let every = every.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = name, period_ms = every.as_millis() as u64, "maintenance task started");

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "maintenance task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{DeliveryStatus, SessionId, TenantId};
    use courier_events::EventBus;

    use crate::jobs::JobState;

    fn gateway() -> (Gateway, Arc<LoopbackTransport>) {
        let mut config = GatewayConfig::default();
        config.workers.poll_interval = Duration::from_millis(20);
        config.workers.max_jobs_per_second = 0;
        let transport = Arc::new(LoopbackTransport::new());
        let gateway = Gateway::builder(config)
            .transport(transport.clone())
            .build();
        (gateway, transport)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn start_refuses_a_job_timeout_shorter_than_the_transport_call() {
        let mut config = GatewayConfig::default();
        config.workers.job_timeout = Duration::from_secs(5);
        config.transport_breaker.call_timeout = Duration::from_secs(10);
        let gateway = Gateway::builder(config)
            .transport(Arc::new(LoopbackTransport::new()))
            .build();

        let err = gateway.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(!gateway.is_running());
    }

    #[tokio::test]
    async fn start_dispatches_and_shutdown_stops() {
        let (gateway, transport) = gateway();
        let tenant = TenantId::new();
        let session = SessionId::new("main").unwrap();
        gateway
            .sessions()
            .register(tenant, session.clone(), Default::default())
            .await
            .unwrap();

        gateway.start().await.unwrap();
        assert!(gateway.is_running());
        gateway.start().await.unwrap();

        let receipt = gateway
            .producer()
            .enqueue_send_text(tenant, session.clone(), "+15550001", "hello", None)
            .unwrap();

        let queue = gateway.queue().clone();
        let job_id = receipt.job_id;
        assert!(
            wait_for(|| {
                queue
                    .get(job_id)
                    .ok()
                    .flatten()
                    .is_some_and(|j| j.state == JobState::Completed)
            })
            .await
        );

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let record = gateway.delivery().get(&sent[0].provider_message_id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);

        gateway.shutdown().await;
        assert!(!gateway.is_running());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn extra_sinks_receive_notifications() {
        let extra = Arc::new(InMemoryEventBus::<Notification>::new());
        let sub = extra.subscribe();
        let gateway = Gateway::builder(GatewayConfig::default())
            .notification_sink(extra.clone())
            .build();
        let local = gateway.notifications().subscribe();

        let tenant = TenantId::new();
        let session = SessionId::new("main").unwrap();
        gateway
            .sessions()
            .register(tenant, session.clone(), Default::default())
            .await
            .unwrap();
        gateway
            .sessions()
            .set_status(tenant, &session, crate::sessions::SessionStatus::Error, None)
            .await
            .unwrap();

        assert_eq!(sub.drain().len(), 1);
        assert_eq!(local.drain().len(), 1);
    }
}
