//! Producer API: validate, gate and enqueue.
//!
//! Sends are checked in this order and rejected without queueing on the
//! first failure:
//!
//! 1. content and recipient validation
//! 2. the session must be registered for the tenant
//! 3. the transport breaker must not be open
//! 4. the dedup key must not have been processed recently
//! 5. the (tenant, session) rate limit
//!
//! The rate limit comes last so rejected requests do not spend budget, and
//! a counted send that then fails to enqueue is refunded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use courier_core::{
    GatewayError, GatewayResult, InboundMessage, MediaSource, MessageContent, MessageId,
    OutboundMessage, SessionId, TenantId,
};

use crate::circuit_breaker::CircuitBreaker;
use crate::dedup::Deduplicator;
use crate::dispatch::{INBOUND_QUEUE, OUTBOUND_QUEUE, OutboundJob, RECEIVE_JOB};
use crate::jobs::{JobId, JobOptions, JobQueue};
use crate::rate_limit::RateLimiter;
use crate::sessions::SessionRegistry;

/// Acknowledgement returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub message_id: MessageId,
    pub queue: String,
    pub job_name: String,
    /// Sends left in the tightest rate window (outbound only).
    pub rate_limit_remaining: Option<u32>,
}

/// Entry point for producers.
pub struct Producer {
    queue: Arc<JobQueue>,
    sessions: Arc<SessionRegistry>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    dedup: Arc<Deduplicator>,
    options: JobOptions,
}

impl Producer {
    pub fn new(
        queue: Arc<JobQueue>,
        sessions: Arc<SessionRegistry>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        dedup: Arc<Deduplicator>,
        options: JobOptions,
    ) -> Self {
        Self {
            queue,
            sessions,
            limiter,
            breaker,
            dedup,
            options,
        }
    }

    /// Job options applied to every enqueue.
    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn enqueue_send_text(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        to: impl Into<String>,
        text: impl Into<String>,
        quoted_id: Option<String>,
    ) -> GatewayResult<EnqueueReceipt> {
        self.enqueue_send(
            tenant_id,
            session_id,
            OutboundMessage::new(
                to,
                MessageContent::Text {
                    text: text.into(),
                    quoted_id,
                },
            ),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_send_media(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        to: impl Into<String>,
        source: MediaSource,
        mimetype: impl Into<String>,
        caption: Option<String>,
        filename: Option<String>,
    ) -> GatewayResult<EnqueueReceipt> {
        self.enqueue_send(
            tenant_id,
            session_id,
            OutboundMessage::new(
                to,
                MessageContent::Media {
                    source,
                    mimetype: mimetype.into(),
                    caption,
                    filename,
                },
            ),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_send_location(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        to: impl Into<String>,
        latitude: f64,
        longitude: f64,
        address: Option<String>,
        name: Option<String>,
    ) -> GatewayResult<EnqueueReceipt> {
        self.enqueue_send(
            tenant_id,
            session_id,
            OutboundMessage::new(
                to,
                MessageContent::Location {
                    latitude,
                    longitude,
                    address,
                    name,
                },
            ),
        )
    }

    /// Validate, gate and enqueue one outbound message.
    pub fn enqueue_send(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        message: OutboundMessage,
    ) -> GatewayResult<EnqueueReceipt> {
        message.validate()?;

        if !self.sessions.is_registered(tenant_id, &session_id) {
            return Err(GatewayError::validation(format!(
                "session {session_id} is not registered for tenant {tenant_id}"
            )));
        }

        if let Some(retry_after) = self.breaker.open_retry_after() {
            return Err(GatewayError::CircuitOpen {
                operation: self.breaker.name().to_string(),
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        let dedup_key =
            self.dedup
                .compute_key(&session_id, &message.to, &message.content.dedup_content());
        if self.dedup.is_duplicate(&dedup_key) {
            return Err(GatewayError::Duplicate { key: dedup_key });
        }

        let decision = self.limiter.check_and_increment(tenant_id, &session_id);
        if !decision.allowed {
            return Err(GatewayError::rate_limited(decision.retry_after_secs));
        }

        let job_name = message.content.job_name();
        let payload = OutboundJob {
            tenant_id,
            session_id,
            message_id: MessageId::new(),
            message,
            dedup_key,
        };
        let message_id = payload.message_id;
        let enqueued = serde_json::to_value(&payload)
            .map_err(|e| GatewayError::validation(format!("unserializable message: {e}")))
            .and_then(|value| {
                self.queue
                    .enqueue(OUTBOUND_QUEUE, job_name, tenant_id, value, &self.options)
                    .map_err(GatewayError::from)
            });
        let handle = match enqueued {
            Ok(handle) => handle,
            Err(e) => {
                self.limiter.refund(tenant_id, &payload.session_id);
                return Err(e);
            }
        };
        debug!(
            tenant_id = %tenant_id,
            session_id = %payload.session_id,
            job_id = %handle.id,
            job = job_name,
            "send enqueued"
        );

        Ok(EnqueueReceipt {
            job_id: handle.id,
            message_id,
            queue: handle.queue,
            job_name: handle.name,
            rate_limit_remaining: Some(decision.remaining),
        })
    }

    /// Queue a received message for persistence.
    pub fn enqueue_inbound(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        from: impl Into<String>,
        body: impl Into<String>,
        provider_message_id: Option<String>,
    ) -> GatewayResult<EnqueueReceipt> {
        let mut message = InboundMessage::new(tenant_id, session_id, from, body);
        message.provider_message_id = provider_message_id;
        message.validate()?;

        if !self.sessions.is_registered(tenant_id, &message.session_id) {
            return Err(GatewayError::validation(format!(
                "session {} is not registered for tenant {tenant_id}",
                message.session_id
            )));
        }

        let value = serde_json::to_value(&message)
            .map_err(|e| GatewayError::validation(format!("unserializable message: {e}")))?;
        let handle = self
            .queue
            .enqueue(INBOUND_QUEUE, RECEIVE_JOB, tenant_id, value, &self.options)?;

        Ok(EnqueueReceipt {
            job_id: handle.id,
            message_id: message.id,
            queue: handle.queue,
            job_name: handle.name,
            rate_limit_remaining: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::dedup::DedupConfig;
    use crate::jobs::{
        FailureDisposition, InMemoryJobStore, Job, JobCounts, JobState, JobStore, JobStoreError,
        QueueConfig,
    };
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use uuid::Uuid;
    use crate::rate_limit::RateLimitConfig;
    use crate::sessions::SessionRegistryConfig;
    use crate::store::InMemoryDataStore;
    use crate::transport::LoopbackTransport;
    use courier_events::{InMemoryEventBus, Notification};

    struct Fixture {
        tenant: TenantId,
        queue: Arc<JobQueue>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        dedup: Arc<Deduplicator>,
        producer: Producer,
    }

    /// In-memory job store whose inserts can be made to fail.
    struct RefusingJobStore {
        inner: InMemoryJobStore,
        refuse: AtomicBool,
    }

    impl JobStore for RefusingJobStore {
        fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(JobStoreError::Storage("disk full".to_string()));
            }
            self.inner.insert(job)
        }

        fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id)
        }

        fn claim_next(
            &self,
            queue: &str,
            now: DateTime<Utc>,
            lease: Duration,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim_next(queue, now, lease)
        }

        fn complete(
            &self,
            job_id: JobId,
            lease_token: Uuid,
            return_value: serde_json::Value,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            self.inner.complete(job_id, lease_token, return_value, now)
        }

        fn fail(
            &self,
            job_id: JobId,
            lease_token: Uuid,
            error: String,
            now: DateTime<Utc>,
        ) -> Result<(Job, FailureDisposition), JobStoreError> {
            self.inner.fail(job_id, lease_token, error, now)
        }

        fn fail_terminal(
            &self,
            job_id: JobId,
            lease_token: Uuid,
            error: String,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            self.inner.fail_terminal(job_id, lease_token, error, now)
        }

        fn release(
            &self,
            job_id: JobId,
            lease_token: Uuid,
            delay: Duration,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            self.inner.release(job_id, lease_token, delay, now)
        }

        fn requeue_stalled(
            &self,
            queue: &str,
            now: DateTime<Utc>,
            max_stalled: u32,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.requeue_stalled(queue, now, max_stalled)
        }

        fn list(
            &self,
            queue: &str,
            state: Option<JobState>,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(queue, state, limit)
        }

        fn counts(&self, queue: &str) -> Result<JobCounts, JobStoreError> {
            self.inner.counts(queue)
        }

        fn queue_names(&self) -> Result<Vec<String>, JobStoreError> {
            self.inner.queue_names()
        }

        fn remove(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.remove(job_id)
        }

        fn trim(&self, queue: &str, state: JobState, keep: usize) -> Result<usize, JobStoreError> {
            self.inner.trim(queue, state, keep)
        }

        fn next_scheduled_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, JobStoreError> {
            self.inner.next_scheduled_at(queue)
        }
    }

    async fn fixture(rate_limit: RateLimitConfig) -> Fixture {
        fixture_with(rate_limit, InMemoryJobStore::arc()).await
    }

    async fn fixture_with(rate_limit: RateLimitConfig, jobs: Arc<dyn JobStore>) -> Fixture {
        let store = Arc::new(InMemoryDataStore::new());
        let sessions = Arc::new(SessionRegistry::new(
            SessionRegistryConfig::default(),
            store,
            Arc::new(CircuitBreaker::new("data_store", CircuitBreakerConfig::default())),
            Arc::new(LoopbackTransport::new()),
            Arc::new(InMemoryEventBus::<Notification>::new()),
        ));
        let tenant = TenantId::new();
        sessions
            .register(tenant, sid("main"), serde_json::Value::Null)
            .await
            .unwrap();

        let queue = Arc::new(JobQueue::new(jobs, QueueConfig::default()));
        let limiter = Arc::new(RateLimiter::new(rate_limit));
        let breaker = Arc::new(CircuitBreaker::new("transport", CircuitBreakerConfig::default()));
        let dedup = Arc::new(Deduplicator::new(DedupConfig::default()));
        let producer = Producer::new(
            queue.clone(),
            sessions,
            limiter.clone(),
            breaker.clone(),
            dedup.clone(),
            JobOptions::default(),
        );
        Fixture {
            tenant,
            queue,
            limiter,
            breaker,
            dedup,
            producer,
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn valid_sends_are_queued() {
        let f = fixture(RateLimitConfig::default()).await;
        let receipt = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "hello", None)
            .unwrap();

        assert_eq!(receipt.queue, OUTBOUND_QUEUE);
        assert_eq!(receipt.job_name, "send_text");
        let job = f.queue.get(receipt.job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        let payload: OutboundJob = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.message_id, receipt.message_id);
    }

    #[tokio::test]
    async fn each_content_kind_maps_to_its_job() {
        let f = fixture(RateLimitConfig::default()).await;
        let media = f
            .producer
            .enqueue_send_media(
                f.tenant,
                sid("main"),
                "+15550001",
                MediaSource::Url("https://cdn.example/x.png".to_string()),
                "image/png",
                Some("look".to_string()),
                None,
            )
            .unwrap();
        let location = f
            .producer
            .enqueue_send_location(f.tenant, sid("main"), "+15550001", -23.5, -46.6, None, None)
            .unwrap();
        assert_eq!(media.job_name, "send_media");
        assert_eq!(location.job_name, "send_location");
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_synchronously() {
        let f = fixture(RateLimitConfig::default()).await;
        let err = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "   ", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let err = f
            .producer
            .enqueue_send_location(f.tenant, sid("main"), "+1", 91.0, 0.0, None, None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(f.queue.counts(OUTBOUND_QUEUE).unwrap().total(), 0);
    }

    #[tokio::test]
    async fn unknown_sessions_are_rejected() {
        let f = fixture(RateLimitConfig::default()).await;
        let err = f
            .producer
            .enqueue_send_text(f.tenant, sid("other"), "+15550001", "hello", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let err = f
            .producer
            .enqueue_send_text(TenantId::new(), sid("main"), "+15550001", "hello", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn open_breaker_fails_fast() {
        let f = fixture(RateLimitConfig::default()).await;
        f.breaker.force_open();

        let err = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "hello", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert!(err.retry_after_secs().unwrap() >= 1);
    }

    #[tokio::test]
    async fn processed_keys_are_duplicates() {
        let f = fixture(RateLimitConfig::default()).await;
        let key = f.dedup.compute_key(&sid("main"), "+15550001", "hello");
        f.dedup.mark_processed(&key);

        let err = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "hello", None)
            .unwrap_err();
        assert_eq!(err, GatewayError::Duplicate { key });
    }

    #[tokio::test]
    async fn failed_enqueue_gives_the_budget_back() {
        let jobs = Arc::new(RefusingJobStore {
            inner: InMemoryJobStore::new(),
            refuse: AtomicBool::new(true),
        });
        let f = fixture_with(
            RateLimitConfig {
                per_minute: 1,
                ..RateLimitConfig::default()
            },
            jobs.clone(),
        )
        .await;

        let err = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "hello", None)
            .unwrap_err();
        assert!(!matches!(err, GatewayError::RateLimited { .. }));
        assert_eq!(f.limiter.status(f.tenant, &sid("main")).windows[0].count, 0);

        jobs.refuse.store(false, Ordering::SeqCst);
        let receipt = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "hello", None)
            .unwrap();
        assert_eq!(receipt.rate_limit_remaining, Some(0));
    }

    #[tokio::test]
    async fn rate_limit_applies_after_other_checks() {
        let f = fixture(RateLimitConfig {
            per_minute: 2,
            ..RateLimitConfig::default()
        })
        .await;

        // Rejected requests do not spend budget.
        let _ = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "", None);

        for text in ["one", "two"] {
            f.producer
                .enqueue_send_text(f.tenant, sid("main"), "+15550001", text, None)
                .unwrap();
        }
        let err = f
            .producer
            .enqueue_send_text(f.tenant, sid("main"), "+15550001", "three", None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn inbound_messages_go_to_their_own_queue() {
        let f = fixture(RateLimitConfig::default()).await;
        let receipt = f
            .producer
            .enqueue_inbound(f.tenant, sid("main"), "+15550002", "hi", Some("wamid.9".to_string()))
            .unwrap();
        assert_eq!(receipt.queue, INBOUND_QUEUE);
        assert_eq!(receipt.job_name, RECEIVE_JOB);
        assert_eq!(receipt.rate_limit_remaining, None);
    }
}
