//! Job handlers that talk to the channel: outbound sends and inbound
//! persistence.
//!
//! ## Outbound flow
//!
//! 1. decode the `OutboundJob` payload (undecodable payloads fail for good)
//! 2. skip sends whose dedup key was already processed
//! 3. resolve the session: the requested one if it can send, otherwise the
//!    tenant's least-loaded active session
//! 4. charge a fallback session's rate window; the requested session was
//!    already charged when the job was enqueued
//! 5. send through the transport breaker
//! 6. on success: mark the dedup key, count session activity, start
//!    delivery tracking
//!
//! An open breaker, or a fallback session out of budget, releases the job
//! without spending an attempt. Provider rejections are permanent and skip
//! the remaining attempts; every other failure is retried with backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use courier_core::{InboundMessage, MessageId, OutboundMessage, SessionId, TenantId};
use courier_events::{Notification, NotificationKind};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::dedup::Deduplicator;
use crate::delivery::{DeliveryRecord, DeliveryTracker};
use crate::jobs::{Job, JobHandler, JobOutcome};
use crate::notify::NotificationSink;
use crate::ports::{ChannelTransport, DataStore, TransportError};
use crate::rate_limit::RateLimiter;
use crate::sessions::{ActivityKind, Session, SessionRegistry};

/// Queue carrying outbound sends.
pub const OUTBOUND_QUEUE: &str = "outbound-messages";
/// Queue carrying received messages.
pub const INBOUND_QUEUE: &str = "inbound-messages";
/// Job name of inbound persistence jobs.
pub const RECEIVE_JOB: &str = "receive_message";

/// Payload of an outbound send job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundJob {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub message: OutboundMessage,
    pub dedup_key: String,
}

/// Handles `send_text`, `send_media` and `send_location` jobs.
pub struct OutboundDispatcher {
    sessions: Arc<SessionRegistry>,
    dedup: Arc<Deduplicator>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn ChannelTransport>,
    delivery: Arc<DeliveryTracker>,
}

impl OutboundDispatcher {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        dedup: Arc<Deduplicator>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn ChannelTransport>,
        delivery: Arc<DeliveryTracker>,
    ) -> Self {
        Self {
            sessions,
            dedup,
            limiter,
            breaker,
            transport,
            delivery,
        }
    }

    fn resolve_session(&self, tenant_id: TenantId, requested: &SessionId) -> Option<Session> {
        if let Some(session) = self
            .sessions
            .get(tenant_id, requested)
            .filter(|s| s.status.can_send())
        {
            return Some(session);
        }
        let fallback = self.sessions.get_best_session(tenant_id)?;
        debug!(
            tenant_id = %tenant_id,
            requested = %requested,
            session_id = %fallback.session_id,
            "requested session unusable, falling back"
        );
        Some(fallback)
    }

    /// Send through the breaker. Provider rejections come back as `Ok(Err)`
    /// so they do not count against the transport's health.
    async fn send(
        &self,
        payload: &OutboundJob,
        session_id: &SessionId,
    ) -> Result<Result<String, TransportError>, CircuitBreakerError<TransportError>> {
        self.breaker
            .call(|| async {
                match self
                    .transport
                    .send(
                        payload.tenant_id,
                        session_id,
                        &payload.message.to,
                        &payload.message.content,
                    )
                    .await
                {
                    Ok(id) => Ok(Ok(id)),
                    Err(e) if e.is_permanent() => Ok(Err(e)),
                    Err(e) => Err(e),
                }
            })
            .await
    }
}

#[async_trait]
impl JobHandler for OutboundDispatcher {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let payload: OutboundJob = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return JobOutcome::Terminal(format!("invalid outbound payload: {e}")),
        };

        if self.dedup.is_duplicate(&payload.dedup_key) {
            info!(
                job_id = %job.id,
                tenant_id = %payload.tenant_id,
                dedup_key = %payload.dedup_key,
                "duplicate send skipped"
            );
            return JobOutcome::Completed(json!({ "duplicate": true }));
        }

        let Some(session) = self.resolve_session(payload.tenant_id, &payload.session_id) else {
            return JobOutcome::Failed(format!(
                "no usable session for tenant {}",
                payload.tenant_id
            ));
        };
        let session_id = session.session_id;

        if session_id != payload.session_id {
            let decision = self.limiter.check_and_increment(payload.tenant_id, &session_id);
            if !decision.allowed {
                debug!(
                    job_id = %job.id,
                    tenant_id = %payload.tenant_id,
                    session_id = %session_id,
                    retry_after_secs = decision.retry_after_secs,
                    "fallback session rate limited"
                );
                return JobOutcome::Release {
                    delay: Duration::from_secs(decision.retry_after_secs.max(1)),
                    reason: format!("fallback session {session_id} rate limited"),
                };
            }
        }

        match self.send(&payload, &session_id).await {
            Ok(Ok(provider_message_id)) => {
                self.dedup.mark_processed(&payload.dedup_key);
                self.sessions
                    .record_activity(payload.tenant_id, &session_id, ActivityKind::Message)
                    .await;
                self.delivery
                    .track(DeliveryRecord::sent(
                        provider_message_id.clone(),
                        payload.message_id,
                        payload.tenant_id,
                        session_id.clone(),
                        payload.message.to.clone(),
                        Utc::now(),
                    ))
                    .await;

                debug!(
                    job_id = %job.id,
                    tenant_id = %payload.tenant_id,
                    session_id = %session_id,
                    provider_message_id = %provider_message_id,
                    "message sent"
                );
                JobOutcome::Completed(json!({
                    "provider_message_id": provider_message_id,
                    "message_id": payload.message_id,
                    "session_id": session_id,
                }))
            }
            Ok(Err(rejected)) => {
                warn!(
                    job_id = %job.id,
                    tenant_id = %payload.tenant_id,
                    error = %rejected,
                    "message rejected by provider"
                );
                JobOutcome::Terminal(rejected.to_string())
            }
            Err(CircuitBreakerError::Open { retry_after, .. }) => JobOutcome::Release {
                delay: retry_after,
                reason: "transport circuit open".to_string(),
            },
            Err(e) => {
                self.sessions
                    .record_activity(payload.tenant_id, &session_id, ActivityKind::Error)
                    .await;
                JobOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Handles `receive_message` jobs: persists the message, counts session
/// activity and notifies subscribers.
pub struct InboundReceiver {
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn DataStore>,
    store_breaker: Arc<CircuitBreaker>,
    notifier: Arc<dyn NotificationSink>,
}

impl InboundReceiver {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn DataStore>,
        store_breaker: Arc<CircuitBreaker>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            sessions,
            store,
            store_breaker,
            notifier,
        }
    }
}

#[async_trait]
impl JobHandler for InboundReceiver {
    async fn handle(&self, job: &Job) -> JobOutcome {
        let message: InboundMessage = match serde_json::from_value(job.payload.clone()) {
            Ok(message) => message,
            Err(e) => return JobOutcome::Terminal(format!("invalid inbound payload: {e}")),
        };

        match self
            .store_breaker
            .call(|| self.store.record_inbound(&message))
            .await
        {
            Ok(()) => {}
            Err(CircuitBreakerError::Open { retry_after, .. }) => {
                return JobOutcome::Release {
                    delay: retry_after,
                    reason: "data store circuit open".to_string(),
                };
            }
            Err(e) => return JobOutcome::Failed(e.to_string()),
        }

        self.sessions
            .record_activity(message.tenant_id, &message.session_id, ActivityKind::Inbound)
            .await;
        self.notifier.notify(Notification::new(
            message.tenant_id,
            message.session_id.clone(),
            NotificationKind::InboundMessage {
                from: message.from.clone(),
                body: message.body.clone(),
                provider_message_id: message.provider_message_id.clone(),
            },
        ));

        debug!(job_id = %job.id, tenant_id = %message.tenant_id, message_id = %message.id, "inbound message stored");
        JobOutcome::Completed(json!({ "message_id": message.id }))
    }
}
