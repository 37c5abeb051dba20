//! In-process transport.
//!
//! Accepts every send (unless told to fail), hands back `loop-<uuid>`
//! provider ids and answers status queries from a table the caller fills.
//! Used by the dev server and by tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_core::{DeliveryStatus, MessageContent, SessionId, TenantId};

use crate::ports::{ChannelTransport, TransportError};

/// A message the loopback transport accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub provider_message_id: String,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub recipient: String,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum FailureMode {
    None,
    Next { remaining: u32, error: TransportError },
    Always(TransportError),
}

/// In-process `ChannelTransport` with failure injection.
#[derive(Debug)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<FailureMode>,
    statuses: Mutex<HashMap<String, DeliveryStatus>>,
    healthy: AtomicBool,
    latency_ms: AtomicU64,
    attempts: AtomicU64,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(FailureMode::None),
            statuses: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_failures(&self, mode: FailureMode) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// Fail the next `count` sends with `error`.
    pub fn fail_next(&self, count: u32, error: TransportError) {
        self.set_failures(FailureMode::Next {
            remaining: count,
            error,
        });
    }

    /// Fail every send with `error` until `recover` is called.
    pub fn fail_always(&self, error: TransportError) {
        self.set_failures(FailureMode::Always(error));
    }

    pub fn recover(&self) {
        self.set_failures(FailureMode::None);
    }

    /// Answer for health checks.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Delay every send by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Status reported by `message_status` for `provider_message_id`.
    pub fn set_status(&self, provider_message_id: &str, status: DeliveryStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(provider_message_id.to_string(), status);
    }

    /// Accepted messages, oldest first.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every call to `send`, failed ones included.
    pub fn send_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<TransportError> {
        let mut mode = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *mode {
            FailureMode::None => None,
            FailureMode::Always(error) => Some(error.clone()),
            FailureMode::Next { remaining, error } => {
                let error = error.clone();
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    *mode = FailureMode::None;
                }
                Some(error)
            }
        }
    }
}

#[async_trait]
impl ChannelTransport for LoopbackTransport {
    async fn send(
        &self,
        tenant_id: TenantId,
        session: &SessionId,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<String, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if let Some(error) = self.next_failure() {
            return Err(error);
        }

        let provider_message_id = format!("loop-{}", Uuid::now_v7());
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMessage {
                provider_message_id: provider_message_id.clone(),
                tenant_id,
                session_id: session.clone(),
                recipient: recipient.to_string(),
                content: content.clone(),
                sent_at: Utc::now(),
            });
        Ok(provider_message_id)
    }

    async fn message_status(
        &self,
        _tenant_id: TenantId,
        _session: &SessionId,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryStatus>, TransportError> {
        Ok(self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider_message_id)
            .copied())
    }

    async fn health_check(
        &self,
        _tenant_id: TenantId,
        session: &SessionId,
    ) -> Result<(), TransportError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::SessionNotConnected(session.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text() -> MessageContent {
        MessageContent::Text {
            text: "hi".to_string(),
            quoted_id: None,
        }
    }

    #[tokio::test]
    async fn records_sends_and_returns_ids() {
        let transport = LoopbackTransport::new();
        let session = SessionId::new("main").unwrap();

        let id = transport
            .send(TenantId::new(), &session, "+15550001", &text())
            .await
            .unwrap();

        assert!(id.starts_with("loop-"));
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].provider_message_id, id);
        assert_eq!(sent[0].recipient, "+15550001");
    }

    #[tokio::test]
    async fn fail_next_is_bounded() {
        let transport = LoopbackTransport::new();
        let session = SessionId::new("main").unwrap();
        transport.fail_next(2, TransportError::Timeout);

        for _ in 0..2 {
            let err = transport
                .send(TenantId::new(), &session, "+1", &text())
                .await
                .unwrap_err();
            assert_eq!(err, TransportError::Timeout);
        }
        assert!(
            transport
                .send(TenantId::new(), &session, "+1", &text())
                .await
                .is_ok()
        );
        assert_eq!(transport.send_attempts(), 3);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn health_and_status_answers_are_configurable() {
        let transport = LoopbackTransport::new();
        let tenant = TenantId::new();
        let session = SessionId::new("main").unwrap();

        assert!(transport.health_check(tenant, &session).await.is_ok());
        transport.set_healthy(false);
        assert!(transport.health_check(tenant, &session).await.is_err());

        assert_eq!(transport.message_status(tenant, &session, "x").await.unwrap(), None);
        transport.set_status("x", DeliveryStatus::Read);
        assert_eq!(
            transport.message_status(tenant, &session, "x").await.unwrap(),
            Some(DeliveryStatus::Read)
        );
    }
}
