//! Notifications pushed towards the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::{DeliveryStatus, MessageId, SessionId, TenantId};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NotificationKind {
    /// A tracked message moved to a new delivery status.
    DeliveryStatusChanged {
        provider_message_id: String,
        message_id: Option<MessageId>,
        previous: Option<DeliveryStatus>,
        status: DeliveryStatus,
    },
    /// An inbound message was accepted from the channel.
    InboundMessage {
        from: String,
        body: String,
        provider_message_id: Option<String>,
    },
    /// The session registry changed a session's status.
    SessionStatusChanged {
        status: String,
        reason: Option<String>,
    },
}

/// Tenant-scoped notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(tenant_id: TenantId, session_id: SessionId, kind: NotificationKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            tenant_id,
            session_id,
            occurred_at: Utc::now(),
            kind,
        }
    }

    /// Topic name used by pub/sub transports and SSE event names.
    pub fn topic(&self) -> &'static str {
        match self.kind {
            NotificationKind::DeliveryStatusChanged { .. } => "message.status",
            NotificationKind::InboundMessage { .. } => "message.inbound",
            NotificationKind::SessionStatusChanged { .. } => "session.status",
        }
    }
}
