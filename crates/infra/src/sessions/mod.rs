//! Multi-tenant session bookkeeping and load balancing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{SessionId, TenantId};

pub mod registry;

pub use registry::{HealthSweepReport, SessionRegistry};

/// Connection status of a channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Inactive,
    Connecting,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "inactive" => Some(SessionStatus::Inactive),
            "connecting" => Some(SessionStatus::Connecting),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }

    /// Whether messages may be sent through a session in this status.
    /// Inactive sessions are idle, not broken.
    pub fn can_send(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Inactive)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session just did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// An outbound message was sent.
    Message,
    /// A send through the session failed.
    Error,
    /// A message was received.
    Inbound,
}

/// One channel session owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub last_activity: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    /// Set when the error count crossed the threshold; for operators only.
    pub flagged: bool,
    /// Registration order, tie-breaker for load balancing.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Session {
    pub fn new(
        tenant_id: TenantId,
        session_id: SessionId,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            session_id,
            status: SessionStatus::Active,
            message_count: 0,
            error_count: 0,
            last_activity: now,
            registered_at: now,
            metadata,
            flagged: false,
            seq: 0,
        }
    }
}

/// Session registry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRegistryConfig {
    #[serde(with = "crate::config::duration_secs")]
    pub health_interval: Duration,
    /// Idle time after which an active session is demoted to inactive.
    #[serde(with = "crate::config::duration_secs")]
    pub inactivity_threshold: Duration,
    /// Error count above which a session is flagged.
    pub error_threshold: u64,
    /// Idle time after which a session that is not active is removed.
    #[serde(with = "crate::config::duration_secs")]
    pub eviction_after: Duration,
    /// Health-check active sessions through the transport during sweeps.
    pub check_transport: bool,
    #[serde(with = "crate::config::duration_secs")]
    pub health_check_timeout: Duration,
}

impl Default for SessionRegistryConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(5 * 60),
            error_threshold: 10,
            eviction_after: Duration::from_secs(24 * 60 * 60),
            check_transport: true,
            health_check_timeout: Duration::from_secs(10),
        }
    }
}
