//! Channel transport port: the messaging provider behind the gateway.

use async_trait::async_trait;

use courier_core::{DeliveryStatus, GatewayError, MessageContent, SessionId, TenantId};

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Provider unreachable or returned a server-side error.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport call timed out")]
    Timeout,

    /// The provider refused this message; retrying will not help.
    #[error("message rejected by provider: {0}")]
    Rejected(String),

    #[error("session {0} is not connected")]
    SessionNotConnected(SessionId),
}

impl TransportError {
    /// Permanent failures are never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Rejected(_))
    }
}

impl From<TransportError> for GatewayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(reason) => GatewayError::validation(reason),
            other => GatewayError::transient(other.to_string()),
        }
    }
}

/// Channel transport abstraction.
///
/// Implementations talk to one messaging provider. Calls may block on
/// network I/O; callers wrap them in a circuit breaker with a timeout.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Send `content` to `recipient` through `session`. Returns the
    /// provider's message id.
    async fn send(
        &self,
        tenant_id: TenantId,
        session: &SessionId,
        recipient: &str,
        content: &MessageContent,
    ) -> Result<String, TransportError>;

    /// Ask the provider for the delivery status of a sent message.
    /// `Ok(None)` means the provider has nothing new (or cannot be asked).
    async fn message_status(
        &self,
        _tenant_id: TenantId,
        _session: &SessionId,
        _provider_message_id: &str,
    ) -> Result<Option<DeliveryStatus>, TransportError> {
        Ok(None)
    }

    /// Check the connection behind `session`.
    async fn health_check(
        &self,
        _tenant_id: TenantId,
        _session: &SessionId,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}
