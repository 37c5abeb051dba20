//! Data store port: durable state shared with the rest of the system.

use async_trait::async_trait;
use uuid::Uuid;

use courier_core::{GatewayError, InboundMessage, SessionId, TenantId};

use crate::dead_letter::DeadLetterEntry;
use crate::delivery::DeliveryRecord;
use crate::sessions::Session;

/// Data store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataStoreError {
    #[error("data store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<DataStoreError> for GatewayError {
    fn from(err: DataStoreError) -> Self {
        GatewayError::store(err.to_string())
    }
}

impl From<serde_json::Error> for DataStoreError {
    fn from(err: serde_json::Error) -> Self {
        DataStoreError::Serialization(err.to_string())
    }
}

/// Durable storage for sessions, delivery records, the dead-letter audit
/// trail and inbound messages.
///
/// Every write is an upsert keyed by the record's natural id, so replays
/// of the same write are harmless.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn save_session(&self, session: &Session) -> Result<(), DataStoreError>;

    async fn delete_session(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
    ) -> Result<(), DataStoreError>;

    async fn load_sessions(&self) -> Result<Vec<Session>, DataStoreError>;

    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<(), DataStoreError>;

    async fn load_delivery(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, DataStoreError>;

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DataStoreError>;

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, DataStoreError>;

    async fn delete_dead_letter(&self, entry_id: Uuid) -> Result<(), DataStoreError>;

    async fn record_inbound(&self, message: &InboundMessage) -> Result<(), DataStoreError>;
}
