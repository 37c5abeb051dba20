use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use courier_core::{InboundMessage, SessionId, TenantId};

use crate::dead_letter::DeadLetterEntry;
use crate::delivery::DeliveryRecord;
use crate::ports::{DataStore, DataStoreError};
use crate::sessions::Session;

/// In-memory data store.
///
/// Intended for tests/dev. Writes can be made to fail to exercise the
/// degraded paths of the components that persist through it.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    sessions: RwLock<HashMap<(TenantId, SessionId), Session>>,
    deliveries: RwLock<HashMap<String, DeliveryRecord>>,
    dead_letters: RwLock<HashMap<Uuid, DeadLetterEntry>>,
    inbound: RwLock<Vec<InboundMessage>>,
    fail_writes: AtomicBool,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `Unavailable` until switched back.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), DataStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DataStoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    pub fn sessions(&self) -> Vec<Session> {
        read(&self.sessions).values().cloned().collect()
    }

    pub fn delivery(&self, provider_message_id: &str) -> Option<DeliveryRecord> {
        read(&self.deliveries).get(provider_message_id).cloned()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        read(&self.dead_letters).values().cloned().collect()
    }

    pub fn inbound(&self) -> Vec<InboundMessage> {
        self.inbound
            .read()
            .map(|v| v.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

fn read<K, V>(lock: &RwLock<HashMap<K, V>>) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn poisoned(_: impl std::fmt::Display) -> DataStoreError {
    DataStoreError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn save_session(&self, session: &Session) -> Result<(), DataStoreError> {
        self.check_writable()?;
        self.sessions
            .write()
            .map_err(poisoned)?
            .insert((session.tenant_id, session.session_id.clone()), session.clone());
        Ok(())
    }

    async fn delete_session(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
    ) -> Result<(), DataStoreError> {
        self.check_writable()?;
        self.sessions
            .write()
            .map_err(poisoned)?
            .remove(&(tenant_id, session_id.clone()));
        Ok(())
    }

    async fn load_sessions(&self) -> Result<Vec<Session>, DataStoreError> {
        Ok(self.sessions())
    }

    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<(), DataStoreError> {
        self.check_writable()?;
        self.deliveries
            .write()
            .map_err(poisoned)?
            .insert(record.provider_message_id.clone(), record.clone());
        Ok(())
    }

    async fn load_delivery(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, DataStoreError> {
        Ok(self.delivery(provider_message_id))
    }

    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DataStoreError> {
        self.check_writable()?;
        self.dead_letters
            .write()
            .map_err(poisoned)?
            .insert(entry.id, entry.clone());
        Ok(())
    }

    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, DataStoreError> {
        Ok(self.dead_letters())
    }

    async fn delete_dead_letter(&self, entry_id: Uuid) -> Result<(), DataStoreError> {
        self.check_writable()?;
        self.dead_letters.write().map_err(poisoned)?.remove(&entry_id);
        Ok(())
    }

    async fn record_inbound(&self, message: &InboundMessage) -> Result<(), DataStoreError> {
        self.check_writable()?;
        self.inbound.write().map_err(poisoned)?.push(message.clone());
        Ok(())
    }
}
