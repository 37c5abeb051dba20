//! Delivery tracking for dispatched messages.
//!
//! Records are created on dispatch (`sent`) and advanced by provider
//! callbacks. Messages whose acks never arrive are checked a bounded number
//! of times, then dropped from active tracking with their last status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use courier_core::{DeliveryStatus, GatewayError, GatewayResult, MessageId, SessionId, TenantId};
use courier_events::{Notification, NotificationKind};

use crate::circuit_breaker::CircuitBreaker;
use crate::jobs::types::to_chrono;
use crate::notify::NotificationSink;
use crate::ports::{ChannelTransport, DataStore};

/// Delivery tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryTrackerConfig {
    /// Status checks per message before it is dropped from tracking.
    pub max_status_checks: u32,
    /// Delay before the first check; doubles for each later one.
    #[serde(with = "crate::config::duration_secs")]
    pub check_base_delay: Duration,
    /// How often due checks are looked for.
    #[serde(with = "crate::config::duration_secs")]
    pub check_interval: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub status_check_timeout: Duration,
}

impl Default for DeliveryTrackerConfig {
    fn default() -> Self {
        Self {
            max_status_checks: 3,
            check_base_delay: Duration::from_secs(30),
            check_interval: Duration::from_secs(15),
            status_check_timeout: Duration::from_secs(10),
        }
    }
}

/// Delivery state of one dispatched message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub provider_message_id: String,
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub recipient: String,
    pub status: DeliveryStatus,
    /// Status checks made so far.
    pub status_checks: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// A freshly sent message.
    pub fn sent(
        provider_message_id: impl Into<String>,
        message_id: MessageId,
        tenant_id: TenantId,
        session_id: SessionId,
        recipient: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            message_id,
            tenant_id,
            session_id,
            recipient: recipient.into(),
            status: DeliveryStatus::Sent,
            status_checks: 0,
            last_attempt_at: Some(now),
            next_check_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of `update_status`.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Applied {
        previous: DeliveryStatus,
        record: DeliveryRecord,
    },
    /// Repeat or regression; nothing changed.
    Ignored { current: DeliveryStatus },
    /// No record for this provider id.
    Unknown,
}

/// Aggregate status counts of every record tracked since start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusCounts {
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
}

impl DeliveryStatusCounts {
    fn slot(&mut self, status: DeliveryStatus) -> &mut u64 {
        match status {
            DeliveryStatus::Sent => &mut self.sent,
            DeliveryStatus::Delivered => &mut self.delivered,
            DeliveryStatus::Read => &mut self.read,
            DeliveryStatus::Failed => &mut self.failed,
        }
    }
}

/// What a status-check pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCheckReport {
    pub checked: usize,
    pub updated: usize,
    pub dropped: usize,
}

/// Tracks delivery status of dispatched messages.
pub struct DeliveryTracker {
    config: DeliveryTrackerConfig,
    active: RwLock<HashMap<String, DeliveryRecord>>,
    counts: Mutex<DeliveryStatusCounts>,
    /// Per provider id; held from the read of the current status until
    /// the new one is applied.
    update_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    store: Arc<dyn DataStore>,
    store_breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn ChannelTransport>,
    notifier: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("config", &self.config)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl DeliveryTracker {
    pub fn new(
        config: DeliveryTrackerConfig,
        store: Arc<dyn DataStore>,
        store_breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn ChannelTransport>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            active: RwLock::new(HashMap::new()),
            counts: Mutex::new(DeliveryStatusCounts::default()),
            update_locks: Mutex::new(HashMap::new()),
            store,
            store_breaker,
            transport,
            notifier,
        }
    }

    fn check_delay(&self, checks_made: u32) -> chrono::Duration {
        let factor = 2u32.saturating_pow(checks_made.min(16));
        to_chrono(self.config.check_base_delay.saturating_mul(factor))
    }

    fn count(&self, previous: Option<DeliveryStatus>, next: DeliveryStatus) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = previous {
            let slot = counts.slot(previous);
            *slot = slot.saturating_sub(1);
        }
        *counts.slot(next) += 1;
    }

    async fn persist(&self, record: &DeliveryRecord) -> GatewayResult<()> {
        self.store_breaker
            .call(|| self.store.save_delivery(record))
            .await
            .map_err(|e| e.into_gateway(GatewayError::from))
    }

    /// Start tracking a dispatched message.
    pub async fn track(&self, mut record: DeliveryRecord) {
        let now = record.updated_at;
        record.next_check_at = Some(now + self.check_delay(record.status_checks));

        if let Err(e) = self.persist(&record).await {
            // The send already happened; keep tracking in memory.
            warn!(
                provider_message_id = %record.provider_message_id,
                error = %e,
                "failed to persist delivery record"
            );
        }

        self.count(None, record.status);
        debug!(
            tenant_id = %record.tenant_id,
            provider_message_id = %record.provider_message_id,
            "tracking delivery"
        );
        self.write_active()
            .insert(record.provider_message_id.clone(), record);
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DeliveryRecord>> {
        self.active.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DeliveryRecord>> {
        self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    fn update_lock(&self, provider_message_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.update_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(provider_message_id.to_string())
            .or_default()
            .clone()
    }

    fn release_update_lock(&self, provider_message_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.update_locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and `lock` itself hold it: nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(provider_message_id);
        }
    }

    /// Apply a status reported by the provider.
    ///
    /// Only forward transitions are applied (`sent → delivered → read`, or
    /// `failed` from a non-terminal state). Terminal statuses leave the
    /// active set. Records no longer in the active set are looked up in the
    /// data store.
    ///
    /// Updates for the same provider id run one at a time, so two callbacks
    /// racing from the same status cannot move it backwards.
    pub async fn update_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> GatewayResult<StatusUpdate> {
        let lock = self.update_lock(provider_message_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_status(provider_message_id, status).await
        };
        self.release_update_lock(provider_message_id, lock);
        result
    }

    async fn apply_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> GatewayResult<StatusUpdate> {
        let tracked = self.read_active().get(provider_message_id).cloned();
        let (current, is_active) = match tracked {
            Some(record) => (record, true),
            None => {
                let loaded = self
                    .store_breaker
                    .call(|| self.store.load_delivery(provider_message_id))
                    .await
                    .map_err(|e| e.into_gateway(GatewayError::from))?;
                match loaded {
                    Some(record) => (record, false),
                    None => return Ok(StatusUpdate::Unknown),
                }
            }
        };

        let previous = current.status;
        if !previous.can_transition_to(status) {
            debug!(
                provider_message_id,
                current = %previous,
                reported = %status,
                "ignoring stale delivery status"
            );
            return Ok(StatusUpdate::Ignored { current: previous });
        }

        let mut record = current;
        record.status = status;
        record.updated_at = Utc::now();
        self.persist(&record).await?;

        if is_active {
            let mut active = self.write_active();
            if status.is_terminal() {
                active.remove(provider_message_id);
            } else {
                active.insert(provider_message_id.to_string(), record.clone());
            }
        }
        self.count(Some(previous), status);

        info!(
            tenant_id = %record.tenant_id,
            provider_message_id,
            previous = %previous,
            status = %status,
            "delivery status updated"
        );
        self.notifier.notify(Notification::new(
            record.tenant_id,
            record.session_id.clone(),
            NotificationKind::DeliveryStatusChanged {
                provider_message_id: provider_message_id.to_string(),
                message_id: Some(record.message_id),
                previous: Some(previous),
                status,
            },
        ));

        Ok(StatusUpdate::Applied { previous, record })
    }

    pub async fn check_pending(&self) -> StatusCheckReport {
        self.check_pending_at(Utc::now()).await
    }

    /// Ask the provider about records whose next check is due. Records that
    /// used up their checks are dropped from tracking; their status stands.
    pub async fn check_pending_at(&self, now: DateTime<Utc>) -> StatusCheckReport {
        let due: Vec<DeliveryRecord> = self
            .read_active()
            .values()
            .filter(|r| r.next_check_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();

        let mut report = StatusCheckReport::default();
        for record in due {
            report.checked += 1;
            let checked = tokio::time::timeout(
                self.config.status_check_timeout,
                self.transport.message_status(
                    record.tenant_id,
                    &record.session_id,
                    &record.provider_message_id,
                ),
            )
            .await;

            let reported = match checked {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    debug!(provider_message_id = %record.provider_message_id, error = %e, "status check failed");
                    None
                }
                Err(_) => {
                    debug!(provider_message_id = %record.provider_message_id, "status check timed out");
                    None
                }
            };

            if let Some(status) = reported.filter(|s| record.status.can_transition_to(*s)) {
                match self.update_status(&record.provider_message_id, status).await {
                    Ok(StatusUpdate::Applied { .. }) => {
                        report.updated += 1;
                        if status.is_terminal() {
                            continue;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(provider_message_id = %record.provider_message_id, error = %e, "failed to apply checked status"),
                }
            }

            let mut active = self.write_active();
            let Some(entry) = active.get_mut(&record.provider_message_id) else {
                continue;
            };
            entry.status_checks += 1;
            entry.last_attempt_at = Some(now);
            if entry.status_checks >= self.config.max_status_checks {
                info!(
                    provider_message_id = %entry.provider_message_id,
                    status = %entry.status,
                    "status checks exhausted, dropping from tracking"
                );
                active.remove(&record.provider_message_id);
                report.dropped += 1;
            } else {
                entry.next_check_at = Some(now + self.check_delay(entry.status_checks));
            }
        }
        report
    }

    pub fn get(&self, provider_message_id: &str) -> Option<DeliveryRecord> {
        self.read_active().get(provider_message_id).cloned()
    }

    /// Records still awaiting a terminal status.
    pub fn pending_count(&self) -> usize {
        self.read_active().len()
    }

    pub fn status_counts(&self) -> DeliveryStatusCounts {
        self.counts
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::ports::DataStoreError;
    use crate::store::InMemoryDataStore;
    use crate::transport::LoopbackTransport;
    use courier_events::{EventBus, InMemoryEventBus};

    struct Fixture {
        tracker: DeliveryTracker,
        store: Arc<InMemoryDataStore>,
        transport: Arc<LoopbackTransport>,
        bus: Arc<InMemoryEventBus<Notification>>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryDataStore::new());
        let transport = Arc::new(LoopbackTransport::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let tracker = DeliveryTracker::new(
            DeliveryTrackerConfig::default(),
            store.clone(),
            Arc::new(CircuitBreaker::new("data_store", CircuitBreakerConfig::default())),
            transport.clone(),
            bus.clone(),
        );
        Fixture {
            tracker,
            store,
            transport,
            bus,
        }
    }

    fn record(id: &str) -> DeliveryRecord {
        DeliveryRecord::sent(
            id,
            MessageId::new(),
            TenantId::new(),
            SessionId::new("main").unwrap(),
            "+15550001",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn forward_transitions_apply_and_notify() {
        let f = fixture();
        let events = f.bus.subscribe();
        f.tracker.track(record("p1")).await;

        let update = f
            .tracker
            .update_status("p1", DeliveryStatus::Delivered)
            .await
            .unwrap();
        assert!(matches!(
            update,
            StatusUpdate::Applied {
                previous: DeliveryStatus::Sent,
                ..
            }
        ));
        assert_eq!(f.tracker.pending_count(), 1);
        assert_eq!(
            f.store.delivery("p1").unwrap().status,
            DeliveryStatus::Delivered
        );

        f.tracker
            .update_status("p1", DeliveryStatus::Read)
            .await
            .unwrap();
        assert_eq!(f.tracker.pending_count(), 0);
        assert_eq!(events.drain().len(), 2);

        let counts = f.tracker.status_counts();
        assert_eq!(counts.read, 1);
        assert_eq!(counts.sent, 0);
    }

    /// Holds `delivered` writes for a while so a later status can overtake.
    struct SlowDeliveredStore {
        inner: InMemoryDataStore,
    }

    #[async_trait::async_trait]
    impl DataStore for SlowDeliveredStore {
        async fn save_session(&self, session: &crate::sessions::Session) -> Result<(), DataStoreError> {
            self.inner.save_session(session).await
        }

        async fn delete_session(
            &self,
            tenant_id: TenantId,
            session_id: &SessionId,
        ) -> Result<(), DataStoreError> {
            self.inner.delete_session(tenant_id, session_id).await
        }

        async fn load_sessions(&self) -> Result<Vec<crate::sessions::Session>, DataStoreError> {
            self.inner.load_sessions().await
        }

        async fn save_delivery(&self, record: &DeliveryRecord) -> Result<(), DataStoreError> {
            if record.status == DeliveryStatus::Delivered {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.save_delivery(record).await
        }

        async fn load_delivery(
            &self,
            provider_message_id: &str,
        ) -> Result<Option<DeliveryRecord>, DataStoreError> {
            self.inner.load_delivery(provider_message_id).await
        }

        async fn save_dead_letter(
            &self,
            entry: &crate::dead_letter::DeadLetterEntry,
        ) -> Result<(), DataStoreError> {
            self.inner.save_dead_letter(entry).await
        }

        async fn load_dead_letters(
            &self,
        ) -> Result<Vec<crate::dead_letter::DeadLetterEntry>, DataStoreError> {
            self.inner.load_dead_letters().await
        }

        async fn delete_dead_letter(&self, entry_id: uuid::Uuid) -> Result<(), DataStoreError> {
            self.inner.delete_dead_letter(entry_id).await
        }

        async fn record_inbound(
            &self,
            message: &courier_core::InboundMessage,
        ) -> Result<(), DataStoreError> {
            self.inner.record_inbound(message).await
        }
    }

    #[tokio::test]
    async fn concurrent_callbacks_never_move_status_backwards() {
        let store = Arc::new(SlowDeliveredStore {
            inner: InMemoryDataStore::new(),
        });
        let tracker = DeliveryTracker::new(
            DeliveryTrackerConfig::default(),
            store.clone(),
            Arc::new(CircuitBreaker::new("data_store", CircuitBreakerConfig::default())),
            Arc::new(LoopbackTransport::new()),
            Arc::new(InMemoryEventBus::new()),
        );
        tracker.track(record("p1")).await;

        let (delivered, read) = tokio::join!(
            tracker.update_status("p1", DeliveryStatus::Delivered),
            tracker.update_status("p1", DeliveryStatus::Read),
        );
        assert!(matches!(delivered.unwrap(), StatusUpdate::Applied { .. }));
        assert!(matches!(read.unwrap(), StatusUpdate::Applied { .. }));

        assert_eq!(
            store.inner.delivery("p1").unwrap().status,
            DeliveryStatus::Read
        );
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(
            tracker.status_counts(),
            DeliveryStatusCounts {
                sent: 0,
                delivered: 0,
                read: 1,
                failed: 0,
            }
        );
        assert!(tracker.update_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn regressions_and_repeats_are_ignored() {
        let f = fixture();
        f.tracker.track(record("p1")).await;
        f.tracker
            .update_status("p1", DeliveryStatus::Delivered)
            .await
            .unwrap();

        for stale in [DeliveryStatus::Sent, DeliveryStatus::Delivered] {
            let update = f.tracker.update_status("p1", stale).await.unwrap();
            assert_eq!(
                update,
                StatusUpdate::Ignored {
                    current: DeliveryStatus::Delivered
                }
            );
        }
    }

    #[tokio::test]
    async fn failed_is_terminal() {
        let f = fixture();
        f.tracker.track(record("p1")).await;
        f.tracker
            .update_status("p1", DeliveryStatus::Failed)
            .await
            .unwrap();
        assert_eq!(f.tracker.pending_count(), 0);

        let update = f
            .tracker
            .update_status("p1", DeliveryStatus::Read)
            .await
            .unwrap();
        assert!(matches!(update, StatusUpdate::Ignored { .. }));
    }

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let f = fixture();
        assert_eq!(
            f.tracker
                .update_status("nope", DeliveryStatus::Read)
                .await
                .unwrap(),
            StatusUpdate::Unknown
        );
    }

    #[tokio::test]
    async fn status_checks_are_bounded_and_spaced() {
        let f = fixture();
        let r = record("p1");
        let start = r.created_at;
        f.tracker.track(r).await;

        // First check is due after the base delay.
        assert_eq!(f.tracker.check_pending_at(start).await.checked, 0);
        let first = f
            .tracker
            .check_pending_at(start + chrono::Duration::seconds(30))
            .await;
        assert_eq!(first.checked, 1);
        assert_eq!(f.tracker.get("p1").unwrap().status_checks, 1);

        // Second check 60s after the first.
        let t1 = start + chrono::Duration::seconds(30);
        assert_eq!(
            f.tracker
                .check_pending_at(t1 + chrono::Duration::seconds(59))
                .await
                .checked,
            0
        );
        let t2 = t1 + chrono::Duration::seconds(60);
        f.tracker.check_pending_at(t2).await;

        let third = f
            .tracker
            .check_pending_at(t2 + chrono::Duration::seconds(120))
            .await;
        assert_eq!(third.dropped, 1);
        assert_eq!(f.tracker.pending_count(), 0);
        // Last status stands in the store.
        assert_eq!(f.store.delivery("p1").unwrap().status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn checked_statuses_are_applied() {
        let f = fixture();
        let r = record("p1");
        let start = r.created_at;
        f.tracker.track(r).await;
        f.transport.set_status("p1", DeliveryStatus::Read);

        let report = f
            .tracker
            .check_pending_at(start + chrono::Duration::seconds(30))
            .await;
        assert_eq!(report.updated, 1);
        assert_eq!(f.tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_callbacks_update_dropped_records_from_the_store() {
        let f = fixture();
        let r = record("p1");
        let start = r.created_at;
        f.tracker.track(r).await;
        for secs in [30, 90, 210] {
            f.tracker
                .check_pending_at(start + chrono::Duration::seconds(secs))
                .await;
        }
        assert_eq!(f.tracker.pending_count(), 0);

        let update = f
            .tracker
            .update_status("p1", DeliveryStatus::Delivered)
            .await
            .unwrap();
        assert!(matches!(update, StatusUpdate::Applied { .. }));
        assert_eq!(f.tracker.pending_count(), 0);
        assert_eq!(
            f.store.delivery("p1").unwrap().status,
            DeliveryStatus::Delivered
        );
    }
}
