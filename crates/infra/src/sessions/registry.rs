//! Session registry: registration, activity, load balancing, health sweeps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use courier_core::{GatewayError, GatewayResult, SessionId, TenantId};
use courier_events::{Notification, NotificationKind};

use crate::circuit_breaker::CircuitBreaker;
use crate::jobs::types::to_chrono;
use crate::notify::NotificationSink;
use crate::ports::{ChannelTransport, DataStore, DataStoreError};

use super::{ActivityKind, Session, SessionRegistryConfig, SessionStatus};

type SessionKey = (TenantId, SessionId);

/// What a health sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSweepReport {
    pub demoted: usize,
    pub flagged: usize,
    pub evicted: usize,
    pub health_check_failures: usize,
}

/// Registry of channel sessions across tenants.
///
/// The in-memory map is the working copy; every status change is written
/// through to the data store (guarded by the data store breaker). Store
/// writes happen after the map lock is released.
pub struct SessionRegistry {
    config: SessionRegistryConfig,
    sessions: RwLock<HashMap<SessionKey, Session>>,
    seq: AtomicU64,
    store: Arc<dyn DataStore>,
    store_breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn ChannelTransport>,
    notifier: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(
        config: SessionRegistryConfig,
        store: Arc<dyn DataStore>,
        store_breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn ChannelTransport>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            store,
            store_breaker,
            transport,
            notifier,
        }
    }

    pub fn config(&self) -> &SessionRegistryConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionKey, Session>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionKey, Session>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn save(&self, session: &Session) -> Result<(), GatewayError> {
        self.store_breaker
            .call(|| self.store.save_session(session))
            .await
            .map_err(|e| e.into_gateway(GatewayError::from))
    }

    /// Best-effort write-through for hot paths and sweeps.
    async fn save_logged(&self, session: &Session) {
        if let Err(e) = self.save(session).await {
            warn!(
                tenant_id = %session.tenant_id,
                session_id = %session.session_id,
                error = %e,
                "failed to persist session"
            );
        }
    }

    /// Register (or re-register) a session. New sessions start `active`;
    /// re-registration keeps counters, replaces metadata and reactivates.
    pub async fn register(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        metadata: serde_json::Value,
    ) -> GatewayResult<Session> {
        let now = Utc::now();
        let mut session = self
            .get(tenant_id, &session_id)
            .unwrap_or_else(|| {
                let mut s = Session::new(tenant_id, session_id.clone(), serde_json::Value::Null, now);
                s.seq = self.seq.fetch_add(1, Ordering::Relaxed);
                s
            });
        session.metadata = metadata;
        session.status = SessionStatus::Active;
        session.last_activity = now;

        self.save(&session).await?;
        self.write()
            .insert((tenant_id, session_id.clone()), session.clone());

        info!(tenant_id = %tenant_id, session_id = %session_id, "session registered");
        Ok(session)
    }

    /// Remove a session. Returns whether it was registered.
    pub async fn unregister(&self, tenant_id: TenantId, session_id: &SessionId) -> GatewayResult<bool> {
        self.store_breaker
            .call(|| self.store.delete_session(tenant_id, session_id))
            .await
            .map_err(|e| e.into_gateway(GatewayError::from))?;

        let removed = self.write().remove(&(tenant_id, session_id.clone())).is_some();
        if removed {
            info!(tenant_id = %tenant_id, session_id = %session_id, "session unregistered");
        }
        Ok(removed)
    }

    pub fn get(&self, tenant_id: TenantId, session_id: &SessionId) -> Option<Session> {
        self.read().get(&(tenant_id, session_id.clone())).cloned()
    }

    pub fn is_registered(&self, tenant_id: TenantId, session_id: &SessionId) -> bool {
        self.read().contains_key(&(tenant_id, session_id.clone()))
    }

    /// Every session of a tenant, in registration order.
    pub fn list(&self, tenant_id: TenantId) -> Vec<Session> {
        let mut sessions: Vec<_> = self
            .read()
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| (s.registered_at, s.seq));
        sessions
    }

    pub fn list_all(&self) -> Vec<Session> {
        let mut sessions: Vec<_> = self.read().values().cloned().collect();
        sessions.sort_by_key(|s| (s.registered_at, s.seq));
        sessions
    }

    pub fn get_active_sessions(&self, tenant_id: TenantId) -> Vec<Session> {
        self.list(tenant_id)
            .into_iter()
            .filter(|s| s.status == SessionStatus::Active)
            .collect()
    }

    /// The active session with the fewest messages; ties go to the earliest
    /// registration.
    pub fn get_best_session(&self, tenant_id: TenantId) -> Option<Session> {
        self.read()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.status == SessionStatus::Active)
            .min_by_key(|s| (s.message_count, s.registered_at, s.seq))
            .cloned()
    }

    /// Record what a session did. Returns the updated session, or None if
    /// it is not registered.
    pub async fn record_activity(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
        kind: ActivityKind,
    ) -> Option<Session> {
        let now = Utc::now();
        let (updated, reactivated) = {
            let mut sessions = self.write();
            let session = sessions.get_mut(&(tenant_id, session_id.clone()))?;
            let mut reactivated = false;
            match kind {
                ActivityKind::Message | ActivityKind::Inbound => {
                    if kind == ActivityKind::Message {
                        session.message_count += 1;
                    }
                    session.last_activity = now;
                    if session.status == SessionStatus::Inactive {
                        session.status = SessionStatus::Active;
                        reactivated = true;
                    }
                }
                ActivityKind::Error => session.error_count += 1,
            }
            (session.clone(), reactivated)
        };

        if reactivated {
            self.announce(&updated, Some("activity"));
        }
        self.save_logged(&updated).await;
        Some(updated)
    }

    /// Set a session's status (connection lifecycle events, operators).
    pub async fn set_status(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> GatewayResult<Session> {
        let updated = {
            let mut sessions = self.write();
            let session = sessions
                .get_mut(&(tenant_id, session_id.clone()))
                .ok_or_else(|| GatewayError::validation(format!("unknown session: {session_id}")))?;
            if session.status == status {
                return Ok(session.clone());
            }
            session.status = status;
            if status == SessionStatus::Active {
                session.last_activity = Utc::now();
            }
            session.clone()
        };

        self.announce(&updated, reason);
        self.save(&updated).await?;
        Ok(updated)
    }

    fn announce(&self, session: &Session, reason: Option<&str>) {
        debug!(
            tenant_id = %session.tenant_id,
            session_id = %session.session_id,
            status = %session.status,
            "session status changed"
        );
        self.notifier.notify(Notification::new(
            session.tenant_id,
            session.session_id.clone(),
            NotificationKind::SessionStatusChanged {
                status: session.status.as_str().to_string(),
                reason: reason.map(str::to_string),
            },
        ));
    }

    pub async fn health_sweep(&self) -> HealthSweepReport {
        self.health_sweep_at(Utc::now()).await
    }

    /// Demote idle sessions, flag error-prone ones, evict long-dead ones and
    /// health-check the rest through the transport.
    pub async fn health_sweep_at(&self, now: DateTime<Utc>) -> HealthSweepReport {
        let inactivity = to_chrono(self.config.inactivity_threshold);
        let eviction = to_chrono(self.config.eviction_after);
        let mut report = HealthSweepReport::default();

        let (demoted, flagged, evicted) = {
            let mut sessions = self.write();
            let mut demoted = Vec::new();
            let mut flagged = Vec::new();

            let evicted: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, s)| s.status != SessionStatus::Active && now - s.last_activity > eviction)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &evicted {
                sessions.remove(key);
            }

            for session in sessions.values_mut() {
                let newly_flagged =
                    session.error_count > self.config.error_threshold && !session.flagged;
                if newly_flagged {
                    session.flagged = true;
                }
                if session.status == SessionStatus::Active && now - session.last_activity > inactivity {
                    session.status = SessionStatus::Inactive;
                    demoted.push(session.clone());
                } else if newly_flagged {
                    flagged.push(session.clone());
                }
            }
            (demoted, flagged, evicted)
        };

        report.demoted = demoted.len();
        report.flagged = flagged.len() + demoted.iter().filter(|s| s.flagged).count();
        report.evicted = evicted.len();

        for session in &demoted {
            self.announce(session, Some("inactivity"));
            self.save_logged(session).await;
        }
        for session in &flagged {
            warn!(
                tenant_id = %session.tenant_id,
                session_id = %session.session_id,
                error_count = session.error_count,
                "session flagged for errors"
            );
            self.save_logged(session).await;
        }
        for (tenant_id, session_id) in &evicted {
            info!(tenant_id = %tenant_id, session_id = %session_id, "idle session evicted");
            if let Err(e) = self
                .store_breaker
                .call(|| self.store.delete_session(*tenant_id, session_id))
                .await
            {
                warn!(tenant_id = %tenant_id, session_id = %session_id, error = %e, "failed to delete evicted session");
            }
        }

        if self.config.check_transport {
            report.health_check_failures = self.check_active().await;
        }

        if report != HealthSweepReport::default() {
            debug!(
                demoted = report.demoted,
                flagged = report.flagged,
                evicted = report.evicted,
                health_check_failures = report.health_check_failures,
                "session health sweep"
            );
        }
        report
    }

    async fn check_active(&self) -> usize {
        let active: Vec<_> = self
            .read()
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .map(|s| (s.tenant_id, s.session_id.clone()))
            .collect();

        let mut failures = 0;
        for (tenant_id, session_id) in active {
            let checked = tokio::time::timeout(
                self.config.health_check_timeout,
                self.transport.health_check(tenant_id, &session_id),
            )
            .await;
            let reason = match checked {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "health check timed out".to_string(),
            };
            failures += 1;
            warn!(tenant_id = %tenant_id, session_id = %session_id, reason = %reason, "session health check failed");
            if let Err(e) = self
                .set_status(tenant_id, &session_id, SessionStatus::Error, Some(&reason))
                .await
            {
                warn!(tenant_id = %tenant_id, session_id = %session_id, error = %e, "failed to mark session error");
            }
        }
        failures
    }

    /// Load persisted sessions into the registry. Returns how many were loaded.
    pub async fn load_from_store(&self) -> Result<usize, DataStoreError> {
        let mut loaded = self.store.load_sessions().await?;
        loaded.sort_by_key(|s| s.registered_at);

        let mut sessions = self.write();
        for mut session in loaded.iter().cloned() {
            session.seq = self.seq.fetch_add(1, Ordering::Relaxed);
            sessions.insert((session.tenant_id, session.session_id.clone()), session);
        }
        Ok(loaded.len())
    }

    /// Session counts by status.
    pub fn status_counts(&self) -> HashMap<SessionStatus, usize> {
        let mut counts = HashMap::new();
        for session in self.read().values() {
            *counts.entry(session.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::store::InMemoryDataStore;
    use crate::transport::LoopbackTransport;
    use courier_events::{EventBus, InMemoryEventBus};

    struct Fixture {
        registry: SessionRegistry,
        store: Arc<InMemoryDataStore>,
        transport: Arc<LoopbackTransport>,
        bus: Arc<InMemoryEventBus<Notification>>,
    }

    fn fixture(config: SessionRegistryConfig) -> Fixture {
        let store = Arc::new(InMemoryDataStore::new());
        let transport = Arc::new(LoopbackTransport::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let registry = SessionRegistry::new(
            config,
            store.clone(),
            Arc::new(CircuitBreaker::new("data_store", CircuitBreakerConfig::default())),
            transport.clone(),
            bus.clone(),
        );
        Fixture {
            registry,
            store,
            transport,
            bus,
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn register_persists_and_lists() {
        let f = fixture(SessionRegistryConfig::default());
        let tenant = TenantId::new();

        let session = f
            .registry
            .register(tenant, sid("a"), serde_json::json!({"phone": "+1555"}))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(f.store.sessions().len(), 1);
        assert_eq!(f.registry.get_active_sessions(tenant).len(), 1);
        assert!(f.registry.get_active_sessions(TenantId::new()).is_empty());

        assert!(f.registry.unregister(tenant, &sid("a")).await.unwrap());
        assert!(f.registry.is_empty());
        assert!(f.store.sessions().is_empty());
    }

    #[tokio::test]
    async fn best_session_has_fewest_messages_then_earliest_registration() {
        let f = fixture(SessionRegistryConfig::default());
        let tenant = TenantId::new();
        for name in ["a", "b", "c"] {
            f.registry
                .register(tenant, sid(name), serde_json::Value::Null)
                .await
                .unwrap();
        }

        assert_eq!(f.registry.get_best_session(tenant).unwrap().session_id, sid("a"));

        f.registry.record_activity(tenant, &sid("a"), ActivityKind::Message).await;
        assert_eq!(f.registry.get_best_session(tenant).unwrap().session_id, sid("b"));

        f.registry.record_activity(tenant, &sid("b"), ActivityKind::Message).await;
        f.registry
            .set_status(tenant, &sid("c"), SessionStatus::Error, None)
            .await
            .unwrap();
        assert_eq!(f.registry.get_best_session(tenant).unwrap().session_id, sid("a"));
        assert!(f.registry.get_best_session(TenantId::new()).is_none());
    }

    #[tokio::test]
    async fn message_activity_increments_by_exactly_one() {
        let f = fixture(SessionRegistryConfig::default());
        let tenant = TenantId::new();
        f.registry
            .register(tenant, sid("a"), serde_json::Value::Null)
            .await
            .unwrap();

        let before = f.registry.get(tenant, &sid("a")).unwrap().message_count;
        let after = f
            .registry
            .record_activity(tenant, &sid("a"), ActivityKind::Message)
            .await
            .unwrap();
        assert_eq!(after.message_count, before + 1);

        let errored = f
            .registry
            .record_activity(tenant, &sid("a"), ActivityKind::Error)
            .await
            .unwrap();
        assert_eq!(errored.message_count, before + 1);
        assert_eq!(errored.error_count, 1);

        assert!(
            f.registry
                .record_activity(tenant, &sid("missing"), ActivityKind::Message)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn sweep_demotes_idle_sessions_and_flags_errors() {
        let f = fixture(SessionRegistryConfig {
            error_threshold: 1,
            check_transport: false,
            ..SessionRegistryConfig::default()
        });
        let tenant = TenantId::new();
        let events = f.bus.subscribe();
        f.registry
            .register(tenant, sid("idle"), serde_json::Value::Null)
            .await
            .unwrap();
        f.registry
            .register(tenant, sid("noisy"), serde_json::Value::Null)
            .await
            .unwrap();
        for _ in 0..2 {
            f.registry.record_activity(tenant, &sid("noisy"), ActivityKind::Error).await;
        }

        let report = f
            .registry
            .health_sweep_at(Utc::now() + chrono::Duration::minutes(6))
            .await;
        assert_eq!(report.demoted, 2);
        assert_eq!(report.flagged, 1);
        assert_eq!(report.evicted, 0);

        let noisy = f.registry.get(tenant, &sid("noisy")).unwrap();
        assert!(noisy.flagged);
        assert_eq!(noisy.status, SessionStatus::Inactive);
        assert_eq!(
            f.store.sessions().iter().find(|s| s.session_id == sid("idle")).unwrap().status,
            SessionStatus::Inactive
        );
        assert_eq!(events.drain().len(), 2);
        assert!(f.registry.get_best_session(tenant).is_none());

        // Activity brings a demoted session back.
        let back = f
            .registry
            .record_activity(tenant, &sid("idle"), ActivityKind::Message)
            .await
            .unwrap();
        assert_eq!(back.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn sweep_evicts_long_idle_sessions() {
        let f = fixture(SessionRegistryConfig {
            check_transport: false,
            ..SessionRegistryConfig::default()
        });
        let tenant = TenantId::new();
        f.registry
            .register(tenant, sid("old"), serde_json::Value::Null)
            .await
            .unwrap();
        f.registry
            .set_status(tenant, &sid("old"), SessionStatus::Inactive, None)
            .await
            .unwrap();

        let report = f
            .registry
            .health_sweep_at(Utc::now() + chrono::Duration::hours(25))
            .await;
        assert_eq!(report.evicted, 1);
        assert!(f.registry.is_empty());
        assert!(f.store.sessions().is_empty());
    }

    #[tokio::test]
    async fn failing_health_check_marks_session_error() {
        let f = fixture(SessionRegistryConfig::default());
        let tenant = TenantId::new();
        f.registry
            .register(tenant, sid("a"), serde_json::Value::Null)
            .await
            .unwrap();
        f.transport.set_healthy(false);

        let report = f.registry.health_sweep().await;
        assert_eq!(report.health_check_failures, 1);
        assert_eq!(
            f.registry.get(tenant, &sid("a")).unwrap().status,
            SessionStatus::Error
        );
    }

    #[tokio::test]
    async fn register_fails_when_store_fails() {
        let f = fixture(SessionRegistryConfig::default());
        f.store.fail_writes(true);

        let err = f
            .registry
            .register(TenantId::new(), sid("a"), serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Store(_)));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn load_from_store_restores_sessions() {
        let f = fixture(SessionRegistryConfig::default());
        let tenant = TenantId::new();
        f.registry
            .register(tenant, sid("a"), serde_json::Value::Null)
            .await
            .unwrap();

        let fresh = fixture(SessionRegistryConfig::default());
        for s in f.store.sessions() {
            fresh.store.save_session(&s).await.unwrap();
        }
        assert_eq!(fresh.registry.load_from_store().await.unwrap(), 1);
        assert!(fresh.registry.is_registered(tenant, &sid("a")));
    }
}
