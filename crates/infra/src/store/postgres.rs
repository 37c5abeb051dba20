//! Postgres-backed data store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | DataStoreError |
//! |------------|----------------|
//! | PoolClosed, Io, Tls, PoolTimedOut | `Unavailable` |
//! | Database, RowNotFound, other | `Query` |
//! | ColumnDecode / bad enum text | `Serialization` |
//!
//! ## Thread Safety
//!
//! `PostgresDataStore` is `Send + Sync` and cheap to clone; all operations go
//! through the SQLx connection pool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use courier_core::{DeliveryStatus, InboundMessage, MessageId, SessionId, TenantId};

use crate::dead_letter::DeadLetterEntry;
use crate::delivery::DeliveryRecord;
use crate::jobs::JobId;
use crate::ports::{DataStore, DataStoreError};
use crate::sessions::{Session, SessionStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS courier_sessions (
        tenant_id UUID NOT NULL,
        session_id TEXT NOT NULL,
        status TEXT NOT NULL,
        message_count BIGINT NOT NULL DEFAULT 0,
        error_count BIGINT NOT NULL DEFAULT 0,
        last_activity TIMESTAMPTZ NOT NULL,
        registered_at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL DEFAULT 'null'::jsonb,
        flagged BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (tenant_id, session_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS courier_deliveries (
        provider_message_id TEXT PRIMARY KEY,
        message_id UUID NOT NULL,
        tenant_id UUID NOT NULL,
        session_id TEXT NOT NULL,
        recipient TEXT NOT NULL,
        status TEXT NOT NULL,
        status_checks INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TIMESTAMPTZ,
        next_check_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS courier_deliveries_tenant_idx ON courier_deliveries (tenant_id, created_at)"#,
    r#"
    CREATE TABLE IF NOT EXISTS courier_dead_letters (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL,
        queue TEXT NOT NULL,
        job_name TEXT NOT NULL,
        tenant_id UUID NOT NULL,
        payload JSONB NOT NULL,
        priority INTEGER NOT NULL,
        failure_reason TEXT NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL,
        attempts_made INTEGER NOT NULL,
        max_attempts INTEGER NOT NULL,
        auto_retries INTEGER NOT NULL,
        history JSONB NOT NULL,
        backoff JSONB,
        retried_as UUID,
        retried_at TIMESTAMPTZ
    )
    "#,
    r#"ALTER TABLE courier_dead_letters ADD COLUMN IF NOT EXISTS backoff JSONB"#,
    r#"ALTER TABLE courier_dead_letters ADD COLUMN IF NOT EXISTS retried_as UUID"#,
    r#"ALTER TABLE courier_dead_letters ADD COLUMN IF NOT EXISTS retried_at TIMESTAMPTZ"#,
    r#"
    CREATE TABLE IF NOT EXISTS courier_inbound_messages (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        session_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        body TEXT NOT NULL,
        provider_message_id TEXT,
        received_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Postgres-backed `DataStore`.
///
/// Every row carries `tenant_id`; sessions are keyed by
/// `(tenant_id, session_id)`.
#[derive(Debug, Clone)]
pub struct PostgresDataStore {
    pool: Arc<PgPool>,
}

impl PostgresDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the gateway tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), DataStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for PostgresDataStore {
    #[instrument(skip(self, session), fields(tenant_id = %session.tenant_id, session_id = %session.session_id), err)]
    async fn save_session(&self, session: &Session) -> Result<(), DataStoreError> {
        sqlx::query(
            r#"
            INSERT INTO courier_sessions (
                tenant_id, session_id, status, message_count, error_count,
                last_activity, registered_at, metadata, flagged
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, session_id) DO UPDATE SET
                status = EXCLUDED.status,
                message_count = EXCLUDED.message_count,
                error_count = EXCLUDED.error_count,
                last_activity = EXCLUDED.last_activity,
                metadata = EXCLUDED.metadata,
                flagged = EXCLUDED.flagged
            "#,
        )
        .bind(session.tenant_id.as_uuid())
        .bind(session.session_id.as_str())
        .bind(session.status.as_str())
        .bind(session.message_count as i64)
        .bind(session.error_count as i64)
        .bind(session.last_activity)
        .bind(session.registered_at)
        .bind(&session.metadata)
        .bind(session.flagged)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_session", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn delete_session(
        &self,
        tenant_id: TenantId,
        session_id: &SessionId,
    ) -> Result<(), DataStoreError> {
        sqlx::query("DELETE FROM courier_sessions WHERE tenant_id = $1 AND session_id = $2")
            .bind(tenant_id.as_uuid())
            .bind(session_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_session", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn load_sessions(&self) -> Result<Vec<Session>, DataStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, session_id, status, message_count, error_count,
                   last_activity, registered_at, metadata, flagged
            FROM courier_sessions
            ORDER BY registered_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_sessions", e))?;

        rows.iter().map(session_from_row).collect()
    }

    #[instrument(skip(self, record), fields(provider_message_id = %record.provider_message_id), err)]
    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<(), DataStoreError> {
        sqlx::query(
            r#"
            INSERT INTO courier_deliveries (
                provider_message_id, message_id, tenant_id, session_id, recipient,
                status, status_checks, last_attempt_at, next_check_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (provider_message_id) DO UPDATE SET
                status = EXCLUDED.status,
                status_checks = EXCLUDED.status_checks,
                last_attempt_at = EXCLUDED.last_attempt_at,
                next_check_at = EXCLUDED.next_check_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.provider_message_id)
        .bind(record.message_id.as_uuid())
        .bind(record.tenant_id.as_uuid())
        .bind(record.session_id.as_str())
        .bind(&record.recipient)
        .bind(record.status.as_str())
        .bind(record.status_checks as i32)
        .bind(record.last_attempt_at)
        .bind(record.next_check_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_delivery", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn load_delivery(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<DeliveryRecord>, DataStoreError> {
        let row = sqlx::query(
            r#"
            SELECT provider_message_id, message_id, tenant_id, session_id, recipient,
                   status, status_checks, last_attempt_at, next_check_at, created_at, updated_at
            FROM courier_deliveries
            WHERE provider_message_id = $1
            "#,
        )
        .bind(provider_message_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_delivery", e))?;

        row.as_ref().map(delivery_from_row).transpose()
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id, queue = %entry.queue), err)]
    async fn save_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DataStoreError> {
        let history = serde_json::to_value(&entry.history)?;
        let backoff = serde_json::to_value(&entry.backoff)?;
        sqlx::query(
            r#"
            INSERT INTO courier_dead_letters (
                id, job_id, queue, job_name, tenant_id, payload, priority, failure_reason,
                failed_at, attempts_made, max_attempts, auto_retries, history, backoff,
                retried_as, retried_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                retried_as = EXCLUDED.retried_as,
                retried_at = EXCLUDED.retried_at
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id.0)
        .bind(&entry.queue)
        .bind(&entry.job_name)
        .bind(entry.tenant_id.as_uuid())
        .bind(&entry.payload)
        .bind(entry.priority as i32)
        .bind(&entry.failure_reason)
        .bind(entry.failed_at)
        .bind(entry.attempts_made as i32)
        .bind(entry.max_attempts as i32)
        .bind(entry.auto_retries as i32)
        .bind(history)
        .bind(backoff)
        .bind(entry.retried_as.map(|id| id.0))
        .bind(entry.retried_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_dead_letter", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn load_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, DataStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, queue, job_name, tenant_id, payload, priority, failure_reason,
                   failed_at, attempts_made, max_attempts, auto_retries, history, backoff,
                   retried_as, retried_at
            FROM courier_dead_letters
            ORDER BY failed_at ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_dead_letter(&self, entry_id: Uuid) -> Result<(), DataStoreError> {
        sqlx::query("DELETE FROM courier_dead_letters WHERE id = $1")
            .bind(entry_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(tenant_id = %message.tenant_id, message_id = %message.id), err)]
    async fn record_inbound(&self, message: &InboundMessage) -> Result<(), DataStoreError> {
        sqlx::query(
            r#"
            INSERT INTO courier_inbound_messages (
                id, tenant_id, session_id, sender, body, provider_message_id, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.tenant_id.as_uuid())
        .bind(message.session_id.as_str())
        .bind(&message.from)
        .bind(&message.body)
        .bind(message.provider_message_id.as_deref())
        .bind(message.received_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_inbound", e))?;
        Ok(())
    }
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<Session, DataStoreError> {
    let status: String = get(row, "status")?;
    let message_count: i64 = get(row, "message_count")?;
    let error_count: i64 = get(row, "error_count")?;
    Ok(Session {
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        session_id: session_id(get(row, "session_id")?)?,
        status: SessionStatus::parse(&status)
            .ok_or_else(|| DataStoreError::Serialization(format!("unknown session status {status:?}")))?,
        message_count: message_count.max(0) as u64,
        error_count: error_count.max(0) as u64,
        last_activity: get(row, "last_activity")?,
        registered_at: get(row, "registered_at")?,
        metadata: get(row, "metadata")?,
        flagged: get(row, "flagged")?,
        seq: 0,
    })
}

fn delivery_from_row(row: &sqlx::postgres::PgRow) -> Result<DeliveryRecord, DataStoreError> {
    let status: String = get(row, "status")?;
    let status_checks: i32 = get(row, "status_checks")?;
    let last_attempt_at: Option<DateTime<Utc>> = get(row, "last_attempt_at")?;
    let next_check_at: Option<DateTime<Utc>> = get(row, "next_check_at")?;
    Ok(DeliveryRecord {
        provider_message_id: get(row, "provider_message_id")?,
        message_id: MessageId::from_uuid(get(row, "message_id")?),
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        session_id: session_id(get(row, "session_id")?)?,
        recipient: get(row, "recipient")?,
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| DataStoreError::Serialization(format!("unknown delivery status {status:?}")))?,
        status_checks: status_checks.max(0) as u32,
        last_attempt_at,
        next_check_at,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, DataStoreError> {
    let history: serde_json::Value = get(row, "history")?;
    let priority: i32 = get(row, "priority")?;
    let attempts_made: i32 = get(row, "attempts_made")?;
    let max_attempts: i32 = get(row, "max_attempts")?;
    let auto_retries: i32 = get(row, "auto_retries")?;
    let backoff: Option<serde_json::Value> = get(row, "backoff")?;
    let retried_as: Option<Uuid> = get(row, "retried_as")?;
    Ok(DeadLetterEntry {
        id: get(row, "id")?,
        job_id: JobId::from_uuid(get(row, "job_id")?),
        queue: get(row, "queue")?,
        job_name: get(row, "job_name")?,
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        payload: get(row, "payload")?,
        priority: priority.max(0) as u32,
        failure_reason: get(row, "failure_reason")?,
        failed_at: get(row, "failed_at")?,
        attempts_made: attempts_made.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        auto_retries: auto_retries.max(0) as u32,
        history: serde_json::from_value(history)?,
        backoff: backoff.map(serde_json::from_value).transpose()?.unwrap_or_default(),
        retried_as: retried_as.map(JobId::from_uuid),
        retried_at: get(row, "retried_at")?,
    })
}

fn get<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T, DataStoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| DataStoreError::Serialization(format!("column {column}: {e}")))
}

fn session_id(raw: String) -> Result<SessionId, DataStoreError> {
    SessionId::new(raw).map_err(|e| DataStoreError::Serialization(e.to_string()))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DataStoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            DataStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => DataStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => DataStoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            DataStoreError::Query(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            DataStoreError::Serialization(format!("column {index} in {operation}: {source}"))
        }
        other => DataStoreError::Query(format!("sqlx error in {operation}: {other}")),
    }
}
