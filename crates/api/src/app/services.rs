use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use courier_core::TenantId;
use courier_events::EventBus;
use courier_infra::config::ConfigError;
use courier_infra::store::PostgresDataStore;
use courier_infra::{Gateway, GatewayConfig};

#[cfg(feature = "redis")]
use courier_infra::event_bus::RedisNotificationBus;

/// Redis channel prefix for cross-instance notifications.
#[cfg(feature = "redis")]
const NOTIFICATION_CHANNEL_PREFIX: &str = "courier.notifications";

/// Where gateway state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    InMemory,
    Persistent,
}

impl StoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreMode::InMemory => "in_memory",
            StoreMode::Persistent => "persistent",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")]
    MissingDatabaseUrl,
    #[error("database error: {0}")]
    Database(String),
    #[error("redis error: {0}")]
    Redis(String),
}

/// Everything the HTTP handlers need.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub gateway: Arc<Gateway>,
    pub mode: StoreMode,
}

impl AppServices {
    pub fn new(gateway: Arc<Gateway>, mode: StoreMode) -> Self {
        Self { gateway, mode }
    }

    /// In-memory gateway with default configuration (tests, local runs).
    pub fn in_memory(config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self::new(
            Arc::new(Gateway::builder(config).build()),
            StoreMode::InMemory,
        ))
    }
}

/// Build services from the environment.
///
/// `USE_PERSISTENT_STORES=true` switches the data store to Postgres
/// (`DATABASE_URL`). With the `redis` feature, `REDIS_URL` adds a Redis
/// pub/sub channel for notifications.
pub async fn build_services() -> Result<Arc<AppServices>, ServicesError> {
    let config = GatewayConfig::from_env()?;
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    let mut builder = Gateway::builder(config);
    let mode = if use_persistent {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ServicesError::MissingDatabaseUrl)?;
        let pool = sqlx::PgPool::connect(&database_url)
            .await
            .map_err(|e| ServicesError::Database(e.to_string()))?;
        let store = PostgresDataStore::new(pool);
        store
            .ensure_schema()
            .await
            .map_err(|e| ServicesError::Database(e.to_string()))?;
        builder = builder.data_store(Arc::new(store));
        StoreMode::Persistent
    } else {
        StoreMode::InMemory
    };

    builder = with_redis(builder)?;

    tracing::info!(mode = mode.as_str(), "gateway services built");
    Ok(Arc::new(AppServices::new(Arc::new(builder.build()), mode)))
}

#[cfg(feature = "redis")]
fn with_redis(
    builder: courier_infra::GatewayBuilder,
) -> Result<courier_infra::GatewayBuilder, ServicesError> {
    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let bus = RedisNotificationBus::new(&url, NOTIFICATION_CHANNEL_PREFIX)
                .map_err(|e| ServicesError::Redis(e.to_string()))?;
            tracing::info!(prefix = NOTIFICATION_CHANNEL_PREFIX, "publishing notifications to redis");
            Ok(builder.notification_sink(Arc::new(bus)))
        }
        Err(_) => Ok(builder),
    }
}

#[cfg(not(feature = "redis"))]
fn with_redis(
    builder: courier_infra::GatewayBuilder,
) -> Result<courier_infra::GatewayBuilder, ServicesError> {
    if std::env::var("REDIS_URL").is_ok() {
        tracing::warn!("REDIS_URL set but redis feature not enabled, notifications stay local");
    }
    Ok(builder)
}

/// SSE stream of one tenant's notifications (delivery status, inbound
/// messages, session status).
pub fn tenant_sse_stream(
    services: Arc<AppServices>,
    tenant_id: TenantId,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    let subscription = services.gateway.notifications().subscribe();

    // The subscription is a blocking receiver; forward from a blocking task.
    tokio::task::spawn_blocking(move || {
        loop {
            match subscription.recv_timeout(Duration::from_secs(1)) {
                Ok(notification) => {
                    if notification.tenant_id != tenant_id {
                        continue;
                    }
                    let data = match serde_json::to_string(&notification) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    let event = SseEvent::default().event(notification.topic()).data(data);
                    if tx.send(Ok(event)).is_err() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
