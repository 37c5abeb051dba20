use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    response::{IntoResponse, sse::Event as SseEvent},
};

use courier_infra::circuit_breaker::CircuitState;

use crate::app::services::{self, AppServices};
use crate::context::TenantContext;

/// GET /health
///
/// Always 200 while the process serves requests; `status` is `degraded`
/// when a breaker is open.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let gateway = &services.gateway;
    let open_breakers: Vec<String> = gateway
        .breakers()
        .snapshots()
        .into_iter()
        .filter(|s| s.state == CircuitState::Open)
        .map(|s| s.name)
        .collect();
    let status = if open_breakers.is_empty() { "ok" } else { "degraded" };

    Json(serde_json::json!({
        "status": status,
        "mode": services.mode.as_str(),
        "running": gateway.is_running(),
        "sessions": gateway.sessions().len(),
        "open_breakers": open_breakers,
    }))
}

/// GET /stream
pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    services::tenant_sse_stream(services, tenant.tenant_id())
}
