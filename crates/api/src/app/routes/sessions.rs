use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(register_session).get(list_sessions))
        .route("/best", get(best_session))
        .route("/:id", get(get_session).delete(unregister_session))
        .route("/:id/status", post(set_session_status))
        .route("/:id/rate-limit", get(rate_limit_status).delete(reset_rate_limit))
}

pub async fn register_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::RegisterSessionRequest>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&body.session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match services
        .gateway
        .sessions()
        .register(tenant.tenant_id(), session_id, body.metadata)
        .await
    {
        Ok(session) => (StatusCode::CREATED, Json(session)).into_response(),
        Err(e) => errors::gateway_error_to_response(e),
    }
}

pub async fn list_sessions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    Json(services.gateway.sessions().list(tenant.tenant_id())).into_response()
}

/// GET /sessions/best
///
/// The session the load balancer would pick right now.
pub async fn best_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.gateway.sessions().get_best_session(tenant.tenant_id()) {
        Some(session) => Json(session).into_response(),
        None => errors::not_found("active session"),
    }
}

pub async fn get_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match services.gateway.sessions().get(tenant.tenant_id(), &session_id) {
        Some(session) => Json(session).into_response(),
        None => errors::not_found(format!("session {session_id}")),
    }
}

pub async fn unregister_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match services
        .gateway
        .sessions()
        .unregister(tenant.tenant_id(), &session_id)
        .await
    {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => errors::not_found(format!("session {session_id}")),
        Err(e) => errors::gateway_error_to_response(e),
    }
}

/// POST /sessions/:id/status
///
/// Connection lifecycle events from the channel adapter.
pub async fn set_session_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::SetSessionStatusRequest>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let status = match dto::parse_session_status(&body.status) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match services
        .gateway
        .sessions()
        .set_status(tenant.tenant_id(), &session_id, status, body.reason.as_deref())
        .await
    {
        Ok(session) => Json(session).into_response(),
        Err(e) => errors::gateway_error_to_response(e),
    }
}

pub async fn rate_limit_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    Json(
        services
            .gateway
            .rate_limiter()
            .status(tenant.tenant_id(), &session_id),
    )
    .into_response()
}

pub async fn reset_rate_limit(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    services
        .gateway
        .rate_limiter()
        .reset(tenant.tenant_id(), &session_id);
    StatusCode::NO_CONTENT.into_response()
}
