//! Dead-letter listing, replay, cleanup and bulk retry.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use uuid::Uuid;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/cleanup", post(cleanup))
        .route("/auto-retry", post(run_auto_retry))
        .route("/retry-failed/:queue", post(retry_failed))
        .route("/:id", get(get_dead_letter))
        .route("/:id/replay", post(replay))
}

fn parse_entry_id(raw: &str) -> Result<Uuid, axum::response::Response> {
    Uuid::parse_str(raw)
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid dead-letter id"))
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListDeadLettersQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(dto::DEFAULT_LIST_LIMIT);
    Json(
        services
            .gateway
            .dead_letters()
            .list(query.queue.as_deref(), limit),
    )
    .into_response()
}

pub async fn get_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let entry_id = match parse_entry_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.gateway.dead_letters().get(entry_id) {
        Some(entry) => Json(entry).into_response(),
        None => errors::not_found(format!("dead-letter entry {entry_id}")),
    }
}

/// POST /ops/dead-letters/:id/replay
pub async fn replay(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let entry_id = match parse_entry_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if services.gateway.dead_letters().get(entry_id).is_none() {
        return errors::not_found(format!("dead-letter entry {entry_id}"));
    }
    match services.gateway.dead_letters().replay(entry_id).await {
        Ok(handle) => (StatusCode::ACCEPTED, Json(handle)).into_response(),
        Err(e) => errors::gateway_error_to_response(e),
    }
}

pub async fn cleanup(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let removed = services.gateway.dead_letters().cleanup().await;
    Json(json!({ "removed": removed })).into_response()
}

/// POST /ops/dead-letters/auto-retry
///
/// Run one auto-retry sweep now instead of waiting for the timer.
pub async fn run_auto_retry(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.gateway.dead_letters().auto_retry_sweep().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::gateway_error_to_response(e),
    }
}

pub async fn retry_failed(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    match services.gateway.dead_letters().retry_all_failed(&queue).await {
        Ok(handles) => (
            StatusCode::ACCEPTED,
            Json(json!({ "retried": handles.len(), "jobs": handles })),
        )
            .into_response(),
        Err(e) => errors::gateway_error_to_response(e),
    }
}
