//! Operational views: queues, jobs, breakers, delivery tracking, workers.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;

use courier_infra::jobs::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/queues", get(list_queues))
        .route("/queues/:queue", get(get_queue))
        .route("/queues/:queue/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/breakers", get(list_breakers))
        .route("/breakers/:name/open", post(force_open_breaker))
        .route("/breakers/:name/close", post(force_close_breaker))
        .route("/delivery", get(delivery_overview))
        .route("/sessions", get(session_overview))
        .route("/workers", get(worker_stats))
}

pub async fn list_queues(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.gateway.metrics().snapshot_all() {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    match services.gateway.metrics().snapshot(&queue) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let state = match dto::parse_job_state(query.state.as_deref()) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(dto::DEFAULT_LIST_LIMIT);
    match services.gateway.queue().list(&queue, state, limit) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };
    match services.gateway.queue().get(job_id) {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::not_found(format!("job {job_id}")),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn list_breakers(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    Json(services.gateway.breakers().snapshots()).into_response()
}

pub async fn force_open_breaker(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match services.gateway.breakers().get(&name) {
        Some(breaker) => {
            breaker.force_open();
            tracing::warn!(breaker = %name, "breaker forced open");
            Json(breaker.snapshot()).into_response()
        }
        None => errors::not_found(format!("breaker {name}")),
    }
}

pub async fn force_close_breaker(
    Extension(services): Extension<Arc<AppServices>>,
    Path(name): Path<String>,
) -> axum::response::Response {
    match services.gateway.breakers().get(&name) {
        Some(breaker) => {
            breaker.force_close();
            tracing::info!(breaker = %name, "breaker forced closed");
            Json(breaker.snapshot()).into_response()
        }
        None => errors::not_found(format!("breaker {name}")),
    }
}

pub async fn delivery_overview(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let delivery = services.gateway.delivery();
    Json(json!({
        "pending": delivery.pending_count(),
        "status_counts": delivery.status_counts(),
    }))
    .into_response()
}

pub async fn session_overview(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let counts: serde_json::Map<String, serde_json::Value> = services
        .gateway
        .sessions()
        .status_counts()
        .into_iter()
        .map(|(status, count)| (status.as_str().to_string(), json!(count)))
        .collect();
    Json(json!({
        "total": services.gateway.sessions().len(),
        "by_status": counts,
    }))
    .into_response()
}

pub async fn worker_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let pools: serde_json::Map<String, serde_json::Value> = services
        .gateway
        .worker_stats()
        .into_iter()
        .map(|(queue, stats)| (queue, json!(stats)))
        .collect();
    Json(pools).into_response()
}
