use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::json;

use courier_core::GatewayError;
use courier_infra::jobs::JobQueueError;

pub fn gateway_error_to_response(err: GatewayError) -> axum::response::Response {
    let status = match &err {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::Duplicate { .. } => StatusCode::CONFLICT,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::TransientTransport(_) => StatusCode::BAD_GATEWAY,
        GatewayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut response = (
        status,
        axum::Json(json!({
            "error": err.code(),
            "message": err.to_string(),
            "retry_after_secs": err.retry_after_secs(),
        })),
    )
        .into_response();

    if let Some(secs) = err.retry_after_secs() {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

pub fn queue_error_to_response(err: JobQueueError) -> axum::response::Response {
    gateway_error_to_response(err.into())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn not_found(what: impl std::fmt::Display) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
}
