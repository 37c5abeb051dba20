use serde::Deserialize;

use courier_core::{DeliveryStatus, MediaSource, SessionId};
use courier_infra::jobs::JobState;
use courier_infra::sessions::SessionStatus;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    pub session_id: String,
    pub to: String,
    pub text: String,
    pub quoted_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMediaRequest {
    pub session_id: String,
    pub to: String,
    pub source: MediaSource,
    pub mimetype: String,
    pub caption: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendLocationRequest {
    pub session_id: String,
    pub to: String,
    pub latitude: f64,
    pub longitude: f64,
    pub address: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InboundRequest {
    pub session_id: String,
    pub from: String,
    pub body: String,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct SetSessionStatusRequest {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeliveryCallbackRequest {
    pub provider_message_id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ListDeadLettersQuery {
    pub queue: Option<String>,
    pub limit: Option<usize>,
}

pub const DEFAULT_LIST_LIMIT: usize = 100;

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_session_id(raw: &str) -> Result<SessionId, axum::response::Response> {
    SessionId::new(raw).map_err(errors::gateway_error_to_response)
}

pub fn parse_delivery_status(raw: &str) -> Result<DeliveryStatus, axum::response::Response> {
    DeliveryStatus::parse(&raw.to_lowercase()).ok_or_else(|| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: sent, delivered, read, failed",
        )
    })
}

pub fn parse_session_status(raw: &str) -> Result<SessionStatus, axum::response::Response> {
    SessionStatus::parse(&raw.to_lowercase()).ok_or_else(|| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: active, inactive, connecting, error",
        )
    })
}

pub fn parse_job_state(raw: Option<&str>) -> Result<Option<JobState>, axum::response::Response> {
    match raw {
        None => Ok(None),
        Some(s) => JobState::parse(&s.to_lowercase()).map(Some).ok_or_else(|| {
            errors::json_error(
                axum::http::StatusCode::BAD_REQUEST,
                "invalid_state",
                format!("unknown job state: {s}"),
            )
        }),
    }
}
