//! Producer endpoints. Each one answers with an immediate ack (202 and the
//! job id) or an immediate rejection; nothing is queued on rejection.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use courier_core::GatewayResult;
use courier_infra::producer::EnqueueReceipt;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/text", post(send_text))
        .route("/media", post(send_media))
        .route("/location", post(send_location))
        .route("/inbound", post(receive_inbound))
}

fn accepted(result: GatewayResult<EnqueueReceipt>) -> axum::response::Response {
    match result {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::gateway_error_to_response(e),
    }
}

pub async fn send_text(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::SendTextRequest>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&body.session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    accepted(services.gateway.producer().enqueue_send_text(
        tenant.tenant_id(),
        session_id,
        body.to,
        body.text,
        body.quoted_id,
    ))
}

pub async fn send_media(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::SendMediaRequest>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&body.session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    accepted(services.gateway.producer().enqueue_send_media(
        tenant.tenant_id(),
        session_id,
        body.to,
        body.source,
        body.mimetype,
        body.caption,
        body.filename,
    ))
}

pub async fn send_location(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::SendLocationRequest>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&body.session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    accepted(services.gateway.producer().enqueue_send_location(
        tenant.tenant_id(),
        session_id,
        body.to,
        body.latitude,
        body.longitude,
        body.address,
        body.name,
    ))
}

/// POST /messages/inbound
///
/// Hands a message received by the channel to the inbound queue.
pub async fn receive_inbound(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::InboundRequest>,
) -> axum::response::Response {
    let session_id = match dto::parse_session_id(&body.session_id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    accepted(services.gateway.producer().enqueue_inbound(
        tenant.tenant_id(),
        session_id,
        body.from,
        body.body,
        body.provider_message_id,
    ))
}
