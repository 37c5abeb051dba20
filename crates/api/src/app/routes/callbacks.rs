//! Provider callbacks. These carry provider ids, not tenants; the delivery
//! record knows its tenant.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    response::IntoResponse,
    routing::post,
};
use serde_json::json;

use courier_infra::delivery::StatusUpdate;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/delivery", post(delivery_status))
}

/// POST /callbacks/delivery
pub async fn delivery_status(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::DeliveryCallbackRequest>,
) -> axum::response::Response {
    let status = match dto::parse_delivery_status(&body.status) {
        Ok(s) => s,
        Err(resp) => return resp,
    };

    match services
        .gateway
        .delivery()
        .update_status(&body.provider_message_id, status)
        .await
    {
        Ok(StatusUpdate::Applied { previous, record }) => Json(json!({
            "applied": true,
            "previous": previous,
            "record": record,
        }))
        .into_response(),
        Ok(StatusUpdate::Ignored { current }) => Json(json!({
            "applied": false,
            "current": current,
        }))
        .into_response(),
        Ok(StatusUpdate::Unknown) => {
            errors::not_found(format!("message {}", body.provider_message_id))
        }
        Err(e) => errors::gateway_error_to_response(e),
    }
}
