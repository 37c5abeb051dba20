use axum::{http::HeaderMap, middleware::Next, response::Response};

use courier_core::TenantId;

use crate::app::errors;
use crate::context::TenantContext;

/// Header carrying the calling tenant. Authentication happens upstream.
pub const TENANT_HEADER: &str = "x-tenant-id";

pub async fn tenant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let tenant_id = extract_tenant(req.headers())?;
    req.extensions_mut().insert(TenantContext::new(tenant_id));
    Ok(next.run(req).await)
}

fn extract_tenant(headers: &HeaderMap) -> Result<TenantId, Response> {
    let missing = || {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "missing_tenant",
            format!("{TENANT_HEADER} header is required"),
        )
    };

    let raw = headers
        .get(TENANT_HEADER)
        .ok_or_else(missing)?
        .to_str()
        .map_err(|_| missing())?
        .trim();
    if raw.is_empty() {
        return Err(missing());
    }

    raw.parse::<TenantId>()
        .map_err(errors::gateway_error_to_response)
}
