//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: gateway construction from the environment, SSE fan-out
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
///
/// Tenant routes require the `x-tenant-id` header; operational routes,
/// provider callbacks and `/health` do not.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let tenant_scoped =
        routes::tenant_router().route_layer(axum::middleware::from_fn(middleware::tenant_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/callbacks", routes::callbacks::router())
        .nest("/ops", routes::ops_router())
        .merge(tenant_scoped)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
