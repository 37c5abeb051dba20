use axum::{Router, routing::get};

pub mod callbacks;
pub mod dead_letters;
pub mod messages;
pub mod ops;
pub mod sessions;
pub mod system;

/// Router for tenant-scoped endpoints.
pub fn tenant_router() -> Router {
    Router::new()
        .route("/stream", get(system::stream))
        .nest("/messages", messages::router())
        .nest("/sessions", sessions::router())
}

/// Router for operational endpoints (cross-tenant).
pub fn ops_router() -> Router {
    ops::router().nest("/dead-letters", dead_letters::router())
}
