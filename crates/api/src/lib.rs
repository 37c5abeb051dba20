//! HTTP API: producer endpoints, provider callbacks, operational views.

pub mod app;
pub mod context;
pub mod middleware;
