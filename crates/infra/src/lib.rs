//! Dispatch engine: queues, sessions, resilience, delivery tracking and the
//! adapters (data store, transport, notification bus) behind them.

pub mod circuit_breaker;
pub mod config;
pub mod dead_letter;
pub mod dedup;
pub mod delivery;
pub mod dispatch;
pub mod event_bus;
pub mod gateway;
pub mod jobs;
pub mod metrics;
pub mod notify;
pub mod ports;
pub mod producer;
pub mod rate_limit;
pub mod sessions;
pub mod store;
pub mod transport;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayBuilder};
