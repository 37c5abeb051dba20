//! Gateway error taxonomy.

use thiserror::Error;

/// Result type used across the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway-level error.
///
/// Every producer-facing failure maps onto one of these variants, and the
/// variant decides how the failure propagates:
///
/// - `TransientTransport`: retried through queue backoff, counted by breakers
/// - `RateLimited`: caller backs off, never retried by the queue
/// - `Duplicate`: the request was already satisfied
/// - `Validation`: bad input, surfaced synchronously and never queued
/// - `CircuitOpen`: fast-fail until the breaker's next attempt
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network/timeout failure talking to the channel provider.
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// The (tenant, session) pair exceeded its send budget.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// An identical message was already dispatched within the dedup window.
    #[error("duplicate request (key {key})")]
    Duplicate { key: String },

    /// Input failed validation (bad payload, unknown session, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The breaker guarding `operation` is open.
    #[error("circuit open for {operation}, retry after {retry_after_secs}s")]
    CircuitOpen {
        operation: String,
        retry_after_secs: u64,
    },

    /// The data store or job queue failed.
    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientTransport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited { retry_after_secs }
    }

    /// Whether the queue may retry the failed work on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientTransport(_) | Self::Store(_))
    }

    /// Suggested back-off for the caller, if the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Stable machine-readable code (used in HTTP error bodies and logs).
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientTransport(_) => "transient_transport",
            Self::RateLimited { .. } => "rate_limited",
            Self::Duplicate { .. } => "duplicate",
            Self::Validation(_) => "validation_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Store(_) => "store_error",
        }
    }
}
