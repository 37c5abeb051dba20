//! Circuit breakers for the transport and the data store.

pub mod breaker;
pub mod registry;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot,
    CircuitState,
};
pub use registry::{CircuitBreakerRegistry, DATA_STORE, TRANSPORT};
