//! Named breakers, one per logical operation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};

/// Breaker guarding channel transport calls.
pub const TRANSPORT: &str = "transport";
/// Breaker guarding data store calls.
pub const DATA_STORE: &str = "data_store";

/// Registry of breakers keyed by operation name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker named `name`, creating it with `config` on first use.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers.get(name).cloned()
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
