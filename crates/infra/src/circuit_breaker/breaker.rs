//! Three-state circuit breaker.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use courier_core::GatewayError;

use crate::jobs::types::to_chrono;

/// Circuit breaker states representing the current operational mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - calls go through and decide the next state
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close it again.
    pub success_threshold: u32,
    /// Time spent open before a trial call is let through.
    #[serde(with = "crate::config::duration_secs")]
    pub reset_timeout: Duration,
    /// Hard timeout on every protected call.
    #[serde(with = "crate::config::duration_secs")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Errors returned by a protected call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was not invoked.
    #[error("circuit breaker {name} is open, retry after {}s", .retry_after.as_secs())]
    Open { name: String, retry_after: Duration },

    /// The operation did not finish within the call timeout.
    #[error("{name} call timed out after {}ms", .after.as_millis())]
    Timeout { name: String, after: Duration },

    /// The operation itself failed.
    #[error("operation failed: {0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl<E: std::fmt::Display> CircuitBreakerError<E> {
    /// Map onto the gateway taxonomy; `inner` decides for operation errors.
    pub fn into_gateway(self, inner: impl FnOnce(E) -> GatewayError) -> GatewayError {
        match self {
            Self::Open { name, retry_after } => GatewayError::CircuitOpen {
                operation: name,
                retry_after_secs: retry_after.as_secs().max(1),
            },
            Self::Timeout { .. } => GatewayError::transient(self.to_string()),
            Self::Inner(e) => inner(e),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    next_attempt: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Circuit breaker guarding one logical operation.
///
/// - CLOSED: calls run; `failure_threshold` consecutive failures open it
/// - OPEN: calls are rejected until `next_attempt`, then the next call moves
///   the breaker to HALF_OPEN and runs
/// - HALF_OPEN: a failure reopens, `success_threshold` successes close
///
/// Every call races `call_timeout`; a timeout counts as a failure. The state
/// lock is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            reset_timeout_secs = config.reset_timeout.as_secs(),
            "circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                next_attempt: None,
                last_state_change: Utc::now(),
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counters stay consistent under every early return; recover on poison.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get current circuit state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Execute an operation with circuit breaker protection.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire(Utc::now())?;

        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success(Utc::now());
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(Utc::now());
                Err(CircuitBreakerError::Inner(e))
            }
            Err(_) => {
                self.record_failure(Utc::now());
                Err(CircuitBreakerError::Timeout {
                    name: self.name.clone(),
                    after: self.config.call_timeout,
                })
            }
        }
    }

    /// Like `call`, but any error (including an open circuit) is handed to
    /// `fallback`, whose value replaces the result.
    pub async fn call_with_fallback<F, Fut, T, E, FB>(&self, operation: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CircuitBreakerError<E>) -> T,
    {
        match self.call(operation).await {
            Ok(value) => value,
            Err(e) => fallback(e),
        }
    }

    /// Remaining open time, if a call made now would be rejected. Does not
    /// change state; used by producers to fail fast before queueing.
    pub fn open_retry_after(&self) -> Option<Duration> {
        self.open_retry_after_at(Utc::now())
    }

    pub fn open_retry_after_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(next)) if next > now => Some(remaining(next, now)),
            _ => None,
        }
    }

    /// Admit or reject a call at `now`.
    fn acquire<E>(&self, now: DateTime<Utc>) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.lock();
        inner.total_calls += 1;

        if inner.state == CircuitState::Open {
            match inner.next_attempt {
                Some(next) if next > now => {
                    inner.total_rejections += 1;
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: remaining(next, now),
                    });
                }
                _ => {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.last_state_change = now;
                    info!(breaker = %self.name, "circuit breaker half-open (testing recovery)");
                }
            }
        }
        Ok(())
    }

    fn record_success(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.close(&mut inner, now);
                    info!(breaker = %self.name, "circuit breaker closed (recovered)");
                }
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            // A call admitted before a concurrent trip; the open state stands.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                    error!(
                        breaker = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        reset_timeout_secs = self.config.reset_timeout.as_secs(),
                        "circuit breaker opened (failing fast)"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                self.open(&mut inner, now);
                warn!(breaker = %self.name, "circuit breaker reopened after half-open failure");
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = CircuitState::Open;
        inner.half_open_successes = 0;
        inner.next_attempt = Some(now + to_chrono(self.config.reset_timeout));
        inner.last_state_change = now;
    }

    fn close(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.next_attempt = None;
        inner.last_state_change = now;
    }

    /// Force circuit to open state (for emergency situations).
    pub fn force_open(&self) {
        warn!(breaker = %self.name, "circuit breaker forced open");
        let mut inner = self.lock();
        self.open(&mut inner, Utc::now());
    }

    /// Force circuit to closed state (for emergency recovery).
    pub fn force_close(&self) {
        warn!(breaker = %self.name, "circuit breaker forced closed");
        let mut inner = self.lock();
        self.close(&mut inner, Utc::now());
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            next_attempt: inner.next_attempt,
            last_state_change: inner.last_state_change,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }
}

fn remaining(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
