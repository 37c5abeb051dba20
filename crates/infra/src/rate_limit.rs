//! Per (tenant, session) send budget.
//!
//! Two fixed windows per key (minute and hour). Exceeding either one blocks
//! the key for `block_duration`, and the block outlives a window reset.
//! State is process-local; a restart forgets every counter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use courier_core::{SessionId, TenantId};

use crate::jobs::types::to_chrono;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    /// How long a key stays blocked after exceeding a window.
    #[serde(with = "crate::config::duration_secs")]
    pub block_duration: Duration,
    /// How often stale windows are reclaimed.
    #[serde(with = "crate::config::duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 20,
            per_hour: 100,
            block_duration: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Minute,
    Hour,
}

impl Granularity {
    pub const ALL: [Granularity; 2] = [Granularity::Minute, Granularity::Hour];

    fn length(self) -> chrono::Duration {
        match self {
            Granularity::Minute => chrono::Duration::minutes(1),
            Granularity::Hour => chrono::Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone)]
struct RateWindow {
    count: u32,
    reset_at: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
}

impl RateWindow {
    fn fresh(granularity: Granularity, now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            reset_at: now + granularity.length(),
            blocked_until: None,
        }
    }

    fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }

    /// Lazy reset. A live block keeps the old window in place.
    fn refresh(&mut self, granularity: Granularity, now: DateTime<Utc>) {
        if self.is_blocked(now) {
            return;
        }
        if self.blocked_until.is_some() {
            self.blocked_until = None;
        }
        if self.reset_at <= now {
            *self = Self::fresh(granularity, now);
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.reset_at <= now && !self.is_blocked(now)
    }
}

type WindowKey = (TenantId, SessionId, Granularity);

/// Outcome of `check_and_increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Sends left in the tightest window after this call.
    pub remaining: u32,
    /// Seconds until the caller should try again (0 when allowed).
    pub retry_after_secs: u64,
}

/// Operator view of one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStatus {
    pub granularity: Granularity,
    pub count: u32,
    pub max: u32,
    pub reset_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Operator view of one (tenant, session) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub blocked: bool,
    pub windows: Vec<WindowStatus>,
}

/// In-process rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<WindowKey, RateWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn max_for(&self, granularity: Granularity) -> u32 {
        match granularity {
            Granularity::Minute => self.config.per_minute,
            Granularity::Hour => self.config.per_hour,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WindowKey, RateWindow>> {
        // Counters are plain integers; a panic mid-update leaves them usable.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn check_and_increment(&self, tenant: TenantId, session: &SessionId) -> RateLimitDecision {
        self.check_and_increment_at(tenant, session, Utc::now())
    }

    /// Count one send against both windows, or deny it.
    ///
    /// Both windows are incremented only when both allow the call. A denied
    /// call increments nothing and blocks the key.
    pub fn check_and_increment_at(
        &self,
        tenant: TenantId,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut windows = self.lock();

        for granularity in Granularity::ALL {
            windows
                .entry((tenant, session.clone(), granularity))
                .or_insert_with(|| RateWindow::fresh(granularity, now))
                .refresh(granularity, now);
        }

        let keys = Granularity::ALL.map(|g| (tenant, session.clone(), g));

        let blocked_until = keys
            .iter()
            .filter_map(|k| windows.get(k))
            .filter(|w| w.is_blocked(now))
            .filter_map(|w| w.blocked_until)
            .max();
        if let Some(until) = blocked_until {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: secs_until(until, now),
            };
        }

        let exceeded = keys.iter().any(|k| {
            windows
                .get(k)
                .is_some_and(|w| w.count >= self.max_for(k.2))
        });
        if exceeded {
            let until = now + to_chrono(self.config.block_duration);
            for k in &keys {
                if let Some(w) = windows.get_mut(k) {
                    w.blocked_until = Some(until);
                }
            }
            warn!(
                tenant_id = %tenant,
                session_id = %session,
                blocked_secs = self.config.block_duration.as_secs(),
                "rate limit exceeded, key blocked"
            );
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: secs_until(until, now),
            };
        }

        let mut remaining = u32::MAX;
        for k in &keys {
            if let Some(w) = windows.get_mut(k) {
                w.count += 1;
                remaining = remaining.min(self.max_for(k.2).saturating_sub(w.count));
            }
        }

        RateLimitDecision {
            allowed: true,
            remaining,
            retry_after_secs: 0,
        }
    }

    /// Give back one counted send, e.g. when the request it was charged for
    /// never reached the queue. Blocks stay in place.
    pub fn refund(&self, tenant: TenantId, session: &SessionId) {
        let mut windows = self.lock();
        for g in Granularity::ALL {
            if let Some(w) = windows.get_mut(&(tenant, session.clone(), g)) {
                w.count = w.count.saturating_sub(1);
            }
        }
    }

    pub fn status(&self, tenant: TenantId, session: &SessionId) -> RateLimitStatus {
        self.status_at(tenant, session, Utc::now())
    }

    /// Current counters of a key, without counting a call.
    pub fn status_at(
        &self,
        tenant: TenantId,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> RateLimitStatus {
        let windows = self.lock();
        let views: Vec<_> = Granularity::ALL
            .into_iter()
            .map(|g| {
                let max = self.max_for(g);
                match windows.get(&(tenant, session.clone(), g)) {
                    Some(w) if !w.is_stale(now) => WindowStatus {
                        granularity: g,
                        count: w.count,
                        max,
                        reset_at: w.reset_at,
                        blocked_until: w.blocked_until.filter(|u| *u > now),
                    },
                    _ => WindowStatus {
                        granularity: g,
                        count: 0,
                        max,
                        reset_at: now + g.length(),
                        blocked_until: None,
                    },
                }
            })
            .collect();

        RateLimitStatus {
            tenant_id: tenant,
            session_id: session.clone(),
            blocked: views.iter().any(|v| v.blocked_until.is_some()),
            windows: views,
        }
    }

    /// Forget every counter and block of a key.
    pub fn reset(&self, tenant: TenantId, session: &SessionId) {
        let mut windows = self.lock();
        for g in Granularity::ALL {
            windows.remove(&(tenant, session.clone(), g));
        }
        debug!(tenant_id = %tenant, session_id = %session, "rate limit reset");
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Drop expired, unblocked windows. Returns how many were removed.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| !w.is_stale(now));
        before - windows.len()
    }

    /// Number of live windows.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn secs_until(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let ms = (until - now).num_milliseconds().max(0) as u64;
    ms.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    fn session() -> SessionId {
        SessionId::new("main").unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn twenty_first_call_in_a_minute_is_denied() {
        let rl = limiter();
        let tenant = TenantId::new();
        let now = Utc::now();

        for i in 0..20 {
            let d = rl.check_and_increment_at(tenant, &session(), now);
            assert!(d.allowed, "call {} should pass", i + 1);
            assert_eq!(d.remaining, 19 - i);
        }

        let denied = rl.check_and_increment_at(tenant, &session(), now);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 300);
    }

    #[test]
    fn call_after_window_reset_succeeds_when_nothing_was_denied() {
        let rl = limiter();
        let tenant = TenantId::new();
        let now = Utc::now();

        for _ in 0..20 {
            assert!(rl.check_and_increment_at(tenant, &session(), now).allowed);
        }

        let later = rl.check_and_increment_at(tenant, &session(), now + secs(61));
        assert!(later.allowed);
        assert_eq!(later.remaining, 19);
    }

    #[test]
    fn block_outlives_window_reset() {
        let rl = limiter();
        let tenant = TenantId::new();
        let now = Utc::now();

        for _ in 0..21 {
            rl.check_and_increment_at(tenant, &session(), now);
        }

        let after_reset = rl.check_and_increment_at(tenant, &session(), now + secs(61));
        assert!(!after_reset.allowed);
        assert_eq!(after_reset.retry_after_secs, 300 - 61);

        let after_block = rl.check_and_increment_at(tenant, &session(), now + secs(301));
        assert!(after_block.allowed);
    }

    #[test]
    fn hourly_window_is_enforced() {
        let rl = RateLimiter::new(RateLimitConfig {
            per_minute: 1_000,
            per_hour: 3,
            ..RateLimitConfig::default()
        });
        let tenant = TenantId::new();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(rl.check_and_increment_at(tenant, &session(), now).allowed);
        }
        assert!(!rl.check_and_increment_at(tenant, &session(), now + secs(120)).allowed);
    }

    #[test]
    fn keys_are_isolated() {
        let rl = RateLimiter::new(RateLimitConfig {
            per_minute: 1,
            ..RateLimitConfig::default()
        });
        let a = TenantId::new();
        let b = TenantId::new();
        let now = Utc::now();

        assert!(rl.check_and_increment_at(a, &session(), now).allowed);
        assert!(!rl.check_and_increment_at(a, &session(), now).allowed);
        assert!(rl.check_and_increment_at(b, &session(), now).allowed);
        assert!(
            rl.check_and_increment_at(a, &SessionId::new("other").unwrap(), now)
                .allowed
        );
    }

    #[test]
    fn status_and_reset() {
        let rl = RateLimiter::new(RateLimitConfig {
            per_minute: 1,
            ..RateLimitConfig::default()
        });
        let tenant = TenantId::new();
        let now = Utc::now();

        rl.check_and_increment_at(tenant, &session(), now);
        rl.check_and_increment_at(tenant, &session(), now);
        let status = rl.status_at(tenant, &session(), now);
        assert!(status.blocked);
        assert_eq!(status.windows[0].count, 1);

        rl.reset(tenant, &session());
        assert!(rl.check_and_increment_at(tenant, &session(), now).allowed);
    }

    #[test]
    fn refund_returns_the_budget_but_keeps_blocks() {
        let rl = RateLimiter::new(RateLimitConfig {
            per_minute: 2,
            ..RateLimitConfig::default()
        });
        let tenant = TenantId::new();
        let now = Utc::now();

        assert_eq!(rl.check_and_increment_at(tenant, &session(), now).remaining, 1);
        rl.refund(tenant, &session());
        assert_eq!(rl.check_and_increment_at(tenant, &session(), now).remaining, 1);
        assert!(rl.check_and_increment_at(tenant, &session(), now).allowed);
        assert!(!rl.check_and_increment_at(tenant, &session(), now).allowed);

        rl.refund(tenant, &session());
        assert!(!rl.check_and_increment_at(tenant, &session(), now).allowed);

        // Refunding an unknown key is a no-op.
        rl.refund(TenantId::new(), &session());
        assert_eq!(rl.len(), 2);
    }

    #[test]
    fn sweep_drops_only_stale_unblocked_windows() {
        let rl = RateLimiter::new(RateLimitConfig {
            per_minute: 1,
            ..RateLimitConfig::default()
        });
        let now = Utc::now();
        let idle = TenantId::new();
        let blocked = TenantId::new();

        rl.check_and_increment_at(idle, &session(), now);
        rl.check_and_increment_at(blocked, &session(), now);
        rl.check_and_increment_at(blocked, &session(), now);
        assert_eq!(rl.len(), 4);

        // Minute windows expired; the blocked key's windows survive.
        assert_eq!(rl.sweep_at(now + secs(90)), 1);
        // Hour windows expired, block elapsed.
        assert_eq!(rl.sweep_at(now + secs(3_601)), 3);
        assert!(rl.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: within any single minute no more than `per_minute`
        /// calls are allowed, whatever their spacing.
        #[test]
        fn never_allows_more_than_max_per_window(
            offsets in prop::collection::vec(0i64..60_000, 1..80),
            per_minute in 1u32..30,
        ) {
            let rl = RateLimiter::new(RateLimitConfig {
                per_minute,
                per_hour: 10_000,
                ..RateLimitConfig::default()
            });
            let tenant = TenantId::new();
            let start = Utc::now();
            let mut offsets = offsets;
            offsets.sort_unstable();

            let allowed = offsets
                .iter()
                .filter(|ms| {
                    rl.check_and_increment_at(tenant, &session(), start + chrono::Duration::milliseconds(**ms))
                        .allowed
                })
                .count();

            prop_assert!(allowed as u32 <= per_minute);
        }
    }
}
