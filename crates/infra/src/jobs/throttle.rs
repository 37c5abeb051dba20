//! Pool-wide jobs/second cap.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding one-second window shared by every worker of a pool.
///
/// Independent of per-tenant rate limits; this protects the provider's own
/// throughput limit.
#[derive(Debug)]
pub struct Throttle {
    max_per_second: u32,
    started: Mutex<VecDeque<Instant>>,
}

const WINDOW: Duration = Duration::from_secs(1);

impl Throttle {
    /// `max_per_second == 0` disables throttling.
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            started: Mutex::new(VecDeque::with_capacity(max_per_second as usize)),
        }
    }

    /// Wait until one more job may start, then record it.
    pub async fn acquire(&self) {
        if self.max_per_second == 0 {
            return;
        }
        loop {
            let wait = {
                let mut started = self.started.lock().await;
                let now = Instant::now();
                while started.front().is_some_and(|t| now.duration_since(*t) >= WINDOW) {
                    started.pop_front();
                }
                if started.len() < self.max_per_second as usize {
                    started.push_back(now);
                    return;
                }
                match started.front() {
                    Some(oldest) => WINDOW.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn caps_starts_per_second() {
        let throttle = Throttle::new(3);
        let begin = Instant::now();

        for _ in 0..3 {
            throttle.acquire().await;
        }
        assert!(begin.elapsed() < Duration::from_millis(10));

        throttle.acquire().await;
        assert!(begin.elapsed() >= WINDOW);
    }

    #[tokio::test]
    async fn zero_disables_the_cap() {
        let throttle = Throttle::new(0);
        for _ in 0..1_000 {
            throttle.acquire().await;
        }
    }
}
