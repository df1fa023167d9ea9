//! Per-caller rate limiting with a weighted sliding window.
//!
//! Two fixed windows are kept: `current`, which is being filled, and
//! `previous`, which is frozen at the last rotation. The number of requests a
//! caller made during the last `duration` is approximated as
//!
//! ```text
//! current(key) + previous(key) * (duration - elapsed_since_rotation) / duration
//! ```
//!
//! so memory stays proportional to the number of callers seen in two windows.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

struct Window<K> {
    started: Instant,
    counters: HashMap<K, u64>,
}

impl<K: Hash + Eq> Window<K> {
    fn new(started: Instant) -> Self {
        Self {
            started,
            counters: HashMap::new(),
        }
    }

    fn count(&self, key: &K) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    fn increment(&mut self, key: K) {
        *self.counters.entry(key).or_insert(0) += 1;
    }
}

struct Windows<K> {
    previous: Window<K>,
    current: Window<K>,
}

/// Rate limiter implementing the weighted window algorithm
pub struct WeightedWindowLimiter<K = IpAddr> {
    limit: u64,
    duration: Duration,
    windows: Mutex<Windows<K>>,
}

impl<K: Hash + Eq> WeightedWindowLimiter<K> {
    /// Allow at most `limit` requests per caller within `duration`.
    pub fn new(limit: u64, duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            limit,
            duration,
            windows: Mutex::new(Windows {
                previous: Window::new(now),
                current: Window::new(now),
            }),
        }
    }

    /// Tells if a request from `key` should be handled. An allowed request is
    /// counted in the same critical section; a rejected one is not counted.
    pub fn allow(&self, key: K) -> bool {
        let mut windows = self.lock();
        let estimate = self.weighted_previous(&windows, &key) + windows.current.count(&key);
        if estimate >= self.limit {
            return false;
        }
        windows.current.increment(key);
        true
    }

    /// Rotates the windows every `duration` until `shutdown` completes.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.duration.is_zero() {
            shutdown.await;
            return;
        }

        let mut ticker = interval_at(Instant::now() + self.duration, self.duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Rate limiter rotation stopped");
                    return;
                }
                _ = ticker.tick() => self.rotate(),
            }
        }
    }

    fn rotate(&self) {
        let mut guard = self.lock();
        let windows = &mut *guard;
        windows.previous = std::mem::replace(&mut windows.current, Window::new(Instant::now()));
        debug!(
            tracked_callers = windows.previous.counters.len(),
            "Rate limiter window rotated"
        );
    }

    fn weighted_previous(&self, windows: &Windows<K>, key: &K) -> u64 {
        if self.duration.is_zero() {
            return 0;
        }
        let elapsed = windows.current.started.elapsed();
        if elapsed >= self.duration {
            return 0;
        }
        let remaining = (self.duration - elapsed).as_secs_f64() / self.duration.as_secs_f64();
        (windows.previous.count(key) as f64 * remaining) as u64
    }

    // Counters stay consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, Windows<K>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn test_limit_plus_one_calls() {
        let limiter = WeightedWindowLimiter::new(3, Duration::from_secs(3600));
        let results: Vec<bool> = (0..4).map(|_| limiter.allow(ip(1))).collect();
        assert_eq!(results, vec![true, true, true, false]);
        // rejected calls are not counted, so the caller stays at the limit
        assert!(!limiter.allow(ip(1)));
    }

    #[test]
    fn test_callers_are_independent() {
        let limiter = WeightedWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));
        assert!(limiter.allow(ip(2)));
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let limiter = WeightedWindowLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.allow(ip(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_previous_window_decays() {
        let limiter = WeightedWindowLimiter::new(4, Duration::from_secs(100));
        for _ in 0..4 {
            assert!(limiter.allow(ip(1)));
        }

        limiter.rotate();
        // right after rotation the previous window still weighs fully
        assert!(!limiter.allow(ip(1)));

        tokio::time::advance(Duration::from_secs(50)).await;
        // 4 * 0.5 = 2 carried over, leaving room for two more
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));

        tokio::time::advance(Duration::from_secs(50)).await;
        // previous window has fully aged out; 2 in current
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));
    }

    #[test]
    fn test_zero_duration_ignores_previous_window() {
        let limiter = WeightedWindowLimiter::new(2, Duration::ZERO);
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));

        limiter.rotate();
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_rotates_windows() {
        let duration = Duration::from_secs(10);
        let limiter = Arc::new(WeightedWindowLimiter::new(2, duration));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let runner = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .run(async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));

        tokio::time::sleep(duration + Duration::from_secs(1)).await;
        // one rotation happened 1s ago: 2 * 0.9 = 1 carried over
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));

        stop_tx.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_with_zero_duration_waits_for_shutdown() {
        let limiter = WeightedWindowLimiter::<IpAddr>::new(1, Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(1), limiter.run(async {}))
            .await
            .expect("run should return once shutdown completes");
    }
}
