//! Dual token-bucket rate limiting on fixed one-minute windows.
//!
//! One bucket per API-key fingerprint plus a single global bucket; both are
//! checked and the stricter verdict wins. Buckets reset lazily on the first
//! arrival in a new epoch minute.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub per_key: u32,
    pub global: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Seconds until the next window opens.
    Limited { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    window_start_minute: u64,
    count: u32,
}

impl Bucket {
    /// Returns true if this arrival fits in the window.
    fn admit(&mut self, minute: u64, capacity: u32) -> bool {
        if self.window_start_minute != minute {
            self.window_start_minute = minute;
            self.count = 0;
        }
        if self.count < capacity {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    global: Mutex<Bucket>,
    limits: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(limits: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            global: Mutex::new(Bucket::default()),
            limits,
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, SystemTime::now())
    }

    /// Clock-injectable variant used by tests.
    pub fn check_at(&self, key: &str, now: SystemTime) -> RateDecision {
        let since_epoch = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let minute = since_epoch / 60;
        let retry_after_secs = 60 - (since_epoch % 60);

        // Global bucket first: a saturated gateway rejects regardless of key.
        {
            let mut global = self.global.lock();
            if !global.admit(minute, self.limits.global) {
                return RateDecision::Limited { retry_after_secs };
            }
        }

        let mut entry = self.buckets.entry(key.to_string()).or_default();
        if entry.admit(minute, self.limits.per_key) {
            RateDecision::Allowed
        } else {
            RateDecision::Limited { retry_after_secs }
        }
    }

    /// Drop buckets whose window is long gone. Called opportunistically.
    pub fn prune_idle(&self, now: SystemTime, max_idle_windows: u64) -> usize {
        let minute = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
            / 60;
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter_map(|entry| {
                if minute.saturating_sub(entry.value().window_start_minute) > max_idle_windows {
                    Some(entry.key().clone())
                } else {
                    None
                }
            })
            .collect();
        let mut removed = 0;
        for key in stale {
            if self.buckets.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_minute(minute: u64, offset_secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(minute * 60 + offset_secs)
    }

    #[test]
    fn admits_exactly_capacity_per_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_key: 100,
            global: 1000,
        });
        let now = at_minute(1000, 5);
        for _ in 0..100 {
            assert_eq!(limiter.check_at("key", now), RateDecision::Allowed);
        }
        let RateDecision::Limited { retry_after_secs } = limiter.check_at("key", now) else {
            panic!("101st request must be limited");
        };
        assert!(retry_after_secs <= 60);
    }

    #[test]
    fn window_resets_lazily() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_key: 2,
            global: 1000,
        });
        let first = at_minute(1000, 0);
        assert_eq!(limiter.check_at("key", first), RateDecision::Allowed);
        assert_eq!(limiter.check_at("key", first), RateDecision::Allowed);
        assert!(matches!(
            limiter.check_at("key", first),
            RateDecision::Limited { .. }
        ));
        let next_window = at_minute(1001, 0);
        assert_eq!(limiter.check_at("key", next_window), RateDecision::Allowed);
    }

    #[test]
    fn keys_are_independent_but_global_is_shared() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_key: 10,
            global: 15,
        });
        let now = at_minute(2000, 30);
        for _ in 0..10 {
            assert_eq!(limiter.check_at("a", now), RateDecision::Allowed);
        }
        for _ in 0..5 {
            assert_eq!(limiter.check_at("b", now), RateDecision::Allowed);
        }
        // Key b has per-key room left but the global bucket is spent.
        assert!(matches!(
            limiter.check_at("b", now),
            RateDecision::Limited { .. }
        ));
    }

    #[test]
    fn retry_after_counts_down_within_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_key: 1,
            global: 10,
        });
        let now = at_minute(3000, 45);
        assert_eq!(limiter.check_at("key", now), RateDecision::Allowed);
        let RateDecision::Limited { retry_after_secs } = limiter.check_at("key", now) else {
            panic!("limited");
        };
        assert_eq!(retry_after_secs, 15);
    }

    #[test]
    fn prune_removes_stale_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_key: 5,
            global: 50,
        });
        limiter.check_at("old", at_minute(100, 0));
        limiter.check_at("fresh", at_minute(200, 0));
        let removed = limiter.prune_idle(at_minute(200, 30), 10);
        assert_eq!(removed, 1);
    }
}
