//! Time-bounded LRU cache for deterministic verification results.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::metrics;
use crate::model::{RequestKind, Verdict, VerificationResult};

#[derive(Clone)]
struct Entry {
    result: Arc<VerificationResult>,
    stored_at: Instant,
}

impl Entry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.stored_at) <= ttl
    }
}

pub struct VerificationCache {
    inner: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl VerificationCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("non-zero capacity");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    fn key(org_id: &str, fingerprint: &str) -> String {
        format!("{org_id}:{fingerprint}")
    }

    pub fn get(&self, org_id: &str, fingerprint: &str) -> Option<Arc<VerificationResult>> {
        let key = Self::key(org_id, fingerprint);
        let now = Instant::now();
        let mut guard = self.inner.lock();
        match guard.get(&key) {
            Some(entry) if entry.is_fresh(now, self.ttl) => {
                metrics::CACHE_EVENTS.with_label_values(&["hit"]).inc();
                Some(entry.result.clone())
            }
            Some(_) => {
                guard.pop(&key);
                metrics::CACHE_EVENTS.with_label_values(&["expired"]).inc();
                None
            }
            None => {
                metrics::CACHE_EVENTS.with_label_values(&["miss"]).inc();
                None
            }
        }
    }

    /// Store a result if its kind and verdict are cacheable at all.
    pub fn put(
        &self,
        org_id: &str,
        fingerprint: &str,
        kind: RequestKind,
        result: &VerificationResult,
    ) {
        if !cacheable(kind, result.verdict) {
            return;
        }
        let entry = Entry {
            result: Arc::new(result.clone()),
            stored_at: Instant::now(),
        };
        self.inner.lock().put(Self::key(org_id, fingerprint), entry);
    }
}

/// Only successful results of deterministic engines may be replayed.
fn cacheable(kind: RequestKind, verdict: Verdict) -> bool {
    kind.deterministic()
        && matches!(
            verdict,
            Verdict::Verified | Verdict::Corrected | Verdict::Sat | Verdict::Unsat | Verdict::Unsafe
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(verdict: Verdict) -> VerificationResult {
        VerificationResult::bare(verdict, json!({"ok": true}))
    }

    #[test]
    fn hit_within_ttl() {
        let cache = VerificationCache::new(8, Duration::from_secs(60));
        cache.put("org", "fp", RequestKind::NaturalLanguage, &result(Verdict::Verified));
        let hit = cache.get("org", "fp").expect("cached");
        assert_eq!(hit.verdict, Verdict::Verified);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = VerificationCache::new(8, Duration::ZERO);
        cache.put("org", "fp", RequestKind::Logic, &result(Verdict::Sat));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("org", "fp").is_none());
    }

    #[test]
    fn nondeterministic_kinds_never_cache() {
        let cache = VerificationCache::new(8, Duration::from_secs(60));
        cache.put("org", "fp", RequestKind::Fact, &result(Verdict::Supported));
        cache.put("org", "fp2", RequestKind::Image, &result(Verdict::Verified));
        assert!(cache.get("org", "fp").is_none());
        assert!(cache.get("org", "fp2").is_none());
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = VerificationCache::new(8, Duration::from_secs(60));
        cache.put("org", "fp", RequestKind::Logic, &result(Verdict::Failed));
        cache.put("org", "fp2", RequestKind::Logic, &result(Verdict::Error));
        assert!(cache.get("org", "fp").is_none());
        assert!(cache.get("org", "fp2").is_none());
    }

    #[test]
    fn tenants_do_not_share_entries() {
        let cache = VerificationCache::new(8, Duration::from_secs(60));
        cache.put("org-a", "fp", RequestKind::Sql, &result(Verdict::Unsafe));
        assert!(cache.get("org-b", "fp").is_none());
        assert!(cache.get("org-a", "fp").is_some());
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = VerificationCache::new(2, Duration::from_secs(60));
        cache.put("org", "a", RequestKind::Code, &result(Verdict::Verified));
        cache.put("org", "b", RequestKind::Code, &result(Verdict::Verified));
        cache.put("org", "c", RequestKind::Code, &result(Verdict::Verified));
        assert!(cache.get("org", "a").is_none());
        assert!(cache.get("org", "c").is_some());
    }
}
