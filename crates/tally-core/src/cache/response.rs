//! TTL-bounded response cache shared across runs.
//!
//! Reads and writes go through `DashMap` shards, so concurrent workers from
//! different runs never contend on a single lock.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Every this many inserts, expired entries are swept from the whole map.
pub const PURGE_EVERY: u64 = 256;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for `key`, evicting it if expired.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let hit = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(entry) => {
                drop(entry);
                self.entries.remove_if(key, |_, e| e.is_expired());
                None
            }
            None => None,
        };
        match hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    /// Insert `value` for `ttl`. Entries nobody reads again are dropped by a
    /// periodic sweep.
    pub fn insert(&self, key: String, value: serde_json::Value, ttl: Duration) {
        let n = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if n % PURGE_EVERY == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "swept expired cache entries");
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = ResponseCache::new();
        cache.insert("k".into(), json!(0.7), Duration::from_millis(0));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().entries, 0);

        cache.insert("k".into(), json!(0.7), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(json!(0.7)));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn purge_drops_only_expired() {
        let cache = ResponseCache::new();
        cache.insert("old".into(), json!(1), Duration::from_millis(0));
        cache.insert("new".into(), json!(2), Duration::from_secs(60));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get("new"), Some(json!(2)));
    }

    #[test]
    fn unread_expired_entries_are_swept_by_inserts() {
        let cache = ResponseCache::new();
        for i in 0..PURGE_EVERY - 1 {
            cache.insert(format!("stale-{}", i), json!(i), Duration::from_millis(0));
        }
        assert_eq!(cache.stats().entries, (PURGE_EVERY - 1) as usize);

        cache.insert("fresh".into(), json!(1), Duration::from_secs(60));
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.get("fresh"), Some(json!(1)));
    }

    #[test]
    fn concurrent_inserts_from_threads() {
        let cache = std::sync::Arc::new(ResponseCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.insert(format!("{}-{}", t, i), json!(i), Duration::from_secs(60));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.stats().entries, 800);
    }
}
