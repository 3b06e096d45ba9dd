use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time cache counters, taken under one lock so the rate math
/// always agrees with the counts it was derived from.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_percent: f64,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    seq: u64,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// Recency index: lowest seq is the least recently used key.
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// In-memory response cache with per-entry TTL and strict LRU eviction.
///
/// Expiry is lazy: an entry past its deadline is dropped by the read that
/// finds it and counted as a miss. At capacity, inserting a new key evicts
/// exactly the least recently used entry; both hits and writes refresh
/// recency. Every operation takes one mutex and touches no I/O, so calls
/// sit directly on the request path.
pub struct TtlLruCache<V> {
    inner: Mutex<Inner<V>>,
    max_size: usize,
    ttl: Duration,
}

impl<V: Clone> TtlLruCache<V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size: max_size.max(1),
            ttl,
        }
    }

    /// Looks up `key`, expiring it on the spot if its TTL has passed.
    /// A hit refreshes recency.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let found = inner.entries.get(key).map(|e| (e.expires_at, e.seq));
        match found {
            None => {
                inner.misses += 1;
                None
            }
            Some((expires_at, seq)) if expires_at <= now => {
                inner.entries.remove(key);
                inner.recency.remove(&seq);
                inner.misses += 1;
                None
            }
            Some(_) => {
                inner.hits += 1;
                inner.touch(key);
                inner.entries.get(key).map(|e| e.value.clone())
            }
        }
    }

    /// Inserts or replaces `key`. A replacement refreshes the TTL deadline
    /// and recency without evicting; a new key at capacity evicts the LRU
    /// entry first.
    pub fn set(&self, key: &str, value: V) {
        let expires_at = Instant::now() + self.ttl;
        let mut inner = self.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            entry.value = value;
            entry.expires_at = expires_at;
            inner.touch(key);
            return;
        }

        if inner.entries.len() >= self.max_size {
            if let Some((_, victim)) = inner.recency.pop_first() {
                inner.entries.remove(&victim);
                inner.evictions += 1;
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.recency.insert(seq, key.to_string());
        inner
            .entries
            .insert(key.to_string(), Entry { value, expires_at, seq });
    }

    /// Removes `key`, reporting whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.recency.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    /// Drops every entry and resets the counters. Invalidation is all or
    /// nothing; there is no keyed or prefix variant.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters. Expired entries are counted in place, not
    /// swept; they still age out lazily on their next read.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.lock();

        let total = inner.entries.len();
        let expired = inner
            .entries
            .values()
            .filter(|e| e.expires_at <= now)
            .count();
        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64 * 100.0
        };

        CacheStats {
            total_entries: total,
            expired_entries: expired,
            active_entries: total - expired,
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate_percent: (hit_rate * 100.0).round() / 100.0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // The map and the recency index are only ever updated together under
        // this lock, so a guard recovered from poisoning is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<V> Inner<V> {
    fn touch(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.seq);
            entry.seq = self.next_seq;
            self.next_seq += 1;
            self.recency.insert(entry.seq, key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cache(max: usize, ttl_ms: u64) -> TtlLruCache<String> {
        TtlLruCache::new(max, Duration::from_millis(ttl_ms))
    }

    #[test]
    fn get_returns_inserted_value() {
        let c = cache(10, 60_000);
        c.set("a", "one".into());
        assert_eq!(c.get("a"), Some("one".into()));

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn absent_key_counts_as_miss() {
        let c = cache(10, 60_000);
        assert_eq!(c.get("nope"), None);
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn expired_entry_is_dropped_on_read() {
        let c = cache(10, 20);
        c.set("a", "one".into());
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(c.stats().expired_entries, 1);
        assert_eq!(c.get("a"), None);
        assert_eq!(c.len(), 0);

        let stats = c.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let c = cache(3, 60_000);
        c.set("a", "1".into());
        c.set("b", "2".into());
        c.set("c", "3".into());

        // Touch "a" so "b" becomes the eviction victim.
        assert!(c.get("a").is_some());
        c.set("d", "4".into());

        assert_eq!(c.len(), 3);
        assert_eq!(c.get("b"), None);
        assert!(c.get("a").is_some());
        assert!(c.get("c").is_some());
        assert!(c.get("d").is_some());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn overwrite_refreshes_recency_without_evicting() {
        let c = cache(2, 60_000);
        c.set("a", "1".into());
        c.set("b", "2".into());
        c.set("a", "1b".into());
        assert_eq!(c.stats().evictions, 0);

        c.set("c", "3".into());
        assert_eq!(c.get("b"), None);
        assert_eq!(c.get("a"), Some("1b".into()));
        assert!(c.get("c").is_some());
    }

    #[test]
    fn delete_reports_presence() {
        let c = cache(10, 60_000);
        c.set("a", "1".into());
        assert!(c.delete("a"));
        assert!(!c.delete("a"));
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn clear_resets_counters() {
        let c = cache(10, 60_000);
        c.set("a", "1".into());
        c.get("a");
        c.get("missing");
        c.clear();

        let stats = c.stats();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate_percent, 0.0);
    }

    #[test]
    fn hit_rate_rounds_to_two_decimals() {
        let c = cache(10, 60_000);
        c.set("a", "1".into());
        c.get("a");
        c.get("x");
        c.get("y");
        assert_eq!(c.stats().hit_rate_percent, 33.33);
    }

    #[test]
    fn concurrent_access_keeps_counters_consistent() {
        let c = Arc::new(cache(64, 60_000));
        let mut handles = Vec::new();

        for t in 0..8u64 {
            let c = Arc::clone(&c);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    let key = format!("k{}", (t * 7 + i) % 96);
                    c.set(&key, format!("v{}", i));
                    c.get(&key);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = c.stats();
        assert_eq!(stats.hits + stats.misses, 800);
        assert!(stats.total_entries <= 64);
    }
}
