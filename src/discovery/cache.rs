//! Discovery Cache
//!
//! Client-side TTL map in front of discovery queries. An entry is never
//! returned at or after its expiry instant.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

pub struct DiscoveryCache<V = String> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,

    hits: AtomicU64,

    misses: AtomicU64,
}

impl<V: Clone> DiscoveryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if now < entry.expires_at => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// A zero TTL stores nothing and drops any previous value.
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let mut entries = self.entries.lock();
        if ttl.is_zero() {
            entries.remove(key);
            return;
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<V: Clone> Default for DiscoveryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,

    pub misses: u64,

    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = DiscoveryCache::new();
        cache.set("budget", "http://localhost:8013".to_string(), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("budget").as_deref(), Some("http://localhost:8013"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("budget"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_stats() {
        let cache = DiscoveryCache::new();
        cache.set("athena", "http://athena:8005".to_string(), Duration::from_secs(10));
        assert!(cache.get("athena").is_some());
        assert!(cache.invalidate("athena"));
        assert!(cache.get("athena").is_none());
        assert!(!cache.invalidate("athena"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_not_cached() {
        let cache = DiscoveryCache::new();
        cache.set("engram", "http://localhost:8000".to_string(), Duration::from_secs(5));
        cache.set("engram", "http://localhost:8000".to_string(), Duration::ZERO);
        assert!(cache.get("engram").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache: DiscoveryCache<Vec<String>> = DiscoveryCache::new();
        cache.set("short", vec!["a".into()], Duration::from_secs(1));
        cache.set("long", vec!["b".into()], Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
