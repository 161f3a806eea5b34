//! In-memory response cache.
//!
//! Keyed by canonicalized request URL (path + sorted query). Entries carry a
//! TTL; eviction is lazy on read plus a periodic sweep. One writer (the
//! ingestion engine) and many readers in the default topology, but the cache
//! itself is safe for any mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

struct CacheEntry {
    body: Value,
    fetched_at: DateTime<Utc>,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Canonical cache key: URL plus query pairs sorted by key then value.
    pub fn canonical_key(url: &str, query: &[(String, String)]) -> String {
        let mut pairs: Vec<&(String, String)> = query.iter().collect();
        pairs.sort();
        let mut key = url.trim_end_matches('/').to_string();
        for (i, (k, v)) in pairs.iter().enumerate() {
            key.push(if i == 0 { '?' } else { '&' });
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    /// Returns the cached body and its fetch time, or None when absent or
    /// expired. Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<(Value, DateTime<Utc>)> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(e) if e.expires_at > Instant::now() => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some((e.body.clone(), e.fetched_at));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: upgrade to a write lock and drop it.
        self.entries.write().remove(key);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: String, body: Value) {
        self.put_with_ttl(key, body, self.default_ttl);
    }

    pub fn put_with_ttl(&self, key: String, body: Value, ttl: Duration) {
        let entry = CacheEntry {
            body,
            fetched_at: Utc::now(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key, entry);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.read().len(),
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
    fn canonical_key_sorts_query() {
        let a = ResponseCache::canonical_key(
            "https://x/projections",
            &[
                ("league_id".into(), "7".into()),
                ("include".into(), "league".into()),
            ],
        );
        let b = ResponseCache::canonical_key(
            "https://x/projections",
            &[
                ("include".into(), "league".into()),
                ("league_id".into(), "7".into()),
            ],
        );
        assert_eq!(a, b);
        assert_eq!(a, "https://x/projections?include=league&league_id=7");
    }

    #[test]
    fn put_get_roundtrip_and_overwrite() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.put("k".into(), json!({"v": 1}));
        let (body, _) = cache.get("k").unwrap();
        assert_eq!(body["v"], 1);

        cache.put("k".into(), json!({"v": 2}));
        let (body, _) = cache.get("k").unwrap();
        assert_eq!(body["v"], 2);
    }

    #[test]
    fn expired_entries_are_missed_and_swept() {
        let cache = ResponseCache::new(Duration::from_millis(0));
        cache.put("k".into(), json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());

        cache.put_with_ttl("k2".into(), json!(2), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().entries, 0);
    }
}
