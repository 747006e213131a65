use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Key under which an upstream response is cached.
///
/// Bypass keys render as `path ++ hex(sha256(body))` and path keys render as
/// the bare path. Keeping the two shapes as distinct variants means a
/// path-keyed entry can never shadow a bypass entry with the same text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Bypass { path: String, digest: String },
    Path(String),
}

impl CacheKey {
    pub fn bypass(path: &str, body: &[u8]) -> Self {
        CacheKey::Bypass {
            path: path.to_string(),
            digest: hex::encode(Sha256::digest(body)),
        }
    }

    pub fn path(path: &str) -> Self {
        CacheKey::Path(path.to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Bypass { path, digest } => write!(f, "{}{}", path, digest),
            CacheKey::Path(path) => f.write_str(path),
        }
    }
}

/// How long a cache entry stays servable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Never,
    After(Duration),
}

/// Upstream status, payload and headers as they were when the entry was written.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub headers: HeaderMap,
}

/// Shared response store used by the dispatcher.
///
/// Implementations must tolerate any number of concurrent callers. A `None`
/// from `get` is an ordinary miss, including for entries whose TTL elapsed.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<CachedResponse>;

    /// Store `response` under `key`, replacing any previous entry.
    fn put(&self, key: CacheKey, response: CachedResponse, expiry: Expiry);
}

#[derive(Debug)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(response: CachedResponse, expiry: Expiry) -> Self {
        let expires_at = match expiry {
            Expiry::Never => None,
            // A TTL past the end of the clock never elapses.
            Expiry::After(ttl) => Instant::now().checked_add(ttl),
        };
        Self { response, expires_at }
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug, Default)]
struct CacheStatistics {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    expired: AtomicU64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub expired: u64,
}

/// In-memory response cache with per-entry expiry.
///
/// Backed by a sharded map, so readers and writers only contend on the shard
/// holding their key. Nothing is evicted except entries whose TTL elapsed.
#[derive(Debug, Default)]
pub struct ProxyCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    statistics: Arc<CacheStatistics>,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            self.statistics.expired.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Periodically purge expired entries until the returned task is aborted.
    /// `on_sweep` sees the counters after every pass.
    pub fn spawn_sweeper<F>(self: &Arc<Self>, period: Duration, on_sweep: F) -> JoinHandle<()>
    where
        F: Fn(&CacheStats) + Send + 'static,
    {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                interval.tick().await;

                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!("Swept {} expired cache entries, {} remain", removed, cache.len());
                }
                on_sweep(&cache.stats());
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.statistics.hits.load(Ordering::Relaxed),
            misses: self.statistics.misses.load(Ordering::Relaxed),
            writes: self.statistics.writes.load(Ordering::Relaxed),
            expired: self.statistics.expired.load(Ordering::Relaxed),
        }
    }
}

impl CacheStore for ProxyCache {
    fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                self.statistics.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache HIT for key: {}", key);
                return Some(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };

        // Only remove the entry if it is still the expired one; a concurrent
        // put may already have replaced it.
        if expired && self.entries.remove_if(key, |_, entry| entry.is_expired_at(now)).is_some() {
            self.statistics.expired.fetch_add(1, Ordering::Relaxed);
            debug!("Cache MISS (expired) for key: {}", key);
        } else {
            debug!("Cache MISS for key: {}", key);
        }

        self.statistics.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn put(&self, key: CacheKey, response: CachedResponse, expiry: Expiry) {
        let size = response.body.len();
        debug!("Cache SET for key: {}, expiry: {:?}, size: {} bytes", key, expiry, size);

        self.entries.insert(key, CacheEntry::new(response, expiry));
        self.statistics.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn response(body: &'static str) -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        CachedResponse {
            status: StatusCode::OK,
            body: Bytes::from_static(body.as_bytes()),
            headers,
        }
    }

    #[test]
    fn test_bypass_key_is_path_plus_sha256_hex() {
        let key = CacheKey::bypass("/api/models/x", b"");
        assert_eq!(
            key.to_string(),
            "/api/models/xe3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_bypass_key_depends_on_body() {
        let a = CacheKey::bypass("/api/models/x", br#"{"a":1}"#);
        let b = CacheKey::bypass("/api/models/x", br#"{"a":2}"#);
        assert_ne!(a, b);
        assert_eq!(a, CacheKey::bypass("/api/models/x", br#"{"a":1}"#));
    }

    #[test]
    fn test_path_and_bypass_keys_never_alias() {
        let bypass = CacheKey::bypass("/x", b"body");
        let path = CacheKey::path(&bypass.to_string());
        assert_eq!(bypass.to_string(), path.to_string());
        assert_ne!(bypass, path);

        let cache = ProxyCache::new();
        cache.put(bypass.clone(), response("bypass"), Expiry::Never);
        cache.put(path.clone(), response("path"), Expiry::Never);

        assert_eq!(cache.get(&bypass).unwrap().body, "bypass");
        assert_eq!(cache.get(&path).unwrap().body, "path");
    }

    #[test]
    fn test_put_overwrites_existing_entry() {
        let cache = ProxyCache::new();
        let key = CacheKey::path("/catalog");

        cache.put(key.clone(), response("v1"), Expiry::Never);
        cache.put(key.clone(), response("v2"), Expiry::Never);

        let cached = cache.get(&key).unwrap();
        assert_eq!(cached.body, "v2");
        assert_eq!(cached.headers["content-type"], "application/json");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().writes, 2);
    }

    #[test]
    fn test_miss_on_unknown_key() {
        let cache = ProxyCache::new();
        assert!(cache.get(&CacheKey::path("/nothing")).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_entry_expires() {
        let cache = ProxyCache::new();
        let key = CacheKey::bypass("/api/models/x", b"{}");
        cache.put(key.clone(), response("fresh"), Expiry::After(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&key).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_expiring_entry_survives() {
        let cache = ProxyCache::new();
        let key = CacheKey::path("/catalog");
        cache.put(key.clone(), response("stale but valid"), Expiry::Never);

        tokio::time::advance(Duration::from_secs(60 * 60 * 24 * 30)).await;
        assert_eq!(cache.get(&key).unwrap().body, "stale but valid");
    }

    #[tokio::test]
    async fn test_ttl_beyond_clock_range_never_expires() {
        let cache = ProxyCache::new();
        let key = CacheKey::bypass("/api/models/x", b"{}");
        cache.put(key.clone(), response("long lived"), Expiry::After(Duration::MAX));

        assert_eq!(cache.get(&key).unwrap().body, "long lived");
        assert_eq!(cache.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_live_entries() {
        let cache = ProxyCache::new();
        cache.put(CacheKey::path("/a"), response("a"), Expiry::Never);
        cache.put(CacheKey::bypass("/b", b"1"), response("b"), Expiry::After(Duration::from_secs(10)));
        cache.put(CacheKey::bypass("/c", b"2"), response("c"), Expiry::After(Duration::from_secs(120)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(ProxyCache::new());
        cache.put(CacheKey::bypass("/b", b"1"), response("b"), Expiry::After(Duration::from_secs(5)));

        let sweeps = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sweeps);
        let sweeper = cache.spawn_sweeper(Duration::from_secs(10), move |stats| {
            assert_eq!(stats.entries, 0);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(cache.len(), 0);
        assert_eq!(sweeps.load(Ordering::SeqCst), 1);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(ProxyCache::new());
        let mut tasks = Vec::new();

        for i in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                let key = CacheKey::path(&format!("/item/{}", i % 4));
                for _ in 0..100 {
                    cache.put(key.clone(), response("payload"), Expiry::Never);
                    assert!(cache.get(&key).is_some());
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().writes, 1600);
    }
}
