pub mod cache;
pub mod classifier;
pub mod engine;
pub mod upstream;

pub use cache::{CacheStore, ProxyCache};
pub use engine::{router, ProxyDispatcher};

/// Where the body of a response came from, reported in `x-proxy-cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh bypass entry, no upstream call.
    Hit,
    /// Forwarded to the upstream and written to the cache.
    Miss,
    /// Upstream unreachable, last good path-keyed body replayed.
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
        }
    }
}

/// Fully buffered response on its way back to the client.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: axum::http::StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: bytes::Bytes,
    pub cache: CacheStatus,
}

impl ProxyResponse {
    pub fn from_cache(cached: cache::CachedResponse, cache: CacheStatus) -> Self {
        Self {
            status: cached.status,
            headers: cached.headers,
            body: cached.body,
            cache,
        }
    }
}
