use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::health::LivenessProbe;
use crate::observability::{AccessLogEntry, AccessLogger, MetricsCollector};
use super::{
    cache::{CacheKey, CacheStore, CachedResponse, Expiry},
    classifier::{PathClass, PathClassifier},
    upstream::{UpstreamClient, UpstreamResponse},
    CacheStatus, ProxyResponse,
};

/// Per-request dispatcher between the bypass and stale-fallback protocols.
///
/// Holds no per-request state; the cache is the only thing shared between
/// concurrent requests.
pub struct ProxyDispatcher {
    classifier: PathClassifier,
    cache: Arc<dyn CacheStore>,
    probe: Arc<dyn LivenessProbe>,
    upstream: UpstreamClient,
    bypass_ttl: Duration,
    request_timeout: Duration,
    preserve_status: bool,
    metrics: Arc<MetricsCollector>,
    access_log: Arc<AccessLogger>,
}

/// Response header naming the `CacheStatus` of every successful response.
/// Distinct from `x-cache` so upstream or CDN markers pass through untouched.
pub const CACHE_STATUS_HEADER: &str = "x-proxy-cache";

impl ProxyDispatcher {
    pub fn new(
        config: &Config,
        cache: Arc<dyn CacheStore>,
        probe: Arc<dyn LivenessProbe>,
        metrics: Arc<MetricsCollector>,
        access_log: Arc<AccessLogger>,
    ) -> Result<Self> {
        let upstream = UpstreamClient::new(&config.source_endpoint, &config.upstream)?;

        Ok(Self {
            classifier: PathClassifier::new(config.cache_bypass.clone()),
            cache,
            probe,
            upstream,
            bypass_ttl: config.bypass_ttl(),
            request_timeout: config.server.request_timeout,
            preserve_status: config.upstream.preserve_status,
            metrics,
            access_log,
        })
    }

    /// Handle one inbound request and always produce one response.
    #[instrument(
        skip(self, req),
        fields(
            request_id = tracing::field::Empty,
            method = tracing::field::Empty,
            path = tracing::field::Empty,
            class = tracing::field::Empty
        )
    )]
    pub async fn handle(&self, req: Request) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let start_time = Instant::now();

        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let class = self.classifier.classify(&path);

        tracing::Span::current()
            .record("request_id", request_id.as_str())
            .record("method", parts.method.as_str())
            .record("path", path.as_str())
            .record("class", class.as_str());

        debug!("Processing request {}: {} {} ({})", request_id, parts.method, path, class.as_str());

        let protocol = async {
            match class {
                PathClass::Bypass => self.serve_bypass(&parts, body).await,
                PathClass::PathKeyed => self.serve_with_fallback(&parts, body).await,
            }
        };

        // Bounded here rather than around `handle` so timed-out requests are
        // still counted and logged below.
        let result = match tokio::time::timeout(self.request_timeout, protocol).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::Timeout(self.request_timeout)),
        };

        let (response, cache_label, bytes_sent) = match result {
            Ok(proxy_response) => {
                let cache_label = proxy_response.cache.as_str();
                let bytes_sent = proxy_response.body.len();
                (self.build_response(proxy_response), cache_label, bytes_sent)
            }
            Err(e) => {
                error!("Request {} for {} failed: {}", request_id, path, e);
                (e.into_response(), "-", 0)
            }
        };

        let total_time = start_time.elapsed();
        let status = response.status();
        let outcome = if status.is_server_error() { "error" } else { "ok" };
        self.metrics.record_request(class.as_str(), outcome, total_time.as_secs_f64());

        let entry = AccessLogEntry::new(
            &request_id,
            parts.method.as_str(),
            &path,
            status.as_u16(),
            total_time,
            class.as_str(),
            cache_label,
            bytes_sent,
        );
        if let Err(e) = self.access_log.log(&entry).await {
            warn!("Failed to write access log entry for {}: {}", request_id, e);
        }

        response
    }

    /// Content-addressed protocol: short TTL, never served stale.
    async fn serve_bypass(&self, parts: &Parts, body: Body) -> ProxyResult<ProxyResponse> {
        // Read once; the same bytes feed the hash and the forward.
        let body = read_body(body).await?;
        let key = CacheKey::bypass(parts.uri.path(), &body);

        if let Some(cached) = self.cache.get(&key) {
            self.metrics.record_cache_lookup(PathClass::Bypass.as_str(), true);
            debug!("Serving cached bypass response for {}", key);
            let mut response = ProxyResponse::from_cache(cached, CacheStatus::Hit);
            response.status = self.client_status(response.status);
            return Ok(response);
        }
        self.metrics.record_cache_lookup(PathClass::Bypass.as_str(), false);

        let upstream = self.forward(parts, body).await?;
        self.cache.put(key, cached_copy(&upstream), Expiry::After(self.bypass_ttl));

        Ok(self.upstream_response(upstream))
    }

    /// Path-keyed protocol: probe first, fall back to the last good copy.
    async fn serve_with_fallback(&self, parts: &Parts, body: Body) -> ProxyResult<ProxyResponse> {
        let path = parts.uri.path();
        let alive = self.probe.is_alive().await;
        self.metrics.record_probe(alive);

        if alive {
            // A failure here is reported as-is; the probe verdict stands for
            // this request.
            let body = read_body(body).await?;
            let upstream = self.forward(parts, body).await?;
            self.cache.put(CacheKey::path(path), cached_copy(&upstream), Expiry::Never);

            return Ok(self.upstream_response(upstream));
        }

        match self.cache.get(&CacheKey::path(path)) {
            Some(cached) => {
                self.metrics.record_cache_lookup(PathClass::PathKeyed.as_str(), true);
                self.metrics.record_stale_served();
                info!("Upstream is down, serving cached response for {}", path);

                // Only the body is replayed; stored headers stay in the cache.
                Ok(ProxyResponse {
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    body: cached.body,
                    cache: CacheStatus::Stale,
                })
            }
            None => {
                self.metrics.record_cache_lookup(PathClass::PathKeyed.as_str(), false);
                Err(ProxyError::NoFallbackAvailable { path: path.to_string() })
            }
        }
    }

    async fn forward(&self, parts: &Parts, body: Bytes) -> ProxyResult<UpstreamResponse> {
        match self.upstream.forward(&parts.method, parts.uri.path(), &parts.headers, body).await {
            Ok(response) => {
                self.metrics.record_upstream(response.status.as_u16(), response.elapsed.as_secs_f64());
                Ok(response)
            }
            Err(e) => {
                self.metrics.record_upstream_error(e.error_code());
                Err(e)
            }
        }
    }

    /// The upstream status is only relayed when `preserve_status` is set.
    fn client_status(&self, upstream: StatusCode) -> StatusCode {
        if self.preserve_status {
            upstream
        } else {
            StatusCode::OK
        }
    }

    fn upstream_response(&self, upstream: UpstreamResponse) -> ProxyResponse {
        ProxyResponse {
            status: self.client_status(upstream.status),
            headers: upstream.headers,
            body: upstream.body,
            cache: CacheStatus::Miss,
        }
    }

    fn build_response(&self, proxy_response: ProxyResponse) -> Response {
        let mut response = Response::new(Body::from(proxy_response.body));
        *response.status_mut() = proxy_response.status;
        *response.headers_mut() = proxy_response.headers;
        response
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(proxy_response.cache.as_str()));
        response
    }
}

async fn read_body(body: Body) -> ProxyResult<Bytes> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ProxyError::BodyRead(e.to_string()))
}

fn cached_copy(upstream: &UpstreamResponse) -> CachedResponse {
    CachedResponse {
        status: upstream.status,
        body: upstream.body.clone(),
        headers: upstream.headers.clone(),
    }
}

/// Single wildcard route in front of the dispatcher.
pub fn router(dispatcher: Arc<ProxyDispatcher>) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(dispatcher)
}

async fn handle_request(State(dispatcher): State<Arc<ProxyDispatcher>>, req: Request) -> Response {
    dispatcher.handle(req).await
}
