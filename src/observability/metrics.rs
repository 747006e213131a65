use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;

/// Prometheus metrics for the proxy. Every recorder is a no-op when
/// metrics are disabled in the configuration.
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::register_metrics();
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    fn register_metrics() {
        describe_counter!("proxy_requests_total", "Requests handled, by cache class and outcome");
        describe_histogram!("proxy_request_duration_seconds", "End-to-end request handling time in seconds");
        describe_counter!("proxy_cache_lookups_total", "Cache lookups, by cache class and result");
        describe_counter!("proxy_stale_responses_total", "Responses served from cache while the upstream was down");
        describe_counter!("proxy_probe_total", "Upstream liveness probes, by result");
        describe_histogram!("proxy_upstream_response_time_seconds", "Upstream forward time in seconds");
        describe_counter!("proxy_upstream_errors_total", "Failed upstream forwards, by error code");
        describe_gauge!("proxy_cache_entries", "Entries currently held in the response cache");
    }

    /// Serve the Prometheus scrape endpoint until the task is aborted.
    pub async fn start_server(&self) -> Result<()> {
        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => return Ok(()),
        };

        let app = Router::new()
            .route(&self.config.path, get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind metrics server to {}: {}", addr, e))?;

        info!("Metrics server listening on {}{}", addr, self.config.path);

        axum::serve(listener, app)
            .await
            .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))?;

        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    pub fn record_request(&self, class: &'static str, outcome: &'static str, duration: f64) {
        if !self.is_enabled() {
            return;
        }

        counter!("proxy_requests_total", "class" => class, "outcome" => outcome).increment(1);
        histogram!("proxy_request_duration_seconds", "class" => class).record(duration);
    }

    pub fn record_cache_lookup(&self, class: &'static str, hit: bool) {
        if !self.is_enabled() {
            return;
        }

        let result = if hit { "hit" } else { "miss" };
        counter!("proxy_cache_lookups_total", "class" => class, "result" => result).increment(1);
    }

    pub fn record_stale_served(&self) {
        if !self.is_enabled() {
            return;
        }

        counter!("proxy_stale_responses_total").increment(1);
    }

    pub fn record_probe(&self, alive: bool) {
        if !self.is_enabled() {
            return;
        }

        let result = if alive { "alive" } else { "down" };
        counter!("proxy_probe_total", "result" => result).increment(1);
    }

    pub fn record_upstream(&self, status: u16, duration: f64) {
        if !self.is_enabled() {
            return;
        }

        histogram!("proxy_upstream_response_time_seconds", "status" => status.to_string()).record(duration);
    }

    pub fn record_upstream_error(&self, code: &'static str) {
        if !self.is_enabled() {
            return;
        }

        counter!("proxy_upstream_errors_total", "code" => code).increment(1);
    }

    pub fn set_cache_entries(&self, entries: usize) {
        if !self.is_enabled() {
            return;
        }

        gauge!("proxy_cache_entries").set(entries as f64);
    }
}
