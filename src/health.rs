use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::ProbeConfig;

/// Outcome of a single liveness probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub alive: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub response_time: Duration,
}

/// Decides whether the upstream is worth forwarding to right now.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// Probes `GET {source_endpoint}{probe.path}` before path-keyed forwards.
///
/// By default any HTTP response counts as alive: the probe measures
/// reachability, so an upstream answering 503 is still "up" and the
/// request is forwarded rather than served from the stale cache. Setting
/// `require_success_status` tightens this to 2xx only.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
    timeout: Duration,
    require_success_status: bool,
}

impl HttpProbe {
    pub fn new(source_endpoint: &str, config: &ProbeConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("stale-cache-proxy-probe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client for probes: {}", e))?;

        Ok(Self {
            client,
            // No normalization: the endpoint is expected to end with '/'.
            url: format!("{}{}", source_endpoint, config.path),
            timeout: config.timeout,
            require_success_status: config.require_success_status,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn check(&self) -> ProbeResult {
        let start_time = Instant::now();

        match tokio::time::timeout(self.timeout, self.client.get(&self.url).send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                let alive = !self.require_success_status || status.is_success();

                ProbeResult {
                    alive,
                    status_code: Some(status.as_u16()),
                    error: (!alive).then(|| format!("HTTP {}", status.as_u16())),
                    response_time: start_time.elapsed(),
                }
            }
            Ok(Err(e)) => ProbeResult {
                alive: false,
                status_code: None,
                error: Some(e.to_string()),
                response_time: start_time.elapsed(),
            },
            Err(_) => ProbeResult {
                alive: false,
                status_code: None,
                error: Some("Probe timeout".to_string()),
                response_time: self.timeout,
            },
        }
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn is_alive(&self) -> bool {
        let result = self.check().await;

        if result.alive {
            debug!(
                "Probe {} answered {:?} in {}ms",
                self.url,
                result.status_code,
                result.response_time.as_millis()
            );
        } else {
            warn!("Upstream probe failed for {}: {}", self.url, result.error.unwrap_or_default());
        }

        result.alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_config(require_success_status: bool) -> ProbeConfig {
        ProbeConfig {
            path: "test".to_string(),
            timeout: Duration::from_secs(2),
            require_success_status,
        }
    }

    async fn closed_port_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_probe_appends_path_without_normalizing() {
        let probe = HttpProbe::new("http://origin.internal/api/", &probe_config(false)).unwrap();
        assert_eq!(probe.url(), "http://origin.internal/api/test");
    }

    #[tokio::test]
    async fn test_refused_connection_is_down() {
        let probe = HttpProbe::new(&closed_port_endpoint().await, &probe_config(false)).unwrap();

        let result = probe.check().await;
        assert!(!result.alive);
        assert!(result.status_code.is_none());
        assert!(result.error.is_some());
        assert!(!probe.is_alive().await);
    }

    #[tokio::test]
    async fn test_error_status_still_counts_as_reachable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/test")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let probe = HttpProbe::new(&format!("{}/", server.url()), &probe_config(false)).unwrap();
        assert!(probe.is_alive().await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_probe_route_still_counts_as_reachable() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/test").with_status(404).create_async().await;

        let probe = HttpProbe::new(&format!("{}/", server.url()), &probe_config(false)).unwrap();
        let result = probe.check().await;
        assert!(result.alive);
        assert_eq!(result.status_code, Some(404));
    }

    #[tokio::test]
    async fn test_status_aware_policy_rejects_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/test").with_status(500).create_async().await;

        let probe = HttpProbe::new(&format!("{}/", server.url()), &probe_config(true)).unwrap();
        let result = probe.check().await;
        assert!(!result.alive);
        assert_eq!(result.status_code, Some(500));
        assert_eq!(result.error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn test_status_aware_policy_accepts_success() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/test").with_status(200).create_async().await;

        let probe = HttpProbe::new(&format!("{}/", server.url()), &probe_config(true)).unwrap();
        assert!(probe.is_alive().await);
    }
}
