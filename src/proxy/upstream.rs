use std::time::{Duration, Instant};

use axum::http::{header::HOST, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, error};

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};

/// Fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
}

/// Replays inbound requests against the configured source endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(source_endpoint: &str, config: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: source_endpoint.to_string(),
            timeout: config.timeout,
        })
    }

    /// `source_endpoint ++ path`, with no slash handling in between.
    pub fn target_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send `method path` upstream with the inbound headers and `body`.
    ///
    /// Headers pass through untouched apart from `Host`, which the client
    /// derives from the target URL, and hop-by-hop headers.
    pub async fn forward(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let start = Instant::now();
        let target_url = self.target_url(path);

        let mut outbound_headers = end_to_end_headers(headers);
        outbound_headers.remove(HOST);

        let request = self
            .client
            .request(method.clone(), &target_url)
            .headers(outbound_headers)
            .body(body)
            .build()
            .map_err(|e| ProxyError::RequestBuild(format!("{} {}: {}", method, target_url, e)))?;

        debug!("Forwarding {} {}", method, target_url);

        let response = self.client.execute(request).await.map_err(|e| {
            error!("Upstream request failed for {} {}: {}", method, target_url, e);
            self.classify_error(e)
        })?;

        let status = response.status();
        let response_headers = end_to_end_headers(response.headers());

        let body = response.bytes().await.map_err(|e| {
            error!("Failed to read upstream response body from {}: {}", target_url, e);
            if e.is_timeout() {
                ProxyError::Timeout(self.timeout)
            } else {
                ProxyError::UpstreamBodyRead(e.to_string())
            }
        })?;

        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            body,
            elapsed: start.elapsed(),
        })
    }

    fn classify_error(&self, err: reqwest::Error) -> ProxyError {
        if err.is_timeout() {
            ProxyError::Timeout(self.timeout)
        } else {
            ProxyError::from(err)
        }
    }
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop_header(name) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

// Bodies are fully buffered, so framing headers are regenerated per hop.
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" |
        "te" | "trailers" | "transfer-encoding" | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use mockito::Matcher;

    fn upstream_config() -> UpstreamConfig {
        UpstreamConfig {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            preserve_status: false,
        }
    }

    #[test]
    fn test_target_url_is_plain_concatenation() {
        let client = UpstreamClient::new("http://origin.internal/", &upstream_config()).unwrap();
        assert_eq!(client.target_url("/catalog"), "http://origin.internal//catalog");

        let client = UpstreamClient::new("http://origin.internal", &upstream_config()).unwrap();
        assert_eq!(client.target_url("/catalog"), "http://origin.internal/catalog");
    }

    #[tokio::test]
    async fn test_forward_passes_method_headers_and_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/items/7")
            .match_header("x-tenant", "acme")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Exact(r#"{"name":"widget"}"#.to_string()))
            .with_status(201)
            .with_header("x-upstream", "yes")
            .with_body("created")
            .create_async()
            .await;

        let client = UpstreamClient::new(&server.url(), &upstream_config()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("acme"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert(HOST, HeaderValue::from_static("proxy.example.com"));

        let response = client
            .forward(&Method::PUT, "/api/items/7", &headers, Bytes::from_static(br#"{"name":"widget"}"#))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["x-upstream"], "yes");
        assert_eq!(response.body, "created");
    }

    #[tokio::test]
    async fn test_forward_to_closed_port_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = UpstreamClient::new(&format!("http://{}", addr), &upstream_config()).unwrap();
        let err = client
            .forward(&Method::GET, "/catalog", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::Transport(_)), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn test_forward_rejects_unbuildable_url() {
        let client = UpstreamClient::new("not a url", &upstream_config()).unwrap();
        let err = client
            .forward(&Method::GET, "/catalog", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::RequestBuild(_)), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let filtered = end_to_end_headers(&headers);
        assert!(!filtered.contains_key("connection"));
        assert!(!filtered.contains_key("transfer-encoding"));
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
    }
}
