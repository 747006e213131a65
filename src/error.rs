use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures that end the handling of a single proxied request.
///
/// Every variant maps to one server-error response; none of them is retried.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Error reading request body: {0}")]
    BodyRead(String),

    #[error("Error creating upstream request: {0}")]
    RequestBuild(String),

    #[error("Error from main endpoint: {0}")]
    Transport(String),

    #[error("Upstream timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Error reading main endpoint response: {0}")]
    UpstreamBodyRead(String),

    #[error("Server is down and no cached response exists for {path}")]
    NoFallbackAvailable { path: String },
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::BodyRead(_) => "BODY_READ_ERROR",
            ProxyError::RequestBuild(_) => "REQUEST_BUILD_ERROR",
            ProxyError::Transport(_) => "TRANSPORT_ERROR",
            ProxyError::Timeout(_) => "UPSTREAM_TIMEOUT",
            ProxyError::UpstreamBodyRead(_) => "UPSTREAM_BODY_READ_ERROR",
            ProxyError::NoFallbackAvailable { .. } => "NO_FALLBACK_AVAILABLE",
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            ProxyError::RequestBuild(err.to_string())
        } else if err.is_body() || err.is_decode() {
            ProxyError::UpstreamBodyRead(err.to_string())
        } else {
            ProxyError::Transport(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_no_fallback_response_is_json_server_error() {
        let response = ProxyError::NoFallbackAvailable { path: "/catalog".to_string() }.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["code"], "NO_FALLBACK_AVAILABLE");
        assert_eq!(value["error"]["status"], 500);
        assert!(value["error"]["message"].as_str().unwrap().contains("/catalog"));
    }

    #[test]
    fn test_every_variant_is_a_server_error() {
        let errors = [
            ProxyError::BodyRead("eof".into()),
            ProxyError::RequestBuild("bad method".into()),
            ProxyError::Transport("refused".into()),
            ProxyError::Timeout(std::time::Duration::from_secs(1)),
            ProxyError::UpstreamBodyRead("reset".into()),
        ];
        for err in errors {
            assert!(err.status_code().is_server_error(), "{}", err.error_code());
        }
    }
}
