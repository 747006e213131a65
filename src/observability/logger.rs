use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `logging.level` when it is set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    let json = config.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// One line of the access log.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub class: &'static str,
    pub cache: &'static str,
    pub bytes_sent: usize,
}

impl AccessLogEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: &str,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
        class: &'static str,
        cache: &'static str,
        bytes_sent: usize,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration_ms: duration.as_millis() as u64,
            class,
            cache,
            bytes_sent,
        }
    }
}

/// Access log writer. Always emits a `tracing` event on the `access`
/// target; additionally appends JSON lines to a file when configured.
pub struct AccessLogger {
    file: Option<Mutex<tokio::fs::File>>,
}

impl AccessLogger {
    pub async fn new(config: &LoggingConfig) -> Result<Self> {
        let Some(path) = &config.access_log else {
            return Ok(Self::disabled());
        };

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create access log directory for {}", path))?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open access log: {}", path))?;

        Ok(Self { file: Some(Mutex::new(file)) })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub async fn log(&self, entry: &AccessLogEntry) -> std::io::Result<()> {
        info!(
            target: "access",
            request_id = %entry.request_id,
            method = %entry.method,
            path = %entry.path,
            status = entry.status,
            duration_ms = entry.duration_ms,
            class = entry.class,
            cache = entry.cache,
            bytes_sent = entry.bytes_sent,
            "request completed"
        );

        if let Some(file) = &self.file {
            let mut line = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
            line.push(b'\n');

            let mut file = file.lock().await;
            file.write_all(&line).await?;
            file.flush().await?;
        }

        Ok(())
    }
}
