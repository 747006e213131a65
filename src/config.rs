use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure.
///
/// The three upstream keys keep the PascalCase names of the flat
/// `config.json` layout; every other section is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "SourceEndpoint", alias = "source_endpoint")]
    pub source_endpoint: String,
    #[serde(rename = "PingTime", alias = "ping_time", default = "default_ping_time")]
    pub ping_time: u64,
    #[serde(rename = "CacheBypass", alias = "cache_bypass", default)]
    pub cache_bypass: Vec<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: "cert.pem".to_string(),
            key_path: "cert.key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Appended to `SourceEndpoint` verbatim.
    pub path: String,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub timeout: Duration,
    /// Only 2xx probe responses count as alive when set.
    pub require_success_status: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: "test".to_string(),
            timeout: Duration::from_secs(5),
            require_success_status: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub timeout: Duration,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub connect_timeout: Duration,
    pub preserve_status: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            preserve_status: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub access_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            access_log: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

fn default_ping_time() -> u64 {
    1
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::parse(Path::new(path), &content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating. YAML for `.yaml`/`.yml`, JSON otherwise.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );

        let config = if is_yaml {
            serde_yaml::from_str(content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            serde_json::from_str(content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_endpoint.trim().is_empty() {
            anyhow::bail!("SourceEndpoint cannot be empty");
        }
        reqwest::Url::parse(&self.source_endpoint)
            .with_context(|| format!("SourceEndpoint is not a valid URL: {}", self.source_endpoint))?;

        if self.ping_time == 0 {
            anyhow::bail!("PingTime must be a positive number of minutes");
        }

        if let Some(pattern) = self.cache_bypass.iter().find(|p| p.is_empty()) {
            anyhow::bail!("CacheBypass contains an empty pattern ({:?}) that would match every path", pattern);
        }

        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.server.request_timeout.is_zero() {
            anyhow::bail!("server.request_timeout cannot be zero");
        }

        if self.tls.enabled {
            if self.tls.cert_path.is_empty() {
                anyhow::bail!("TLS cert_path cannot be empty when TLS is enabled");
            }
            if self.tls.key_path.is_empty() {
                anyhow::bail!("TLS key_path cannot be empty when TLS is enabled");
            }
        }

        if self.probe.timeout.is_zero() {
            anyhow::bail!("probe.timeout cannot be zero");
        }

        if self.upstream.timeout.is_zero() || self.upstream.connect_timeout.is_zero() {
            anyhow::bail!("upstream timeouts cannot be zero");
        }

        if self.cache.sweep_interval.is_zero() {
            anyhow::bail!("cache.sweep_interval cannot be zero");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("Unknown log format: {} (expected text or json)", self.logging.format);
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Metrics port cannot be zero");
        }

        Ok(())
    }

    /// Lifetime of a bypass-classified cache entry.
    pub fn bypass_ttl(&self) -> Duration {
        Duration::from_secs(self.ping_time.saturating_mul(60))
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub(super) fn parse_duration(s: &str) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}
