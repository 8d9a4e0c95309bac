//! Runtime configuration for the StudyGate gateway.

use crate::error::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// File store
pub const WRITE_CHUNK_SIZE: usize = 1024 * 1024;
pub const HASH_BLOCK_SIZE: usize = 8192;
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
pub const MAX_IDENTIFIER_LEN: usize = 128;
pub const LOCK_GC_INTERVAL_SECS: u64 = 300;

// Upstream
pub const USER_AGENT: &str = "StudyGate-Backend/1.0";
pub const TUNNEL_WARNING_HEADER: &str = "ngrok-skip-browser-warning";
pub const BODY_EXCERPT_CHARS: usize = 500;
pub const HEALTH_TIMEOUT_SECS: u64 = 5;

// Per-user queue channel capacity; senders wait when a user has this many pending
pub const USER_QUEUE_CAPACITY: usize = 256;
// A user's worker with nothing pending exits after this long
pub const WORKER_IDLE_SECS: u64 = 60;

pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Verify upstream certificates and host names
    #[default]
    Strict,
    /// Accept any certificate (ephemeral tunnel endpoints)
    Insecure,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SessionCacheMode {
    /// Re-upload the document for every AI call
    #[default]
    Disabled,
    /// Reuse the cached upstream session handle
    Enabled,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub tls_mode: TlsMode,
    pub max_connections: usize,
    pub max_keepalive: usize,
    pub keepalive_expiry_secs: u64,
    pub connect_timeout_secs: Option<u64>,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            tls_mode: TlsMode::Strict,
            max_connections: 10,
            max_keepalive: 5,
            keepalive_expiry_secs: 30,
            connect_timeout_secs: Some(30),
            retry_attempts: 3,
            retry_initial_delay_ms: 1000,
        }
    }
}

impl UpstreamConfig {
    pub fn keepalive_expiry(&self) -> Duration {
        Duration::from_secs(self.keepalive_expiry_secs)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }
}

/// A single fixed-window limit, written `"<count>/<unit>"` in config files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limit {
    pub max_requests: u32,
    pub window: Duration,
}

impl Limit {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self { max_requests, window: Duration::from_secs(60) }
    }

    pub const fn per_hour(max_requests: u32) -> Self {
        Self { max_requests, window: Duration::from_secs(3600) }
    }

    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let (count, unit) = raw
            .split_once('/')
            .ok_or_else(|| GatewayError::InvalidRequest(format!("bad rate limit '{}'", raw)))?;
        let max_requests: u32 = count
            .trim()
            .parse()
            .map_err(|_| GatewayError::InvalidRequest(format!("bad rate limit count '{}'", raw)))?;
        let secs = match unit.trim() {
            "second" | "sec" | "s" => 1,
            "minute" | "min" | "m" => 60,
            "hour" | "h" => 3600,
            "day" | "d" => 86_400,
            other => {
                return Err(GatewayError::InvalidRequest(format!("bad rate limit unit '{}'", other)))
            }
        };
        if max_requests == 0 {
            return Err(GatewayError::InvalidRequest(format!("rate limit '{}' admits nothing", raw)));
        }
        Ok(Self { max_requests, window: Duration::from_secs(secs) })
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Limit::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub auth: Limit,
    pub upload: Limit,
    pub summarize: Limit,
    pub quiz: Limit,
    pub ask: Limit,
    pub generic: Limit,
    pub health: Limit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth: Limit::per_minute(10),
            upload: Limit::per_hour(20),
            summarize: Limit::per_hour(30),
            quiz: Limit::per_hour(30),
            ask: Limit::per_hour(100),
            generic: Limit::per_minute(100),
            health: Limit::per_minute(60),
        }
    }
}

/// Settings loadable from the optional TOML config file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub upstream: UpstreamConfig,
    pub rate_limits: RateLimitConfig,
    pub session_cache: SessionCacheMode,
    pub max_upload_bytes: Option<u64>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::internal(format!("failed to read config {:?}: {}", path, e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> GatewayResult<Self> {
        toml::from_str(raw).map_err(|e| GatewayError::internal(format!("invalid config: {}", e)))
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes.unwrap_or(MAX_UPLOAD_BYTES)
    }

    /// Rejects base URLs that are not absolute http(s) URLs.
    pub fn validate(&self) -> GatewayResult<()> {
        let parsed = url::Url::parse(&self.upstream.base_url).map_err(|e| {
            GatewayError::internal(format!("invalid upstream url '{}': {}", self.upstream.base_url, e))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(GatewayError::internal(format!(
                "upstream url must be http(s), got '{}'",
                parsed.scheme()
            )));
        }
        if self.upstream.retry_attempts == 0 {
            return Err(GatewayError::internal("retry_attempts must be at least 1"));
        }
        if self.upstream.max_connections == 0 {
            return Err(GatewayError::internal("max_connections must be at least 1"));
        }
        Ok(())
    }
}
