//! HTTP client for the external AI inference service.
//!
//! The service usually sits behind an ephemeral tunnel, so the client is
//! built to survive it: pooled connections, no request timeout (generation
//! can take minutes), optional relaxed TLS, retries on transport failures,
//! and detection of the tunnel's HTML error page before status handling.

use crate::config::{
    TlsMode, UpstreamConfig, BODY_EXCERPT_CHARS, HEALTH_TIMEOUT_SECS, TUNNEL_WARNING_HEADER,
    USER_AGENT,
};
use crate::error::{GatewayError, GatewayResult};
use crate::retry::{body_read_failure, classify_reqwest, AttemptError, RetryPolicy};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
struct UploadPayload {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryPayload {
    pub summary: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamQuizQuestion {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_answer: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizPayload {
    pub quiz: Vec<UpstreamQuizQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskPayload {
    #[serde(default)]
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamHealth {
    Online,
    Offline,
}

/// Best-effort check for a tunnel/gateway error page standing in for the
/// JSON payload. Any HTML document counts; a non-2xx body that names the
/// tunnel vendor counts as well.
pub fn looks_like_tunnel_error(status: StatusCode, content_type: Option<&str>, body: &str) -> bool {
    let head: String = body.trim_start().chars().take(64).collect();
    let head = head.to_ascii_lowercase();
    let is_html = head.starts_with("<!doctype html")
        || head.starts_with("<html")
        || content_type.is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"));

    if is_html {
        return true;
    }
    !status.is_success() && body.to_ascii_lowercase().contains("ngrok")
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}

#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    base_url: String,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> GatewayResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(TUNNEL_WARNING_HEADER, HeaderValue::from_static("true"));

        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .pool_max_idle_per_host(config.max_keepalive)
            .pool_idle_timeout(config.keepalive_expiry());

        if let Some(secs) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }

        if config.tls_mode == TlsMode::Insecure {
            warn!("⚠️  Upstream TLS verification disabled (tunnel mode)");
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }

        let http = builder
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            retry: RetryPolicy::new(config.retry_attempts, config.retry_initial_delay()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Upload a stored document and return the session handle the service assigns.
    pub async fn upload(&self, filename: &str, content_type: &str, data: Bytes) -> GatewayResult<String> {
        info!("Uploading {} ({} bytes) to AI service", filename, data.len());

        let payload: UploadPayload = self
            .call("upload", |client| {
                let part = reqwest::multipart::Part::stream(data.clone())
                    .file_name(filename.to_string())
                    .mime_str(content_type)
                    .map_err(|e| GatewayError::InvalidRequest(format!("bad content type: {}", e)))?;
                let form = reqwest::multipart::Form::new().part("file", part);
                Ok(client.post(self.url("/upload")).multipart(form))
            })
            .await?;

        match payload.session_id {
            Some(id) if !id.is_empty() => {
                debug!("Received session_id: {}", id);
                Ok(id)
            }
            _ => Err(GatewayError::internal("AI service did not return session_id")),
        }
    }

    pub async fn summarize(&self, session_id: &str) -> GatewayResult<SummaryPayload> {
        let body = serde_json::json!({ "session_id": session_id });
        self.call("summarize", |client| Ok(client.post(self.url("/summarize")).json(&body)))
            .await
    }

    pub async fn quiz(&self, session_id: &str) -> GatewayResult<QuizPayload> {
        let body = serde_json::json!({ "session_id": session_id });
        self.call("quiz", |client| Ok(client.post(self.url("/quiz")).json(&body)))
            .await
    }

    pub async fn ask(&self, session_id: &str, question: &str) -> GatewayResult<AskPayload> {
        let body = serde_json::json!({ "session_id": session_id, "question": question });
        self.call("ask", |client| Ok(client.post(self.url("/ask")).json(&body)))
            .await
    }

    /// Liveness check. Never fails; anything but a 2xx within the timeout is offline.
    pub async fn health(&self) -> UpstreamHealth {
        let result = self
            .http
            .get(self.url("/health"))
            .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => UpstreamHealth::Online,
            Ok(resp) => {
                debug!("AI service health returned {}", resp.status());
                UpstreamHealth::Offline
            }
            Err(e) => {
                debug!("AI service health check failed: {}", e);
                UpstreamHealth::Offline
            }
        }
    }

    /// One logical call: build, send and decode with retry on transport failures.
    async fn call<T, B>(&self, op: &str, build: B) -> GatewayResult<T>
    where
        T: DeserializeOwned,
        B: Fn(&Client) -> GatewayResult<reqwest::RequestBuilder>,
    {
        let start = Instant::now();
        let result = self
            .retry
            .execute(op, |attempt| {
                let request = build(&self.http);
                async move {
                    let request = request?;
                    let _permit = self
                        .permits
                        .acquire()
                        .await
                        .map_err(|_| GatewayError::internal("upstream connection pool closed"))?;

                    let response = request.send().await.map_err(classify_reqwest)?;
                    let status = response.status();
                    let content_type = response
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let text = response.text().await.map_err(body_read_failure)?;

                    debug!("{} attempt {} -> {} ({} bytes)", op, attempt, status, text.len());

                    if looks_like_tunnel_error(status, content_type.as_deref(), &text) {
                        return Err(AttemptError::Fatal(GatewayError::UpstreamUnavailable {
                            attempts: attempt,
                            last_error: "AI service is offline (tunnel not responding)".to_string(),
                        }));
                    }
                    if !status.is_success() {
                        return Err(AttemptError::Fatal(GatewayError::UpstreamError {
                            status: status.as_u16(),
                            body: excerpt(&text),
                        }));
                    }

                    serde_json::from_str::<T>(&text).map_err(|e| {
                        AttemptError::Fatal(GatewayError::internal(format!(
                            "unexpected {} response from AI service: {}",
                            op, e
                        )))
                    })
                }
            })
            .await;

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        crate::metrics::global().record_upstream_call(latency_ms, result.is_err());
        if let Err(e) = &result {
            warn!("AI service {} failed after {:.0}ms: {}", op, latency_ms, e);
        }
        result
    }
}
