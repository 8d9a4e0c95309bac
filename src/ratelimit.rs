//! Fixed-window rate limiting per `(identity, route class)`.
//!
//! Identity is `user:<sub>` for requests with a valid bearer token and
//! `ip:<peer address>` otherwise. Windows are aligned to the limiter's start
//! instant; a window's count resets as soon as its index rolls over.

use crate::auth::{bearer_token, TokenVerifier};
use crate::config::{Limit, RateLimitConfig};
use crate::error::{GatewayError, GatewayResult};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Auth,
    Upload,
    Summarize,
    Quiz,
    Ask,
    Generic,
    Health,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Upload => "upload",
            Self::Summarize => "summarize",
            Self::Quiz => "quiz",
            Self::Ask => "ask",
            Self::Generic => "generic",
            Self::Health => "health",
        }
    }
}

/// Admission result, echoed to the caller in `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug)]
struct Window {
    index: u64,
    count: u32,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<(String, RouteClass), Window>,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn limit_for(&self, class: RouteClass) -> Limit {
        match class {
            RouteClass::Auth => self.config.auth,
            RouteClass::Upload => self.config.upload,
            RouteClass::Summarize => self.config.summarize,
            RouteClass::Quiz => self.config.quiz,
            RouteClass::Ask => self.config.ask,
            RouteClass::Generic => self.config.generic,
            RouteClass::Health => self.config.health,
        }
    }

    fn window_ms(limit: &Limit) -> u64 {
        (limit.window.as_millis() as u64).max(1)
    }

    /// Count one request. Fails `RateLimited` once the window's budget is spent.
    pub fn check(&self, identity: &str, class: RouteClass) -> GatewayResult<RateDecision> {
        let limit = self.limit_for(class);
        if !self.config.enabled {
            return Ok(RateDecision { limit: limit.max_requests, remaining: limit.max_requests });
        }

        let elapsed_ms = self.epoch.elapsed().as_millis() as u64;
        let window_ms = Self::window_ms(&limit);
        let index = elapsed_ms / window_ms;

        let mut window = self
            .windows
            .entry((identity.to_string(), class))
            .or_insert(Window { index, count: 0 });
        if window.index != index {
            window.index = index;
            window.count = 0;
        }

        if window.count >= limit.max_requests {
            let until_reset_ms = (index + 1) * window_ms - elapsed_ms;
            let retry_after_secs = until_reset_ms.div_ceil(1000).max(1);
            drop(window);
            crate::metrics::global().record_rate_limited();
            warn!(
                "Rate limit exceeded for {} on {} ({}/{:?})",
                identity,
                class.as_str(),
                limit.max_requests,
                limit.window
            );
            return Err(GatewayError::RateLimited { retry_after_secs });
        }

        window.count += 1;
        Ok(RateDecision {
            limit: limit.max_requests,
            remaining: limit.max_requests - window.count,
        })
    }

    /// Drop windows that have already rolled over. Returns how many were removed.
    pub fn purge_stale(&self) -> usize {
        let elapsed_ms = self.epoch.elapsed().as_millis() as u64;
        let before = self.windows.len();
        self.windows.retain(|(_, class), window| {
            let window_ms = Self::window_ms(&self.limit_for(*class));
            window.index == elapsed_ms / window_ms
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn start_purge(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let purged = self.purge_stale();
                if purged > 0 {
                    info!("Rate limiter purged {} stale window(s)", purged);
                }
            }
        })
    }
}

/// `ip:<addr>` from the connection, or `ip:unknown` when the router was not
/// served with connect info.
pub fn peer_identity(req: &Request) -> String {
    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_string(),
    }
}

/// Caller identity for rate limiting: the token subject when the bearer
/// token verifies, otherwise the peer address.
pub fn resolve_identity(req: &Request, verifier: &TokenVerifier) -> String {
    bearer_token(req.headers())
        .and_then(|token| verifier.verify(token).ok())
        .map(|claims| format!("user:{}", claims.sub))
        .unwrap_or_else(|| peer_identity(req))
}

/// Middleware state for one route class.
#[derive(Clone)]
pub struct RateLimitLayer {
    pub limiter: Arc<RateLimiter>,
    pub verifier: Arc<TokenVerifier>,
    pub class: RouteClass,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>, verifier: Arc<TokenVerifier>, class: RouteClass) -> Self {
        Self { limiter, verifier, class }
    }
}

pub async fn rate_limit_middleware(
    State(layer): State<RateLimitLayer>,
    req: Request,
    next: Next,
) -> Response {
    if !layer.limiter.is_enabled() {
        return next.run(req).await;
    }

    let identity = resolve_identity(&req, &layer.verifier);
    match layer.limiter.check(&identity, layer.class) {
        Ok(decision) => {
            debug!(
                "{} admitted on {} ({} left)",
                identity,
                layer.class.as_str(),
                decision.remaining
            );
            let mut response = next.run(req).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
            response
        }
        Err(e) => e.into_response(),
    }
}
