//! Exponential-backoff retry for connection-level upstream failures.

use crate::error::{GatewayError, GatewayResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum AttemptError {
    /// Connect, read or TLS failure; worth another attempt.
    Transient(String),
    /// Anything else; surfaced immediately.
    Fatal(GatewayError),
}

impl From<GatewayError> for AttemptError {
    fn from(e: GatewayError) -> Self {
        AttemptError::Fatal(e)
    }
}

/// Classify a reqwest failure. Status codes never reach here because
/// responses are inspected by hand, so everything reqwest reports is either
/// transport-level or a decode problem.
///
/// reqwest reports a body cut short mid-read as a decode error; any failure
/// caused by an I/O error further down is treated as transient.
pub fn classify_reqwest(e: reqwest::Error) -> AttemptError {
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || caused_by_io(&e) {
        AttemptError::Transient(e.to_string())
    } else if e.is_decode() {
        AttemptError::Fatal(GatewayError::internal(format!(
            "undecodable AI service response: {}",
            e
        )))
    } else {
        AttemptError::Fatal(GatewayError::internal(e.to_string()))
    }
}

/// A response body that could not be read in full.
pub fn body_read_failure(e: reqwest::Error) -> AttemptError {
    AttemptError::Transient(format!("reading AI service response: {}", e))
}

fn caused_by_io(e: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = e.source();
    while let Some(cause) = source {
        if cause.is::<std::io::Error>() {
            return true;
        }
        source = cause.source();
    }
    false
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// Wait after the `attempt`-th failure (1-based): `initial_delay * 2^(attempt-1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(1u32 << exp)
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Only the calling task sleeps
    /// between attempts.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut op: F) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(reason)) => {
                    if attempt >= self.max_attempts {
                        warn!(
                            "[RETRY] {}: all {} attempts failed, last error: {}",
                            label, self.max_attempts, reason
                        );
                        return Err(GatewayError::UpstreamUnavailable {
                            attempts: attempt,
                            last_error: reason,
                        });
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        "[RETRY] {}: attempt {} failed ({}), waiting {:?}",
                        label, attempt, reason, delay
                    );
                    crate::metrics::global().record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success_matches_immediate_success() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let log = seen.clone();
        let result = policy
            .execute("test", move |attempt| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push((attempt, start.elapsed()));
                    if attempt < 3 {
                        Err(AttemptError::Transient("connection reset".into()))
                    } else {
                        Ok("summary")
                    }
                }
            })
            .await;

        let immediate = policy.execute("test", |_| async { Ok::<_, AttemptError>("summary") }).await;
        assert_eq!(result.unwrap(), immediate.unwrap());

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, Duration::ZERO);
        assert_eq!(seen[1].1, Duration::from_secs(1));
        assert_eq!(seen[2].1, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_surfaces_unavailable() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let err = policy
            .execute("test", move |_| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(AttemptError::Transient("tls handshake eof".into()))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), 3);
        match err {
            GatewayError::UpstreamUnavailable { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("tls handshake"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(Mutex::new(0u32));

        let counter = calls.clone();
        let err = policy
            .execute("test", move |_| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(AttemptError::Fatal(GatewayError::UpstreamError {
                        status: 500,
                        body: "boom".into(),
                    }))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(matches!(err, GatewayError::UpstreamError { status: 500, .. }));
    }
}
