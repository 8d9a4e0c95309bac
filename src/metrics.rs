//! Prometheus-style metrics collection for Ops observability.
//!
//! Provides atomic counters exposed via `/metrics` endpoint
//! in Prometheus text exposition format.

use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};

/// Maximum latency samples to keep for P99 calculation
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Collects and exposes Prometheus-format metrics
pub struct MetricsCollector {
    /// Upstream AI calls completed (success or failure)
    pub upstream_calls: AtomicU64,
    /// Upstream calls that ended in an error
    pub upstream_failures: AtomicU64,
    /// Retries performed after transient failures
    pub upstream_retries: AtomicU64,
    /// Requests rejected by the rate limiter
    pub rate_limited: AtomicU64,
    /// Units of work currently queued or running across all users
    pub queued_jobs: AtomicU64,
    /// Sliding window of recent upstream latencies (ms)
    upstream_latencies: RwLock<VecDeque<f64>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<MetricsCollector> = OnceLock::new();

/// Process-wide collector
pub fn global() -> &'static MetricsCollector {
    GLOBAL.get_or_init(MetricsCollector::new)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            upstream_calls: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
            upstream_retries: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            queued_jobs: AtomicU64::new(0),
            upstream_latencies: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
        }
    }

    /// Record a finished upstream call with its latency
    pub fn record_upstream_call(&self, latency_ms: f64, failed: bool) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.upstream_failures.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut latencies) = self.upstream_latencies.write() {
            if latencies.len() >= LATENCY_WINDOW_SIZE {
                latencies.pop_front();
            }
            latencies.push_back(latency_ms);
        }
    }

    pub fn record_retry(&self) {
        self.upstream_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_queued(&self) {
        self.queued_jobs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self) {
        // Saturate instead of wrapping if a finish is ever recorded twice
        let _ = self
            .queued_jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Calculate P99 latency from the sliding window
    pub fn get_p99_latency(&self) -> f64 {
        if let Ok(latencies) = self.upstream_latencies.read() {
            if latencies.is_empty() {
                return 0.0;
            }

            let mut sorted: Vec<f64> = latencies.iter().copied().collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let p99_index = ((sorted.len() as f64) * 0.99).ceil() as usize - 1;
            let p99_index = p99_index.min(sorted.len() - 1);
            sorted[p99_index]
        } else {
            0.0
        }
    }

    /// Get average latency from the sliding window
    pub fn get_avg_latency(&self) -> f64 {
        if let Ok(latencies) = self.upstream_latencies.read() {
            if latencies.is_empty() {
                return 0.0;
            }
            latencies.iter().sum::<f64>() / latencies.len() as f64
        } else {
            0.0
        }
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self, active_users: usize) -> String {
        let mut out = String::new();
        let counters = [
            ("studygate_upstream_calls_total", "counter", self.upstream_calls.load(Ordering::Relaxed)),
            ("studygate_upstream_failures_total", "counter", self.upstream_failures.load(Ordering::Relaxed)),
            ("studygate_upstream_retries_total", "counter", self.upstream_retries.load(Ordering::Relaxed)),
            ("studygate_rate_limited_total", "counter", self.rate_limited.load(Ordering::Relaxed)),
            ("studygate_queued_jobs", "gauge", self.queued_jobs.load(Ordering::Relaxed)),
            ("studygate_active_user_queues", "gauge", active_users as u64),
        ];
        for (name, kind, value) in counters {
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        }
        let _ = writeln!(out, "# TYPE studygate_upstream_latency_p99_ms gauge");
        let _ = writeln!(out, "studygate_upstream_latency_p99_ms {:.3}", self.get_p99_latency());
        let _ = writeln!(out, "# TYPE studygate_upstream_latency_avg_ms gauge");
        let _ = writeln!(out, "studygate_upstream_latency_avg_ms {:.3}", self.get_avg_latency());
        out
    }
}
