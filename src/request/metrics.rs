//! In-process request telemetry.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters behind `metrics()` / `reset_metrics()`.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
    response_time_ms: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Failed calls answered from an expired cache entry.
    pub stale_responses: u64,
    pub average_response_time_ms: f64,
}

impl RequestMetrics {
    pub fn record_request(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub fn record_failure(&self, elapsed: Duration, served_stale: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if served_stale {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        self.add_time(elapsed);
    }

    fn add_time(&self, elapsed: Duration) {
        self.response_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let completed = successful + failed;
        let average = if completed == 0 {
            0.0
        } else {
            self.response_time_ms.load(Ordering::Relaxed) as f64 / completed as f64
        };

        MetricsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: successful,
            failed_requests: failed,
            stale_responses: self.stale.load(Ordering::Relaxed),
            average_response_time_ms: average,
        }
    }

    pub fn reset(&self) {
        for counter in [&self.total, &self.successful, &self.failed, &self.stale, &self.response_time_ms] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
