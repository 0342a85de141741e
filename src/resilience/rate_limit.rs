//! Per-key fixed-window rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::schema::RateLimitConfig;
use crate::observability::metrics;

/// Request count within the current window.
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn try_acquire(&mut self, max_per_window: u32, window: Duration, now: Instant) -> bool {
        // Reset once the window has fully elapsed
        if now.duration_since(self.window_start) > window {
            self.count = 0;
            self.window_start = now;
        }

        if self.count < max_per_window {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Fixed-window limiter keyed by endpoint (or connection) name.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one slot from `key`'s window. Returns false if the window is exhausted.
    pub fn try_acquire(&self, key: &str, limit: &RateLimitConfig) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow::new(now));

        let allowed = window.try_acquire(limit.max_per_window, limit.window(), now);
        if !allowed {
            tracing::debug!(key = %key, max = limit.max_per_window, "Rate window exhausted");
            metrics::record_rate_limited(key);
        }
        allowed
    }

    /// Requests left in `key`'s current window.
    pub fn remaining(&self, key: &str, limit: &RateLimitConfig) -> u32 {
        let windows = self.windows.lock().expect("rate limiter mutex poisoned");
        match windows.get(key) {
            Some(w) if w.window_start.elapsed() <= limit.window() => {
                limit.max_per_window.saturating_sub(w.count)
            }
            _ => limit.max_per_window,
        }
    }

    /// Forget the window for `key` (e.g. when a connection closes).
    pub fn forget(&self, key: &str) {
        self.windows
            .lock()
            .expect("rate limiter mutex poisoned")
            .remove(key);
    }
}
