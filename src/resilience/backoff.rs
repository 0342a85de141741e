//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Calculate exponential backoff delay with jitter.
///
/// `attempt` is 1-based: the first retry waits `base_ms`, the second
/// `2 * base_ms`, and so on up to `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    Duration::from_millis(with_jitter(delay_ms.min(max_ms)))
}

/// Delay before reconnect attempt `attempt` (1-based): `base_ms * 1.5^(attempt - 1)`, capped.
pub fn reconnect_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let factor = 1.5f64.powi(attempt.saturating_sub(1).min(64) as i32);
    let delay_ms = (base_ms as f64 * factor).min(max_ms as f64) as u64;
    Duration::from_millis(with_jitter(delay_ms))
}

// Adds 0 to 10% on top of the delay; never shortens it.
fn with_jitter(delay_ms: u64) -> u64 {
    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    delay_ms + jitter
}
