//! Error taxonomy and call outcomes.
//!
//! # Design Decisions
//! - Failures are tagged where they happen (transport, timeout, upstream status),
//!   never recovered by matching on message text
//! - Errors are `Clone` so a single deduplicated call can fan its result out
//! - Whether a failure counts against a circuit is decided per endpoint by a
//!   [`FailureClassifier`]

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::retries::FailureClassifier;

/// Errors surfaced by the resilience layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    /// Network, DNS or connection-refused failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An attempt exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The remote side answered with a failure status.
    #[error("upstream responded with status {status}")]
    Upstream { status: u16 },

    /// The circuit for this endpoint is open.
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },

    /// The endpoint's rate window is exhausted.
    #[error("rate limit exceeded for endpoint '{endpoint}'")]
    RateLimited { endpoint: String },

    /// An action could not be durably recorded.
    #[error("failed to persist queued action: {0}")]
    QueuePersist(String),

    /// Credential acquisition or handshake failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Durable store read or delete failed.
    #[error("durable store error: {0}")]
    Store(String),

    /// The component has been shut down.
    #[error("component closed")]
    Closed,
}

impl ResilienceError {
    /// Returns true if this failure counts as a service failure: it trips
    /// circuits and is retried.
    pub fn is_service_failure(&self, classifier: &FailureClassifier) -> bool {
        match self {
            ResilienceError::Transport(_) | ResilienceError::Timeout(_) => true,
            ResilienceError::Upstream { status } => classifier.is_service_failure(*status),
            _ => false,
        }
    }

    /// Returns true for failures caused by the remote being unreachable
    /// rather than by the request itself.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transport(_)
                | ResilienceError::Timeout(_)
                | ResilienceError::CircuitOpen { .. }
        )
    }
}

/// Result type for resilience operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// A successful result and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub value: T,
    /// Served from an expired cache entry because no fresher value was obtainable.
    pub is_stale: bool,
    /// Produced by a fallback instead of the wrapped operation.
    pub is_from_fallback: bool,
}

impl<T> Outcome<T> {
    pub fn fresh(value: T) -> Self {
        Self { value, is_stale: false, is_from_fallback: false }
    }

    pub fn stale(value: T) -> Self {
        Self { value, is_stale: true, is_from_fallback: false }
    }

    pub fn fallback(value: T) -> Self {
        Self { value, is_stale: false, is_from_fallback: true }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            is_stale: self.is_stale,
            is_from_fallback: self.is_from_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_failure_tagging() {
        let classifier = FailureClassifier::default();
        assert!(ResilienceError::Transport("refused".into()).is_service_failure(&classifier));
        assert!(ResilienceError::Timeout(Duration::from_secs(1)).is_service_failure(&classifier));
        assert!(ResilienceError::Upstream { status: 503 }.is_service_failure(&classifier));
        assert!(!ResilienceError::Upstream { status: 404 }.is_service_failure(&classifier));
        assert!(!ResilienceError::RateLimited { endpoint: "api".into() }.is_service_failure(&classifier));
    }

    #[test]
    fn test_error_display() {
        let err = ResilienceError::Upstream { status: 502 };
        assert_eq!(err.to_string(), "upstream responded with status 502");

        let err = ResilienceError::CircuitOpen { endpoint: "api".into() };
        assert!(err.to_string().contains("api"));
    }
}
