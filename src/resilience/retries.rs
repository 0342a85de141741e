//! Retry classification.
//!
//! # Responsibilities
//! - Decide which upstream statuses are service failures for an endpoint
//! - Service failures are retried and count against the circuit
//!
//! # Design Decisions
//! - Connection errors and timeouts always qualify (see `ResilienceError::is_service_failure`)
//! - 5xx always qualifies; selected 4xx (e.g. 429) can be opted in per endpoint
//! - Every other 4xx is a client error and fails immediately

use crate::config::schema::BreakerSettings;

/// Per-endpoint rule for which statuses count as service failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureClassifier {
    extra_statuses: Vec<u16>,
}

impl FailureClassifier {
    /// Classifier that additionally treats `statuses` as service failures.
    pub fn with_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            extra_statuses: statuses.into_iter().collect(),
        }
    }

    pub fn from_settings(settings: &BreakerSettings) -> Self {
        Self::with_statuses(settings.failure_statuses.iter().copied())
    }

    /// Returns true if `status` is a service failure.
    pub fn is_service_failure(&self, status: u16) -> bool {
        status >= 500 || self.extra_statuses.contains(&status)
    }

    /// Returns true if `status` is a client error that must not be retried.
    pub fn is_client_error(&self, status: u16) -> bool {
        (400..500).contains(&status) && !self.is_service_failure(status)
    }
}
