//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds and windows > 0)
//! - Validate URLs and addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: ResilienceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{BreakerSettings, ResilienceConfig};

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check `config` and collect every error found.
pub fn validate_config(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let obs = &config.observability;
    if !matches!(obs.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            format!("expected \"pretty\" or \"json\", got \"{}\"", obs.log_format),
        ));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid socket address \"{}\"", obs.metrics_address),
        ));
    }

    check_breaker("circuit_breaker", &config.circuit_breaker.default, &mut errors);
    let mut endpoints: Vec<_> = config.circuit_breaker.endpoints.iter().collect();
    endpoints.sort_by(|a, b| a.0.cmp(b.0));
    for (name, settings) in endpoints {
        check_breaker(&format!("circuit_breaker.endpoints.{}", name), settings, &mut errors);
    }

    let req = &config.requests;
    if req.timeout_ms == 0 {
        errors.push(ValidationError::new("requests.timeout_ms", "must be greater than 0"));
    }
    if req.backoff_base_ms > req.backoff_max_ms {
        errors.push(ValidationError::new(
            "requests.backoff_base_ms",
            "must not exceed requests.backoff_max_ms",
        ));
    }
    let mut limits: Vec<_> = req.rate_limits.iter().collect();
    limits.sort_by(|a, b| a.0.cmp(b.0));
    for (name, limit) in limits {
        if limit.max_per_window == 0 || limit.window_secs == 0 {
            errors.push(ValidationError::new(
                format!("requests.rate_limits.{}", name),
                "max_per_window and window_secs must be greater than 0",
            ));
        }
    }

    if config.cache.cleanup_interval_secs == 0 {
        errors.push(ValidationError::new("cache.cleanup_interval_secs", "must be greater than 0"));
    }

    if config.queue.backoff_base_ms > config.queue.backoff_max_ms {
        errors.push(ValidationError::new(
            "queue.backoff_base_ms",
            "must not exceed queue.backoff_max_ms",
        ));
    }
    if config.queue.default_max_retries == 0 {
        errors.push(ValidationError::new("queue.default_max_retries", "must be greater than 0"));
    }

    let rt = &config.realtime;
    if rt.enabled {
        for (i, endpoint) in rt.endpoints().iter().enumerate() {
            let field = if i == 0 {
                "realtime.primary_url".to_string()
            } else {
                format!("realtime.fallback_urls[{}]", i - 1)
            };
            match url::Url::parse(endpoint) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
                Ok(url) => errors.push(ValidationError::new(
                    field,
                    format!("unsupported scheme \"{}\"", url.scheme()),
                )),
                Err(e) => errors.push(ValidationError::new(field, format!("invalid URL: {}", e))),
            }
        }
        if rt.heartbeat_interval_ms == 0 {
            errors.push(ValidationError::new("realtime.heartbeat_interval_ms", "must be greater than 0"));
        }
        if rt.response_timeout_ms == 0 || rt.response_timeout_ms >= rt.heartbeat_interval_ms {
            errors.push(ValidationError::new(
                "realtime.response_timeout_ms",
                "must be greater than 0 and shorter than heartbeat_interval_ms",
            ));
        }
        if rt.max_buffered_messages == 0 {
            errors.push(ValidationError::new("realtime.max_buffered_messages", "must be greater than 0"));
        }
    }

    if config.auth.inbound_max_per_window == 0 || config.auth.inbound_window_secs == 0 {
        errors.push(ValidationError::new(
            "auth.inbound_max_per_window",
            "inbound limit and window must be greater than 0",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_breaker(prefix: &str, settings: &BreakerSettings, errors: &mut Vec<ValidationError>) {
    if settings.failure_threshold == 0 {
        errors.push(ValidationError::new(
            format!("{}.failure_threshold", prefix),
            "must be greater than 0",
        ));
    }
    if settings.success_threshold == 0 {
        errors.push(ValidationError::new(
            format!("{}.success_threshold", prefix),
            "must be greater than 0",
        ));
    }
    if settings.half_open_max_calls == 0 {
        errors.push(ValidationError::new(
            format!("{}.half_open_max_calls", prefix),
            "must be greater than 0",
        ));
    }
    if let Some(status) = settings.failure_statuses.iter().find(|s| !(100..600).contains(*s)) {
        errors.push(ValidationError::new(
            format!("{}.failure_statuses", prefix),
            format!("{} is not an HTTP status", status),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RateLimitConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&ResilienceConfig::default()), Ok(()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker.default.failure_threshold = 0;
        config.requests.rate_limits.insert(
            "api".to_string(),
            RateLimitConfig { max_per_window: 0, window_secs: 60 },
        );
        config.observability.log_format = "xml".to_string();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "observability.log_format",
                "circuit_breaker.failure_threshold",
                "requests.rate_limits.api"
            ]
        );
    }

    #[test]
    fn test_realtime_checks_only_when_enabled() {
        let mut config = ResilienceConfig::default();
        config.realtime.primary_url = "http://wrong".to_string();
        assert!(validate_config(&config).is_ok());

        config.realtime.enabled = true;
        config.realtime.fallback_urls = vec!["wss://backup.example".to_string(), "nope".to_string()];
        config.realtime.response_timeout_ms = config.realtime.heartbeat_interval_ms;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "realtime.primary_url",
                "realtime.fallback_urls[1]",
                "realtime.response_timeout_ms"
            ]
        );
    }
}
