//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the resilience layer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration for the resilience layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Circuit breaker thresholds, with per-endpoint overrides.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Request coordination defaults (retries, timeouts, rate limits).
    pub requests: RequestConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Durable action queue settings.
    pub queue: QueueConfig,

    /// Realtime connection settings.
    pub realtime: RealtimeConfig,

    /// Static credential used by the default auth collaborator.
    pub auth: AuthConfig,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Exporter bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Thresholds for a single circuit breaker.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive qualifying failures before the circuit opens.
    pub failure_threshold: u32,

    /// Successes in half-open state before the circuit closes.
    pub success_threshold: u32,

    /// Time the circuit stays open after the last failure, in milliseconds.
    pub recovery_timeout_ms: u64,

    /// Trial calls allowed through concurrently while half-open.
    pub half_open_max_calls: u32,

    /// Statuses below 500 that also count as service failures (e.g. 429).
    pub failure_statuses: Vec<u16>,
}

impl BreakerSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 1,
            failure_statuses: Vec::new(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Thresholds for endpoints without an override.
    #[serde(flatten)]
    pub default: BreakerSettings,

    /// Per-endpoint overrides, keyed by endpoint name.
    pub endpoints: HashMap<String, BreakerSettings>,
}

impl CircuitBreakerConfig {
    /// Settings in force for the given endpoint.
    pub fn for_endpoint(&self, endpoint: &str) -> BreakerSettings {
        self.endpoints
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Per-endpoint rate window.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_per_window: u32,

    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Request coordination defaults.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub backoff_max_ms: u64,

    /// Hard timeout per attempt in milliseconds.
    pub timeout_ms: u64,

    /// Rate windows keyed by endpoint name.
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 300,
            backoff_max_ms: 10_000,
            timeout_ms: 10_000,
            rate_limits: HashMap::new(),
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for routes without a specific entry, in seconds.
    pub default_ttl_secs: u64,

    /// How long expired entries stay available for stale reads, in seconds.
    pub stale_grace_secs: u64,

    /// Interval of the background cleanup task, in seconds.
    pub cleanup_interval_secs: u64,

    /// Route-specific TTLs: key substring -> seconds.
    pub route_ttls: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            stale_grace_secs: 3600,
            cleanup_interval_secs: 60,
            route_ttls: HashMap::new(),
        }
    }
}

/// Durable action queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory of the file-backed store. In-memory when unset.
    pub store_path: Option<String>,

    /// Attempts allowed per action unless overridden at enqueue time.
    pub default_max_retries: u32,

    /// Base delay before a retried action becomes due, in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum retry delay, in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            default_max_retries: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
        }
    }
}

/// Realtime connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable the realtime connection.
    pub enabled: bool,

    /// Primary endpoint URL (e.g. "wss://example.org/realtime").
    pub primary_url: String,

    /// Fallback endpoints, rotated through on reconnect attempts.
    pub fallback_urls: Vec<String>,

    /// Liveness probe interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Deadline for handshake and liveness responses in milliseconds.
    pub response_timeout_ms: u64,

    /// Reconnect attempts before giving up.
    pub reconnect_attempts: u32,

    /// Base reconnect delay in milliseconds.
    pub reconnect_base_ms: u64,

    /// Maximum reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,

    /// Capacity of the outbound buffer.
    pub max_buffered_messages: usize,
}

impl RealtimeConfig {
    /// Primary endpoint followed by the fallbacks.
    pub fn endpoints(&self) -> Vec<String> {
        std::iter::once(self.primary_url.clone())
            .chain(self.fallback_urls.iter().cloned())
            .collect()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            primary_url: String::new(),
            fallback_urls: Vec::new(),
            heartbeat_interval_ms: 30_000,
            response_timeout_ms: 10_000,
            reconnect_attempts: 5,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 30_000,
            max_buffered_messages: 1000,
        }
    }
}

/// Credential and inbound limits for the static auth collaborator.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token presented in the realtime handshake.
    pub token: String,

    /// Identity presented alongside the token.
    pub identity: String,

    /// Inbound realtime messages allowed per window and connection.
    pub inbound_max_per_window: u32,

    /// Inbound window length in seconds.
    pub inbound_window_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            identity: String::new(),
            inbound_max_per_window: 100,
            inbound_window_secs: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: ResilienceConfig = toml::from_str("").unwrap();
        assert_eq!(config, ResilienceConfig::default());
        assert_eq!(config.circuit_breaker.default.failure_threshold, 5);
        assert_eq!(config.requests.max_retries, 3);
    }

    #[test]
    fn test_endpoint_override() {
        let config: ResilienceConfig = toml::from_str(
            r#"
            [circuit_breaker]
            failure_threshold = 10

            [circuit_breaker.endpoints.realtime]
            failure_threshold = 2
            recovery_timeout_ms = 5000
            failure_statuses = [429]

            [requests.rate_limits.api]
            max_per_window = 3
            window_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.for_endpoint("api").failure_threshold, 10);
        let realtime = config.circuit_breaker.for_endpoint("realtime");
        assert_eq!(realtime.failure_threshold, 2);
        assert_eq!(realtime.failure_statuses, vec![429]);
        assert_eq!(config.requests.rate_limits["api"].max_per_window, 3);
    }

    #[test]
    fn test_realtime_endpoint_order() {
        let config = RealtimeConfig {
            primary_url: "ws://a".into(),
            fallback_urls: vec!["ws://b".into(), "ws://c".into()],
            ..Default::default()
        };
        assert_eq!(config.endpoints(), vec!["ws://a", "ws://b", "ws://c"]);
    }
}
