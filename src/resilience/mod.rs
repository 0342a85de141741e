//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a remote endpoint:
//!     → rate_limit.rs (per-endpoint fixed window)
//!     → circuit_breaker.rs (fail fast while the endpoint is known to be down)
//!     → timeouts.rs (hard deadline per attempt)
//!     → On failure: retries.rs (classify), backoff.rs (delay before next attempt)
//! ```
//!
//! # Design Decisions
//! - Every attempt has a deadline; a timeout is a service failure
//! - Only service failures trip circuits and are retried
//! - One breaker per endpoint, with independent thresholds

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limit;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use rate_limit::RateLimiter;
pub use retries::FailureClassifier;
