//! Request orchestration subsystem.
//!
//! # Data Flow
//! ```text
//! request(key, policy, operation)
//!     → cache check (fresh hit returns immediately)
//!     → rate-limit check (exhausted: stale entry or RateLimited)
//!     → dedup check (join the in-flight call for this key)
//!     → execute: circuit breaker → timeout → retry with backoff
//!     → success: fill cache, resolve every subscriber
//!     → exhausted failure: stale entry (flagged) or the error
//! ```
//!
//! # Design Decisions
//! - The in-flight call runs on its own task, so abandoned callers never
//!   leave a pending entry behind
//! - Telemetry is kept in-process (snapshot/reset) and mirrored to the metrics recorder

pub mod coordinator;
pub mod metrics;

pub use coordinator::{RequestCoordinator, RequestPolicy};
pub use metrics::{MetricsSnapshot, RequestMetrics};
