//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via `metrics`)
//!
//! Consumers:
//!     → stdout (pretty or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Structured fields (endpoint, key, state) on every event
//! - Metric updates are no-ops until a recorder is installed
//! - In-process request telemetry lives in `request::metrics`, independent of the exporter

pub mod logging;
pub mod metrics;
