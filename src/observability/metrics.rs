//! Metrics collection and exposition.
//!
//! # Metrics
//! - `resilience_requests_total` (counter): coordinated requests by endpoint, outcome
//! - `resilience_request_duration_seconds` (histogram): latency by endpoint
//! - `resilience_circuit_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `resilience_rate_limited_total` (counter): rejected by rate window
//! - `resilience_cache_lookups_total` (counter): hit, stale, miss
//! - `resilience_fallbacks_total` (counter): calls answered by a fallback
//! - `resilience_queue_size` (gauge), `resilience_queue_actions_total` (counter)
//! - `resilience_connection_state` (gauge), `resilience_realtime_dropped_total` (counter)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

use crate::realtime::state::ConnectionState;
use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(endpoint: &str, outcome: &'static str, start: Instant) {
    counter!("resilience_requests_total", "endpoint" => endpoint.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("resilience_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_circuit_state(endpoint: &str, state: CircuitState) {
    gauge!("resilience_circuit_state", "endpoint" => endpoint.to_string()).set(state as u8 as f64);
}

pub fn record_rate_limited(endpoint: &str) {
    counter!("resilience_rate_limited_total", "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_cache_lookup(result: &'static str) {
    counter!("resilience_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_fallback(endpoint: &str) {
    counter!("resilience_fallbacks_total", "endpoint" => endpoint.to_string()).increment(1);
}

pub fn record_queue_size(size: usize) {
    gauge!("resilience_queue_size").set(size as f64);
}

pub fn record_queue_action(result: &'static str) {
    counter!("resilience_queue_actions_total", "result" => result).increment(1);
}

pub fn record_connection_state(state: ConnectionState) {
    gauge!("resilience_connection_state").set(state as u8 as f64);
}

pub fn record_realtime_dropped(reason: &'static str) {
    counter!("resilience_realtime_dropped_total", "reason" => reason).increment(1);
}
