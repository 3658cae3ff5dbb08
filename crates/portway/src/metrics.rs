//! Prometheus metrics for portway.
//!
//! Tracks relayed connections and bytes per rule, plus rule lifecycle
//! transitions and admin API requests.
use crate::forward::RuleState;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use tracing::warn;

lazy_static! {
    /// Connections relayed per rule
    pub static ref CONNECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "portway_connections_total",
        "Total number of connections relayed",
        &["rule"]
    )
    .unwrap();

    /// Connections currently open per rule
    pub static ref ACTIVE_CONNECTIONS: GaugeVec = register_gauge_vec!(
        "portway_active_connections",
        "Number of connections currently being relayed",
        &["rule"]
    )
    .unwrap();

    /// Bytes relayed per rule and direction
    pub static ref BYTES_TOTAL: CounterVec = register_counter_vec!(
        "portway_bytes_total",
        "Total number of bytes relayed",
        &["rule", "direction"]  // direction: in (client to target) | out (target to client)
    )
    .unwrap();

    /// Dial, relay and listener errors per rule
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "portway_errors_total",
        "Total number of dial, relay and listener errors",
        &["rule"]
    )
    .unwrap();

    /// Rule state transitions
    pub static ref RULE_TRANSITIONS_TOTAL: CounterVec = register_counter_vec!(
        "portway_rule_transitions_total",
        "Total number of rule state transitions by target state",
        &["state"]
    )
    .unwrap();

    /// Admin API requests
    pub static ref ADMIN_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "portway_admin_requests_total",
        "Total number of admin API requests",
        &["method", "status"]
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_connection_opened(rule: &str) {
    CONNECTIONS_TOTAL.with_label_values(&[rule]).inc();
    ACTIVE_CONNECTIONS.with_label_values(&[rule]).inc();
}

pub fn record_connection_closed(rule: &str) {
    ACTIVE_CONNECTIONS.with_label_values(&[rule]).dec();
}

pub fn record_bytes(rule: &str, direction: &str, n: u64) {
    BYTES_TOTAL
        .with_label_values(&[rule, direction])
        .inc_by(n as f64);
}

pub fn record_error(rule: &str) {
    ERRORS_TOTAL.with_label_values(&[rule]).inc();
}

pub fn record_transition(state: RuleState) {
    RULE_TRANSITIONS_TOTAL
        .with_label_values(&[state.as_str()])
        .inc();
}

/// Helper to record admin API request processing
pub fn record_request(method: &str, status: u16) {
    ADMIN_REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
}

/// Drop every label set of a deleted rule
pub fn remove_rule(rule: &str) {
    // Label sets that were never touched are not an error worth reporting
    let _ = CONNECTIONS_TOTAL.remove_label_values(&[rule]);
    let _ = ACTIVE_CONNECTIONS.remove_label_values(&[rule]);
    let _ = ERRORS_TOTAL.remove_label_values(&[rule]);
    for direction in ["in", "out"] {
        let _ = BYTES_TOTAL.remove_label_values(&[rule, direction]);
    }
}
