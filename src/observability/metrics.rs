//! Metrics collection and Prometheus exposition.
//!
//! # Metrics
//! - `edge_guard_requests_total` (counter): requests by endpoint class and outcome
//! - `edge_guard_request_duration_seconds` (histogram): end-to-end latency by class
//! - `edge_guard_denials_total` (counter): deny responses by reason
//! - `edge_guard_security_events_total` (counter): events by type and severity
//! - `edge_guard_auto_blocks_total` (counter): blocks issued
//! - `edge_guard_ip_lookups_total` (counter): IP intelligence lookups by result
//! - `edge_guard_store_errors_total` (counter): store failures by component and policy
//! - `edge_guard_anomaly_score` (histogram): score distribution
//!
//! # Design Decisions
//! - Calls go through the `metrics` facade and are no-ops until a recorder
//!   is installed, so tests need no setup

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub const METRIC_REQUESTS_TOTAL: &str = "edge_guard_requests_total";
pub const METRIC_REQUEST_DURATION: &str = "edge_guard_request_duration_seconds";
pub const METRIC_DENIALS_TOTAL: &str = "edge_guard_denials_total";
pub const METRIC_SECURITY_EVENTS_TOTAL: &str = "edge_guard_security_events_total";
pub const METRIC_AUTO_BLOCKS_TOTAL: &str = "edge_guard_auto_blocks_total";
pub const METRIC_IP_LOOKUPS_TOTAL: &str = "edge_guard_ip_lookups_total";
pub const METRIC_STORE_ERRORS_TOTAL: &str = "edge_guard_store_errors_total";
pub const METRIC_ANOMALY_SCORE: &str = "edge_guard_anomaly_score";

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    describe_counter!(METRIC_REQUESTS_TOTAL, Unit::Count, "Requests handled by class and outcome");
    describe_histogram!(METRIC_REQUEST_DURATION, Unit::Seconds, "End-to-end request latency");
    describe_counter!(METRIC_DENIALS_TOTAL, Unit::Count, "Deny responses by reason");
    describe_counter!(METRIC_SECURITY_EVENTS_TOTAL, Unit::Count, "Security events recorded");
    describe_counter!(METRIC_AUTO_BLOCKS_TOTAL, Unit::Count, "Auto-blocks issued");
    describe_counter!(METRIC_IP_LOOKUPS_TOTAL, Unit::Count, "IP intelligence lookups by result");
    describe_counter!(METRIC_STORE_ERRORS_TOTAL, Unit::Count, "Shared store failures");
    describe_histogram!(METRIC_ANOMALY_SCORE, Unit::Count, "Anomaly score distribution");

    tracing::info!(address = %addr, "Prometheus metrics listener started");
    Ok(())
}

pub fn record_request(class: &str, outcome: &str, duration: Duration) {
    counter!(METRIC_REQUESTS_TOTAL, "class" => class.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!(METRIC_REQUEST_DURATION, "class" => class.to_string()).record(duration.as_secs_f64());
}

pub fn record_denial(reason: &'static str) {
    counter!(METRIC_DENIALS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_security_event(event_type: &'static str, severity: &'static str) {
    counter!(METRIC_SECURITY_EVENTS_TOTAL, "type" => event_type, "severity" => severity).increment(1);
}

pub fn record_auto_block() {
    counter!(METRIC_AUTO_BLOCKS_TOTAL).increment(1);
}

/// `result` is `hit`, `miss` or `error`.
pub fn record_ip_lookup(result: &'static str) {
    counter!(METRIC_IP_LOOKUPS_TOTAL, "result" => result).increment(1);
}

pub fn record_store_error(component: &'static str, policy: &'static str) {
    counter!(METRIC_STORE_ERRORS_TOTAL, "component" => component, "policy" => policy).increment(1);
}

pub fn record_anomaly_score(score: u8) {
    histogram!(METRIC_ANOMALY_SCORE).record(f64::from(score));
}
