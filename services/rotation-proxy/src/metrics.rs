//! Prometheus metrics exposition
//!
//! Counters and histograms recorded on the request path:
//!
//! - `rotation_requests_total` (counter): labels `status`, `method`
//! - `rotation_request_duration_seconds` (histogram): label `status`
//! - `rotation_failover_total` (counter): label `reason`
//! - `rotation_upstream_errors_total` (counter): label `error_type`
//!
//! The pool and refresher record their own counters (`pool_*`); everything
//! lands in the same recorder and renders on `/metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder and return the render handle.
///
/// Explicit buckets make the duration metric render as a real histogram
/// (`_bucket` lines) instead of a summary; the range covers everything from
/// a local cache hit to the 600 s streaming ceiling.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "rotation_request_duration_seconds".to_string(),
            ),
            &[
                0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed client request.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("rotation_requests_total",
        "status" => status.clone(), "method" => method.to_string())
    .increment(1);
    metrics::histogram!("rotation_request_duration_seconds", "status" => status)
        .record(duration_secs);
}

/// Record a failover to another account.
pub fn record_failover(reason: &'static str) {
    metrics::counter!("rotation_failover_total", "reason" => reason).increment(1);
}

/// Record an upstream transport/timeout failure.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("rotation_upstream_errors_total", "error_type" => error_type).increment(1);
}
