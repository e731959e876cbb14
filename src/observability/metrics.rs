//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define pipeline metrics (requests, latency, aborts, CGI failures)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-route and per-network figures
//!
//! # Metrics
//! - `webpipes_requests_total` (counter): requests by route, status
//! - `webpipes_request_duration_seconds` (histogram): latency by route
//! - `webpipes_chain_aborts_total` (counter): chains stopped early, by stage
//! - `webpipes_cgi_failures_total` (counter): gateway failures by reason
//! - `webpipes_network_pending` (gauge): registered completions per network
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so library users and
//!   tests pay nothing
//! - Labels are low-cardinality: route pattern, never the raw path

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a finished request.
pub fn record_request(route: &str, status: u16, start: Instant) {
    counter!(
        "webpipes_requests_total",
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("webpipes_request_duration_seconds", "route" => route.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// Record a chain stopped by a stage returning false.
pub fn record_abort(stage: &'static str) {
    counter!("webpipes_chain_aborts_total", "stage" => stage).increment(1);
}

/// Record a CGI gateway failure.
pub fn record_cgi_failure(reason: &'static str) {
    counter!("webpipes_cgi_failures_total", "reason" => reason).increment(1);
}

/// Publish the number of requests awaiting completion in a network.
pub fn record_pending(network: &str, pending: usize) {
    gauge!("webpipes_network_pending", "network" => network.to_string()).set(pending as f64);
}
