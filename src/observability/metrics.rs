//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ingress_passes_total` (counter): convergence passes by outcome
//! - `ingress_reloads_total` (counter): apply attempts by outcome
//!   (committed, unchanged, test_failed, apply_failed, rolled_back, proxy_down)
//! - `ingress_watch_reloads_total` (counter): change-watch revalidations by outcome
//! - `ingress_proxy_up` (gauge): 1 when the proxy process is running
//!
//! # Design Decisions
//! - Exporter is optional; recording without one is a no-op

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_pass(outcome: &'static str) {
    metrics::counter!("ingress_passes_total", "outcome" => outcome).increment(1);
}

pub fn record_reload(outcome: &'static str) {
    metrics::counter!("ingress_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_watch_reload(outcome: &'static str) {
    metrics::counter!("ingress_watch_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_proxy_up(up: bool) {
    metrics::gauge!("ingress_proxy_up").set(if up { 1.0 } else { 0.0 });
}
