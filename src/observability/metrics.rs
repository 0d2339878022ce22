//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_requests_total` (counter): dispatched messages by kind and outcome
//! - `relay_request_duration_seconds` (histogram): dispatch latency
//! - `relay_active_connections` (gauge): connected peers
//! - `relay_services_registered` (gauge): routable services
//! - `relay_correlation_timeouts_total` (counter): requests that hit their deadline
//! - `relay_queue_rejections_total` (counter): admissions refused, by service
//! - `relay_rate_limited_total` (counter): requests refused by the rate limiter
//! - `relay_peer_health` (gauge): 1=healthy, 0=unhealthy, by client

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(kind: &str, outcome: &'static str, start: Instant) {
    counter!("relay_requests_total", "kind" => kind.to_string(), "outcome" => outcome).increment(1);
    histogram!("relay_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn set_active_connections(count: u64) {
    gauge!("relay_active_connections").set(count as f64);
}

pub fn set_services_registered(count: usize) {
    gauge!("relay_services_registered").set(count as f64);
}

pub fn record_correlation_timeout() {
    counter!("relay_correlation_timeouts_total").increment(1);
}

pub fn record_queue_rejection(service: &str) {
    counter!("relay_queue_rejections_total", "service" => service.to_string()).increment(1);
}

pub fn record_rate_limited() {
    counter!("relay_rate_limited_total").increment(1);
}

pub fn record_peer_health(client: &str, healthy: bool) {
    gauge!("relay_peer_health", "client" => client.to_string()).set(if healthy { 1.0 } else { 0.0 });
}
