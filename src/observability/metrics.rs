//! Prometheus metrics.
//!
//! All metric names are described once at startup; the recorder handle is
//! rendered by the gateway's own `/metrics` endpoint. A background sampler
//! keeps the process-level gauges (uptime, resident memory) fresh.

use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tracing::debug;

use crate::core::CircuitState;

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Install the Prometheus recorder and describe every metric the gateway
/// emits. Returns the handle the `/metrics` endpoint renders.
pub fn init_metrics() -> Result<PrometheusHandle, String> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| e.to_string())?
        .install_recorder()
        .map_err(|e| e.to_string())?;

    describe_gauge!("gateway_uptime_seconds", "Gateway uptime in seconds");
    describe_gauge!(
        "gateway_memory_resident_bytes",
        "Resident memory of the gateway process in bytes"
    );
    describe_gauge!(
        "gateway_inflight_requests",
        "Requests currently being processed"
    );
    describe_counter!(
        "gateway_requests_total",
        "Total HTTP requests by method and status"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Request duration in seconds"
    );
    describe_counter!(
        "gateway_panics_recovered_total",
        "Panics caught by the recovery middleware"
    );
    describe_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the per-IP rate limiter"
    );

    describe_gauge!(
        "gateway_cb_state",
        "Circuit breaker state per service (0=closed, 1=open, 2=half_open)"
    );
    describe_counter!(
        "gateway_cb_transitions_total",
        "Circuit breaker state transitions by service"
    );

    describe_counter!(
        "gateway_lb_decisions_total",
        "Load balancing decisions by service and endpoint"
    );

    describe_counter!(
        "gateway_discovery_watcher_errors_total",
        "Kubernetes watcher errors by resource"
    );
    describe_counter!(
        "gateway_discovery_watcher_restarts_total",
        "Kubernetes watcher restarts by resource"
    );
    describe_counter!(
        "gateway_discovery_events_dropped_total",
        "Service events dropped because the event channel was full"
    );

    Ok(handle)
}

/// Static helpers so call sites stay one-liners.
pub struct GatewayMetrics;

impl GatewayMetrics {
    pub fn record_request(method: &str, status: u16, duration: Duration) {
        counter!(
            "gateway_requests_total",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!("gateway_request_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn inflight_inc() {
        gauge!("gateway_inflight_requests").increment(1.0);
    }

    pub fn inflight_dec() {
        gauge!("gateway_inflight_requests").decrement(1.0);
    }

    pub fn record_panic() {
        counter!("gateway_panics_recovered_total").increment(1);
    }

    pub fn record_rate_limited() {
        counter!("gateway_rate_limited_total").increment(1);
    }

    pub fn record_cb_transition(service: &str, to: CircuitState) {
        counter!(
            "gateway_cb_transitions_total",
            "service" => service.to_string(),
            "to" => to.to_string()
        )
        .increment(1);
        let value = match to {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        gauge!("gateway_cb_state", "service" => service.to_string()).set(value);
    }

    pub fn record_lb_decision(service: &str, endpoint: &str) {
        counter!(
            "gateway_lb_decisions_total",
            "service" => service.to_string(),
            "endpoint" => endpoint.to_string()
        )
        .increment(1);
    }

    pub fn record_watcher_error(resource: &'static str) {
        counter!("gateway_discovery_watcher_errors_total", "resource" => resource).increment(1);
    }

    pub fn record_watcher_restart(resource: &'static str) {
        counter!("gateway_discovery_watcher_restarts_total", "resource" => resource).increment(1);
    }

    pub fn record_event_dropped() {
        counter!("gateway_discovery_events_dropped_total").increment(1);
    }
}

/// Periodically refresh process-level gauges and run recorder upkeep.
pub fn start_sampler(handle: PrometheusHandle, mut shutdown: watch::Receiver<bool>) {
    let started = Instant::now();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("metrics sampler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    gauge!("gateway_uptime_seconds").set(started.elapsed().as_secs_f64());
                    if let Some(bytes) = resident_memory_bytes() {
                        gauge!("gateway_memory_resident_bytes").set(bytes as f64);
                    }
                    handle.run_upkeep();
                }
            }
        }
    });
}

/// Resident set size from /proc, where available.
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}
