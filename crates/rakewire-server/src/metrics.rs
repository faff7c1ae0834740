//! Metrics export for the Rakewire server.
//!
//! Instrumentation lives next to the code it measures (see
//! [`rakewire_core::telemetry`]); this module describes the metrics and
//! serves them in Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use rakewire_core::telemetry::names;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of active channels");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscriptions"
    );
    metrics::describe_counter!(
        names::ACCESS_DENIED_TOTAL,
        "Subscriptions refused by the access policy"
    );
    metrics::describe_counter!(
        names::FANOUT_RECIPIENTS,
        "Frames queued to recipients by publishes"
    );
    metrics::describe_counter!(
        names::DELIVERY_FAILURES_TOTAL,
        "Per-recipient writes dropped during fan-out"
    );
    metrics::describe_counter!(
        names::CONNECTIONS_RECLAIMED_TOTAL,
        "Connections terminated by liveness checks"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!(%addr, "Metrics server listening");
    Ok(())
}

/// Record inbound frame handling time.
pub fn record_latency(elapsed: Duration) {
    histogram!(names::LATENCY_SECONDS).record(elapsed.as_secs_f64());
}

/// Record a transport-level error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
