//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "rakewire_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "rakewire_connections_active";
    pub const MESSAGES_TOTAL: &str = "rakewire_messages_total";
    pub const MESSAGES_BYTES: &str = "rakewire_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "rakewire_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "rakewire_subscriptions_total";
    pub const ACCESS_DENIED_TOTAL: &str = "rakewire_access_denied_total";
    pub const FANOUT_RECIPIENTS: &str = "rakewire_fanout_recipients_total";
    pub const DELIVERY_FAILURES_TOTAL: &str = "rakewire_delivery_failures_total";
    pub const CONNECTIONS_RECLAIMED_TOTAL: &str = "rakewire_connections_reclaimed_total";
    pub const LATENCY_SECONDS: &str = "rakewire_latency_seconds";
    pub const ERRORS_TOTAL: &str = "rakewire_errors_total";
}

/// Record an accepted subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record a refused subscription.
pub fn record_access_denied() {
    counter!(names::ACCESS_DENIED_TOTAL).increment(1);
}

/// Update active channel count.
pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record one fan-out.
pub fn record_fanout(delivered: usize) {
    counter!(names::FANOUT_RECIPIENTS).increment(delivered as u64);
}

/// Record a dropped per-recipient write.
pub fn record_delivery_failure(kind: &'static str) {
    counter!(names::DELIVERY_FAILURES_TOTAL, "kind" => kind).increment(1);
}

/// Record a connection removed by the server rather than the peer.
pub fn record_reclaimed(reason: &'static str) {
    counter!(names::CONNECTIONS_RECLAIMED_TOTAL, "reason" => reason).increment(1);
}

/// Record a frame received from or sent to a client.
pub fn record_message(direction: &'static str, bytes: usize) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a request answered with an error frame.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => kind).increment(1);
}
