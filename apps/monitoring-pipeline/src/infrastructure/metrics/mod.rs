//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Events**: push events received by kind, protocol anomalies by kind
//! - **Batches**: chunked transfers completed and evicted
//! - **Connection**: state gauge, reconnect attempts, request latency
//! - **Subscriptions**: active subscription gauge
//! - **Alarms**: emergency auto-clears, bulk item outcomes
//! - **Listeners**: listener failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "monitoring_pipeline_events_received_total",
        "Push events received by kind"
    );
    describe_counter!(
        "monitoring_pipeline_protocol_anomalies_total",
        "Malformed or inconsistent frames and chunks dropped"
    );

    describe_counter!(
        "monitoring_pipeline_batches_completed_total",
        "Chunked transfers reassembled and delivered"
    );
    describe_counter!(
        "monitoring_pipeline_batches_evicted_total",
        "Incomplete chunked transfers dropped by the staleness sweep"
    );

    describe_gauge!(
        "monitoring_pipeline_connection_state",
        "Connection state (0=disconnected 1=connecting 2=connected 3=reconnecting 4=error)"
    );
    describe_counter!(
        "monitoring_pipeline_reconnects_total",
        "Reconnection attempts scheduled"
    );
    describe_histogram!(
        "monitoring_pipeline_request_seconds",
        "Round-trip time of requests over the push link"
    );

    describe_gauge!(
        "monitoring_pipeline_subscriptions_active",
        "Equipment subscriptions currently requested"
    );

    describe_counter!(
        "monitoring_pipeline_listener_failures_total",
        "Listener errors and panics during dispatch"
    );
    describe_counter!(
        "monitoring_pipeline_emergency_auto_clears_total",
        "Emergency flags cleared by timeout"
    );
    describe_counter!(
        "monitoring_pipeline_bulk_items_total",
        "Bulk operation items by outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// How a listener failed.
#[derive(Debug, Clone, Copy)]
pub enum ListenerFailure {
    /// The listener returned an error.
    Error,
    /// The listener panicked.
    Panic,
}

impl ListenerFailure {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Panic => "panic",
        }
    }
}

/// Record a push event received from the server.
pub fn record_event_received(kind: &'static str) {
    counter!("monitoring_pipeline_events_received_total", "kind" => kind).increment(1);
}

/// Record a dropped protocol anomaly.
pub fn record_protocol_anomaly(kind: &'static str) {
    counter!("monitoring_pipeline_protocol_anomalies_total", "kind" => kind).increment(1);
}

/// Record a reassembled transfer.
pub fn record_batch_completed(is_history: bool) {
    counter!(
        "monitoring_pipeline_batches_completed_total",
        "history" => if is_history { "true" } else { "false" }
    )
    .increment(1);
}

/// Record transfers dropped by the staleness sweep.
pub fn record_batches_evicted(count: u64) {
    counter!("monitoring_pipeline_batches_evicted_total").increment(count);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("monitoring_pipeline_connection_state").set(state.gauge_value());
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect() {
    counter!("monitoring_pipeline_reconnects_total").increment(1);
}

/// Record the round-trip time of a link request.
pub fn record_request_duration(event: &'static str, duration: Duration) {
    histogram!("monitoring_pipeline_request_seconds", "event" => event).record(duration.as_secs_f64());
}

/// Update the active subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("monitoring_pipeline_subscriptions_active").set(count as f64);
}

/// Record a listener failure.
pub fn record_listener_failure(listener: &str, failure: ListenerFailure) {
    counter!(
        "monitoring_pipeline_listener_failures_total",
        "listener" => listener.to_string(),
        "failure" => failure.as_str()
    )
    .increment(1);
}

/// Record an emergency flag cleared by timeout.
pub fn record_emergency_auto_clear() {
    counter!("monitoring_pipeline_emergency_auto_clears_total").increment(1);
}

/// Record the outcome of one bulk item.
pub fn record_bulk_item(operation: &'static str, outcome: &'static str) {
    counter!(
        "monitoring_pipeline_bulk_items_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
