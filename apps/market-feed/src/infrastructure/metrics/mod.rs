//! Prometheus Metrics Module
//!
//! Exposes feed metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Ingest**: frames received, records accepted or rejected, decode errors
//! - **Connection**: status gauge, reconnect attempts, retry exhaustion
//! - **Polling**: poll outcomes and skipped ticks
//! - **Fan-out**: listener counts, listener panics, channel drops
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs a recorder, so the
//! library can be used without one.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::price::Admission;
use crate::domain::status::ConnectionStatus;
use crate::infrastructure::config::FeedMode;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed (for example when a
/// different global recorder is already set).
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
    // Ingest
    describe_counter!(
        "market_feed_frames_received_total",
        "Total raw frames or poll responses received"
    );
    describe_counter!(
        "market_feed_records_total",
        "Price records offered to the table, by outcome"
    );
    describe_counter!(
        "market_feed_decode_errors_total",
        "Payloads rejected by the decoder, by error kind"
    );
    describe_histogram!(
        "market_feed_ingest_seconds",
        "Time to apply a batch and fan it out"
    );

    // Connection
    describe_gauge!(
        "market_feed_connection_status",
        "Connection status (0 = disconnected, 1 = connecting, 2 = connected)"
    );
    describe_counter!(
        "market_feed_reconnects_total",
        "Total stream reconnection attempts"
    );
    describe_counter!(
        "market_feed_retries_exhausted_total",
        "Times automatic reconnection gave up"
    );

    // Polling
    describe_counter!("market_feed_polls_total", "Poll requests, by outcome");
    describe_counter!(
        "market_feed_poll_ticks_skipped_total",
        "Poll ticks skipped because a request was in flight"
    );

    // Fan-out
    describe_gauge!(
        "market_feed_listeners",
        "Registered listeners, by registry"
    );
    describe_counter!(
        "market_feed_listener_panics_total",
        "Listener callbacks that panicked, by registry"
    );
    describe_counter!(
        "market_feed_channel_drops_total",
        "Snapshots dropped because a consumer channel was full"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for a poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The request returned a usable response.
    Success,
    /// The request failed.
    Failure,
}

impl PollOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Record a frame (stream) or response (poll) received.
pub fn record_frame_received(mode: FeedMode) {
    counter!("market_feed_frames_received_total", "mode" => mode.as_str()).increment(1);
}

/// Record the table's verdict on one record.
pub fn record_admission(admission: &Admission) {
    counter!("market_feed_records_total", "outcome" => admission.as_str()).increment(1);
}

/// Record a decoder rejection.
pub fn record_decode_error(kind: &'static str) {
    counter!("market_feed_decode_errors_total", "kind" => kind).increment(1);
}

/// Record the time spent applying and dispatching one batch.
pub fn record_ingest_duration(duration: Duration) {
    histogram!("market_feed_ingest_seconds").record(duration.as_secs_f64());
}

/// Update the connection status gauge.
pub fn set_connection_status(mode: FeedMode, status: ConnectionStatus) {
    gauge!("market_feed_connection_status", "mode" => mode.as_str()).set(status.as_gauge());
}

/// Record a stream reconnection attempt.
pub fn record_reconnect() {
    counter!("market_feed_reconnects_total").increment(1);
}

/// Record that automatic reconnection gave up.
pub fn record_retries_exhausted() {
    counter!("market_feed_retries_exhausted_total").increment(1);
}

/// Record a poll result.
pub fn record_poll(outcome: PollOutcome) {
    counter!("market_feed_polls_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record a poll tick skipped due to an in-flight request.
pub fn record_poll_tick_skipped() {
    counter!("market_feed_poll_ticks_skipped_total").increment(1);
}

/// Update the listener count for a registry.
pub fn set_listeners(registry: &'static str, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    let count = count as f64;
    gauge!("market_feed_listeners", "registry" => registry).set(count);
}

/// Record a listener callback panic.
pub fn record_listener_panic(registry: &'static str) {
    counter!("market_feed_listener_panics_total", "registry" => registry).increment(1);
}

/// Record a snapshot dropped for a full consumer channel.
pub fn record_channel_drop() {
    counter!("market_feed_channel_drops_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
