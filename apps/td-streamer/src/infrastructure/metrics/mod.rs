//! Prometheus Metrics Module
//!
//! Exposes streamer metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: inbound frames by kind, dropped frames
//! - **Records**: segregated records per service, records persisted
//! - **Session**: session state, reconnect attempts, ping round trip
//! - **Sequencing**: detected gaps by severity
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::sequence::GapSeverity;
use crate::domain::service::Service;
use crate::domain::session::SessionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again returns the handle installed the first time.
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
        "td_streamer_frames_received_total",
        "Inbound messages by frame kind"
    );
    describe_counter!(
        "td_streamer_frames_dropped_total",
        "Inbound frames that could not be decoded"
    );
    describe_counter!(
        "td_streamer_records_total",
        "Records segregated into the buffer by service"
    );
    describe_counter!(
        "td_streamer_records_dropped_total",
        "Records evicted from a full buffer by service"
    );
    describe_counter!(
        "td_streamer_records_persisted_total",
        "Records written to the persistence sink by service"
    );
    describe_counter!(
        "td_streamer_sequence_gaps_total",
        "Sequence gaps by service and severity"
    );
    describe_counter!(
        "td_streamer_bytes_received_total",
        "Inbound WebSocket payload bytes"
    );
    describe_counter!(
        "td_streamer_reconnects_total",
        "Reconnection attempts made by the supervisor"
    );
    describe_counter!(
        "td_streamer_websocket_errors_total",
        "WebSocket errors by type"
    );

    describe_gauge!(
        "td_streamer_session_state",
        "Session state (0 disconnected, 1 connecting, 2 awaiting login, 3 logged in, 4 recovering)"
    );
    describe_gauge!(
        "td_streamer_subscriptions",
        "Active subscription keys by service"
    );
    describe_gauge!(
        "td_streamer_download_bytes_per_second",
        "Inbound payload bytes in the last second"
    );

    describe_histogram!(
        "td_streamer_ping_rtt_seconds",
        "Round trip of QOS requests"
    );
    describe_histogram!(
        "td_streamer_frame_processing_seconds",
        "Time to decode, segregate and buffer one frame"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one inbound message of `kind`.
pub fn record_frame_received(kind: &'static str) {
    counter!("td_streamer_frames_received_total", "kind" => kind).increment(1);
}

/// Record a frame that failed to decode.
pub fn record_frame_dropped() {
    counter!("td_streamer_frames_dropped_total").increment(1);
}

/// Record inbound payload bytes.
pub fn record_bytes_received(bytes: u64) {
    counter!("td_streamer_bytes_received_total").increment(bytes);
}

/// Record records appended to the buffer.
pub fn record_records(service: &Service, count: u64) {
    counter!(
        "td_streamer_records_total",
        "service" => service.as_str().to_string()
    )
    .increment(count);
}

/// Record records evicted from a full buffer.
pub fn record_records_dropped(service: &Service, count: u64) {
    counter!(
        "td_streamer_records_dropped_total",
        "service" => service.as_str().to_string()
    )
    .increment(count);
}

/// Record records written by the sink.
pub fn record_persisted(service: &Service, count: u64) {
    counter!(
        "td_streamer_records_persisted_total",
        "service" => service.as_str().to_string()
    )
    .increment(count);
}

/// Record a detected sequence gap.
pub fn record_sequence_gap(service: &Service, severity: GapSeverity) {
    counter!(
        "td_streamer_sequence_gaps_total",
        "service" => service.as_str().to_string(),
        "severity" => severity.as_str()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("td_streamer_reconnects_total").increment(1);
}

/// Record a WebSocket error.
pub fn record_websocket_error(error_type: &str) {
    counter!(
        "td_streamer_websocket_errors_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Publish the session state.
pub fn set_session_state(state: SessionState) {
    gauge!("td_streamer_session_state").set(f64::from(state.code()));
}

/// Publish the subscribed key count of a service.
pub fn set_subscriptions(service: &Service, count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!(
        "td_streamer_subscriptions",
        "service" => service.as_str().to_string()
    )
    .set(count as f64);
}

/// Publish the current download rate.
pub fn set_download_rate(bytes_per_second: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("td_streamer_download_bytes_per_second").set(bytes_per_second as f64);
}

/// Record a QOS round trip.
pub fn record_ping_rtt(rtt: Duration) {
    histogram!("td_streamer_ping_rtt_seconds").record(rtt.as_secs_f64());
}

/// Record frame processing time.
pub fn record_processing_duration(duration: Duration) {
    histogram!("td_streamer_frame_processing_seconds").record(duration.as_secs_f64());
}
