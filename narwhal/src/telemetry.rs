//! Tracing and telemetry instrumentation for narwhal.
//!
//! Helper functions for creating tracing spans and recording metrics during
//! run lifecycle events. All functions work both with and without the
//! `metrics` feature flag; without it they only emit tracing events.

use tracing::{info_span, Span};

/// Create a tracing span for a run start request.
#[must_use]
pub fn run_start_span(run_id: impl AsRef<str>, kind: impl AsRef<str>) -> Span {
    info_span!(
        "narwhal.start",
        run_id = %run_id.as_ref(),
        kind = %kind.as_ref(),
    )
}

/// Create a tracing span for a streaming connection.
#[must_use]
pub fn stream_span(run_id: impl AsRef<str>, stream_kind: &'static str) -> Span {
    info_span!(
        "narwhal.stream",
        run_id = %run_id.as_ref(),
        kind = stream_kind,
    )
}

/// Create a tracing span for one worker execution.
#[must_use]
pub fn worker_span(run_id: impl AsRef<str>) -> Span {
    info_span!("narwhal.worker", run_id = %run_id.as_ref())
}

/// Record an accepted run.
pub fn record_run_started(kind: &str) {
    tracing::info!(kind = %kind, "run started");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_started(kind);
}

/// Record a run reaching a terminal status.
pub fn record_run_completed(status: &str) {
    tracing::info!(status = %status, "run completed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_completed(status);
}

/// Observe a run's execution duration, from `started_at` to `ended_at`.
pub fn observe_run_duration(status: &str, duration_secs: f64) {
    tracing::info!(
        status = %status,
        duration_secs,
        "run duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_run_duration(status, duration_secs);
}

/// Record bus messages dropped for a lagging subscriber.
pub fn record_bus_dropped(channel_kind: &str, count: u64) {
    tracing::warn!(
        channel_kind = %channel_kind,
        count,
        "subscriber lagged; dropped oldest messages"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_bus_dropped(channel_kind, count);
}

/// Record a worker log line dropped before reaching the bus.
///
/// Deliberately emits no tracing event: this is called from inside the
/// worker's log layer, where an event would feed back into the layer.
pub fn record_log_drop() {
    #[cfg(feature = "metrics")]
    crate::metrics::record_log_drop();
}

/// Record a streaming client connecting.
pub fn record_stream_connected(kind: &'static str) {
    tracing::debug!(kind, "stream client connected");

    #[cfg(feature = "metrics")]
    crate::metrics::adjust_stream_clients(kind, 1.0);
}

/// Record a streaming client disconnecting.
pub fn record_stream_disconnected(kind: &'static str) {
    tracing::debug!(kind, "stream client disconnected");

    #[cfg(feature = "metrics")]
    crate::metrics::adjust_stream_clients(kind, -1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_start_span() {
        let span = run_start_span("run-123", "agent");
        assert_eq!(span.metadata().unwrap().name(), "narwhal.start");
    }

    #[test]
    fn test_stream_span() {
        let span = stream_span("run-123", "results");
        assert_eq!(span.metadata().unwrap().name(), "narwhal.stream");
    }

    #[test]
    fn test_worker_span() {
        let span = worker_span("run-123");
        assert_eq!(span.metadata().unwrap().name(), "narwhal.worker");
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_run_started("agent");
        record_run_completed("completed");
        observe_run_duration("completed", 0.25);
        record_bus_dropped("results", 2);
        record_log_drop();
        record_stream_connected("logs");
        record_stream_disconnected("logs");
    }
}
