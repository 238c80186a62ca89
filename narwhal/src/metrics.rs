//! Prometheus metrics instrumentation for narwhal.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `narwhal_runs_started_total` - Runs accepted by the coordinator
//! - `narwhal_runs_completed_total` - Runs reaching a terminal status
//! - `narwhal_bus_dropped_total` - Messages dropped for lagging subscribers
//! - `narwhal_worker_log_drops_total` - Worker log lines dropped before publish
//!
//! ## Gauges
//! - `narwhal_stream_clients` - Currently connected streaming clients
//!
//! ## Histograms
//! - `narwhal_run_duration_seconds` - Run execution duration in seconds
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::LazyLock;

/// Global Prometheus registry for narwhal metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for runs accepted by the coordinator.
///
/// Labels:
/// - `kind`: the runnable kind (agent, team)
pub static RUNS_STARTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "narwhal_runs_started_total",
        "Total number of runs accepted by the coordinator",
    );
    CounterVec::new(opts, &["kind"])
        .expect("narwhal_runs_started_total metric creation failed")
});

/// Counter for runs reaching a terminal status.
///
/// Labels:
/// - `status`: the terminal status (completed, failed, cancelled)
pub static RUNS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "narwhal_runs_completed_total",
        "Total number of runs reaching a terminal status",
    );
    CounterVec::new(opts, &["status"])
        .expect("narwhal_runs_completed_total metric creation failed")
});

/// Counter for bus messages dropped because a subscriber lagged past its
/// bounded buffer.
///
/// Labels:
/// - `channel_kind`: the channel family (results, logs)
pub static BUS_DROPPED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "narwhal_bus_dropped_total",
        "Total number of bus messages dropped for lagging subscribers",
    );
    CounterVec::new(opts, &["channel_kind"])
        .expect("narwhal_bus_dropped_total metric creation failed")
});

/// Counter for worker log lines dropped before reaching the bus.
pub static WORKER_LOG_DROPS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "narwhal_worker_log_drops_total",
        "Total number of worker log lines dropped before publish",
    )
    .expect("narwhal_worker_log_drops_total metric creation failed")
});

/// Histogram for run execution duration in seconds, measured from
/// `started_at` to `ended_at`.
///
/// Labels:
/// - `status`: the terminal status (completed, failed, cancelled)
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.1, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "narwhal_run_duration_seconds",
        "Run execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("narwhal_run_duration_seconds metric creation failed")
});

/// Gauge for currently connected streaming clients.
///
/// Labels:
/// - `kind`: the stream kind (results, logs)
pub static STREAM_CLIENTS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "narwhal_stream_clients",
        "Currently connected streaming clients",
    );
    GaugeVec::new(opts, &["kind"])
        .expect("narwhal_stream_clients metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_STARTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_COMPLETED_TOTAL.clone()),
        Box::new(BUS_DROPPED_TOTAL.clone()),
        Box::new(WORKER_LOG_DROPS_TOTAL.clone()),
        Box::new(STREAM_CLIENTS.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Helper to record an accepted run.
pub fn record_run_started(kind: &str) {
    RUNS_STARTED_TOTAL.with_label_values(&[kind]).inc();
}

/// Helper to record a run reaching a terminal status.
pub fn record_run_completed(status: &str) {
    RUNS_COMPLETED_TOTAL.with_label_values(&[status]).inc();
}

/// Helper to record dropped bus messages.
pub fn record_bus_dropped(channel_kind: &str, count: u64) {
    BUS_DROPPED_TOTAL
        .with_label_values(&[channel_kind])
        .inc_by(count as f64);
}

/// Helper to record a dropped worker log line.
pub fn record_log_drop() {
    WORKER_LOG_DROPS_TOTAL.inc();
}

/// Helper to observe a run's execution duration.
pub fn observe_run_duration(status: &str, duration_secs: f64) {
    RUN_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Helper to adjust the connected-client gauge.
pub fn adjust_stream_clients(kind: &str, delta: f64) {
    STREAM_CLIENTS.with_label_values(&[kind]).add(delta);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
    }

    #[test]
    fn test_record_helpers() {
        record_run_started("agent");
        record_run_completed("completed");
        record_bus_dropped("results", 3);
        record_log_drop();
        observe_run_duration("completed", 1.5);
        adjust_stream_clients("logs", 1.0);
        adjust_stream_clients("logs", -1.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");
        record_run_started("agent");
        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("narwhal_runs_started_total"));
    }
}
