//! Prometheus metrics for the probe pipeline
//!
//! This module provides metrics tracking for:
//! - Probes: results by status, probe duration per mode, registry size
//! - Delivery: sink deliveries and failures per sink
//! - Scheduling: registry reloads and failed reloads
//! - Remote clients: retries per client
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

use crate::error::ErrorCategory;
use crate::models::ProbeStatus;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all pipeline metrics
struct PipelineMetrics {
    probes: CounterVec,
    probe_duration: HistogramVec,
    registry_hosts: Gauge,
    sink_deliveries: CounterVec,
    sink_failures: CounterVec,
    reloads: Counter,
    reload_failures: Counter,
    remote_retries: CounterVec,
}

/// `None` when registration failed; recorders are then no-ops
static PIPELINE_METRICS: OnceLock<Option<PipelineMetrics>> = OnceLock::new();

fn metrics() -> Option<&'static PipelineMetrics> {
    PIPELINE_METRICS.get().and_then(Option::as_ref)
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once and from several threads; only the first call
/// registers anything and later callers wait for it.
///
/// ```ignore
/// if let Err(e) = pingfleet::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    let registered = PIPELINE_METRICS.get_or_init(|| match register() {
        Ok(metrics) => {
            tracing::info!("Metrics registered");
            Some(metrics)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Metrics registration failed");
            None
        }
    });

    match registered {
        Some(_) => Ok(()),
        None => Err("pipeline metrics could not be registered".into()),
    }
}

fn register() -> prometheus::Result<PipelineMetrics> {
    Ok(PipelineMetrics {
        probes: register_counter_vec!(
            "pingfleet_probes_total",
            "Total probe results by status",
            &["status"]
        )?,
        probe_duration: register_histogram_vec!(
            "pingfleet_probe_duration_seconds",
            "Wall time of one host probe in seconds",
            &["mode"],
            vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
        registry_hosts: register_gauge!(
            "pingfleet_registry_hosts",
            "Hosts in the current registry snapshot"
        )?,
        sink_deliveries: register_counter_vec!(
            "pingfleet_sink_deliveries_total",
            "Results written successfully by sink",
            &["sink"]
        )?,
        sink_failures: register_counter_vec!(
            "pingfleet_sink_failures_total",
            "Result writes that failed by sink and error category",
            &["sink", "category"]
        )?,
        reloads: register_counter!(
            "pingfleet_registry_reloads_total",
            "Periodic registry reloads"
        )?,
        reload_failures: register_counter!(
            "pingfleet_registry_reload_failures_total",
            "Registry reloads that kept the previous snapshot"
        )?,
        remote_retries: register_counter_vec!(
            "pingfleet_remote_retries_total",
            "Retried remote calls by client",
            &["client"]
        )?,
    })
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    metrics().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
///
/// Written to `--metrics-file` when a run ends.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record one probe result
pub fn record_probe(status: Option<ProbeStatus>) {
    if let Some(m) = metrics() {
        let label = status.map_or("unknown", |s| s.as_str());
        m.probes.with_label_values(&[label]).inc();
    }
}

/// Update the registry size gauge
pub fn set_registry_hosts(count: usize) {
    if let Some(m) = metrics() {
        m.registry_hosts.set(count as f64);
    }
}

/// Record the outcome of one sink write, with the failure category if any
pub fn record_sink_write(sink: &str, failure: Option<ErrorCategory>) {
    let Some(m) = metrics() else {
        return;
    };

    match failure {
        None => m.sink_deliveries.with_label_values(&[sink]).inc(),
        Some(category) => m
            .sink_failures
            .with_label_values(&[sink, category.as_str()])
            .inc(),
    }
}

/// Record a registry reload
pub fn record_reload(ok: bool) {
    let Some(m) = metrics() else {
        return;
    };

    if ok {
        m.reloads.inc();
    } else {
        m.reload_failures.inc();
    }
}

/// Record a retried remote call
pub fn record_remote_retry(client: &str) {
    if let Some(m) = metrics() {
        m.remote_retries.with_label_values(&[client]).inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a probe timer for the given mode label
pub fn start_probe_timer(mode: &str) -> MetricsTimer {
    match metrics() {
        Some(m) => MetricsTimer::new(m.probe_duration.with_label_values(&[mode]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
