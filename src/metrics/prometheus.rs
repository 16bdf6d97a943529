//! Prometheus metrics registration and export.
//!
//! Metrics are opt-in: nothing is registered until [`init_metrics`] runs,
//! and recording through [`MetricsCollector`](super::MetricsCollector) is a
//! no-op before that.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all relq metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs that left the processing list, labeled by outcome
/// (`completed`, `failed`, `retried`, `abandoned`).
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Time spent in `perform`, labeled by job type.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of identifiers per store list, labeled by list key.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently executing `perform`.
pub static ACTIVE_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it more than once is harmless: later calls keep the metrics
/// registered by the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let jobs_total = CounterVec::new(
        Opts::new("relq_jobs_total", "Jobs that left the processing list"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("relq_job_duration_seconds", "Job perform duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["job_type"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("relq_queue_depth", "Number of jobs per queue list"),
        &["list"],
    )?;

    let active_jobs = Gauge::new("relq_active_jobs", "Number of jobs currently executing")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_jobs.clone()))?;

    // If any of these fail, another thread initialized first.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_JOBS.set(active_jobs);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
