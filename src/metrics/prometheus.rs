//! Prometheus metrics registration and export.
//!
//! This module defines the Prometheus metrics used by the orchestrator and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all orchestrator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Pipeline runs finalized, labeled by terminal status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall time from run start to finalize, in seconds.
pub static RUN_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Job-runs finalized, labeled by terminal status.
pub static JOB_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job attempts retried after a transient failure.
pub static JOB_RETRIES: OnceLock<Counter> = OnceLock::new();

/// Query job attempts finished, labeled by resulting status.
pub static QUERY_JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Query job attempt duration in seconds.
pub static QUERY_JOB_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Query jobs taken back from workers whose heartbeat expired.
pub static QUERY_JOBS_REAPED: OnceLock<Counter> = OnceLock::new();

/// Number of job-runs and query jobs currently executing.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// through [`MetricsCollector`](super::MetricsCollector) before this call is
/// a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Run metrics
    let runs_total = CounterVec::new(
        Opts::new("orchestrator_runs_total", "Pipeline runs finalized"),
        &["status"],
    )?;

    let run_duration = Histogram::with_opts(
        HistogramOpts::new(
            "orchestrator_run_duration_seconds",
            "Pipeline run duration in seconds",
        )
        .buckets(vec![1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
    )?;

    let job_runs_total = CounterVec::new(
        Opts::new("orchestrator_job_runs_total", "Job-runs finalized"),
        &["status"],
    )?;

    let job_retries = Counter::new(
        "orchestrator_job_retries_total",
        "Job attempts retried after a transient failure",
    )?;

    // Query job metrics
    let query_jobs_total = CounterVec::new(
        Opts::new("orchestrator_query_jobs_total", "Query job attempts finished"),
        &["status"],
    )?;

    let query_job_duration = Histogram::with_opts(
        HistogramOpts::new(
            "orchestrator_query_job_duration_seconds",
            "Query job attempt duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
    )?;

    let query_jobs_reaped = Counter::new(
        "orchestrator_query_jobs_reaped_total",
        "Query jobs reclaimed after heartbeat expiry",
    )?;

    // Worker metrics
    let jobs_in_progress = Gauge::new(
        "orchestrator_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let active_workers = Gauge::new("orchestrator_active_workers", "Number of active workers")?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(job_runs_total.clone()))?;
    registry.register(Box::new(job_retries.clone()))?;
    registry.register(Box::new(query_jobs_total.clone()))?;
    registry.register(Box::new(query_job_duration.clone()))?;
    registry.register(Box::new(query_jobs_reaped.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = JOB_RUNS_TOTAL.set(job_runs_total);
    let _ = JOB_RETRIES.set(job_retries);
    let _ = QUERY_JOBS_TOTAL.set(query_jobs_total);
    let _ = QUERY_JOB_DURATION.set(query_job_duration);
    let _ = QUERY_JOBS_REAPED.set(query_jobs_reaped);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, a comment line
/// describing the problem is returned instead.
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
