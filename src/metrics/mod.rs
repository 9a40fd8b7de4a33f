//! Metrics module for Prometheus-based monitoring.
//!
//! Counts run, job-run and query job outcomes, tracks durations and exposes
//! worker gauges.
//!
//! # Example
//!
//! ```ignore
//! use catalog_orchestrator::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//!
//! let collector = MetricsCollector::new();
//! collector.record_job_run("success");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOB_RETRIES, JOB_RUNS_TOTAL, QUERY_JOBS_REAPED,
    QUERY_JOBS_TOTAL, QUERY_JOB_DURATION, REGISTRY, RUNS_TOTAL, RUN_DURATION,
};
