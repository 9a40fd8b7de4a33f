//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOB_RETRIES, JOB_RUNS_TOTAL, QUERY_JOBS_REAPED,
    QUERY_JOBS_TOTAL, QUERY_JOB_DURATION, RUNS_TOTAL, RUN_DURATION,
};

/// Metrics collector for recording orchestrator metrics.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) has
/// run, so components can record unconditionally.
///
/// # Example
///
/// ```ignore
/// use catalog_orchestrator::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_run("success", Some(42.0));
/// collector.record_query_job("retrying", 0.8);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finalized pipeline run.
    pub fn record_run(&self, status: &str, duration_secs: Option<f64>) {
        if let Some(runs_total) = RUNS_TOTAL.get() {
            runs_total.with_label_values(&[status]).inc();
        }

        if let (Some(run_duration), Some(secs)) = (RUN_DURATION.get(), duration_secs) {
            run_duration.observe(secs);
        }

        tracing::trace!(status = status, "Recorded run metric");
    }

    /// Record a finalized job-run.
    pub fn record_job_run(&self, status: &str) {
        if let Some(job_runs_total) = JOB_RUNS_TOTAL.get() {
            job_runs_total.with_label_values(&[status]).inc();
        }
    }

    pub fn record_job_retry(&self) {
        if let Some(job_retries) = JOB_RETRIES.get() {
            job_retries.inc();
        }
    }

    /// Record the outcome of one query job attempt.
    ///
    /// # Arguments
    ///
    /// * `status` - Status the attempt left the job in (e.g. "succeeded", "retrying")
    /// * `duration_secs` - Time spent executing the attempt
    pub fn record_query_job(&self, status: &str, duration_secs: f64) {
        if let Some(query_jobs_total) = QUERY_JOBS_TOTAL.get() {
            query_jobs_total.with_label_values(&[status]).inc();
        }

        if let Some(query_job_duration) = QUERY_JOB_DURATION.get() {
            query_job_duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            "Recorded query job metric"
        );
    }

    pub fn record_reaped(&self, count: u64) {
        if let Some(reaped) = QUERY_JOBS_REAPED.get() {
            reaped.inc_by(count as f64);
        }
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_is_zero_sized() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_run_and_job_runs() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_run("success", Some(12.5));
        collector.record_run("cancelled", None);
        collector.record_job_run("skipped");
        collector.record_job_retry();

        let text = export_metrics();
        assert!(text.contains("orchestrator_runs_total"));
        assert!(text.contains("orchestrator_job_runs_total"));
    }

    #[test]
    fn test_record_query_jobs() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_query_job("succeeded", 0.2);
        collector.record_query_job("retrying", 1.5);
        collector.record_reaped(2);

        assert!(export_metrics().contains("orchestrator_query_jobs_total"));
    }

    #[test]
    fn test_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_workers(4);
        collector.inc_jobs_in_progress();
        collector.dec_jobs_in_progress();
    }
}
