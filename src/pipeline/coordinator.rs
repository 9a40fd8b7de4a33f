//! Pipeline run lifecycle.
//!
//! The [`RunCoordinator`] creates runs, drives them batch by batch through
//! the [`JobExecutor`], aggregates the final status and handles both
//! transactional cancellation of Pending runs and cooperative cancellation
//! of Running ones.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use catalog_orchestrator::pipeline::{CoordinatorConfig, RunCoordinator, TriggerType};
//!
//! let coordinator = Arc::new(RunCoordinator::new(store, runner, CoordinatorConfig::default()));
//! let run = coordinator
//!     .trigger(pipeline_id, TriggerType::Manual, "alice", HashMap::new())
//!     .await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{NotebookRunner, RunContext};
use crate::error::{OrchestratorError, ValidationError};
use crate::metrics::MetricsCollector;
use crate::retry::StorageRetry;
use crate::storage::{Storage, StorageError};

use super::config::CoordinatorConfig;
use super::dag::DependencyResolver;
use super::executor::{JobExecutor, JobOutcome, JOB_CANCELLED};
use super::types::{
    Job, JobRun, JobRunStatus, PipelineRun, RunFilter, RunStatus, TriggerType,
};

fn parameter_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex for parameter names")
    })
}

/// Checks that every run parameter name is a plain identifier.
pub fn validate_parameters(parameters: &HashMap<String, String>) -> Result<(), ValidationError> {
    let mut names: Vec<&String> = parameters.keys().collect();
    names.sort();
    match names
        .into_iter()
        .find(|name| !parameter_name_pattern().is_match(name))
    {
        Some(bad) => Err(ValidationError::InvalidParameterName(bad.clone())),
        None => Ok(()),
    }
}

/// Owns the lifecycle of pipeline runs.
pub struct RunCoordinator {
    store: Arc<dyn Storage>,
    executor: JobExecutor,
    resolver: DependencyResolver,
    config: CoordinatorConfig,
    storage_retry: StorageRetry,
    /// Tokens for runs driven by this process, keyed by run id.
    cancel_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
    metrics: MetricsCollector,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn Storage>,
        runner: Arc<dyn NotebookRunner>,
        config: CoordinatorConfig,
    ) -> Self {
        let executor = JobExecutor::new(store.clone(), runner, &config);
        Self {
            storage_retry: config.storage_retry(),
            store,
            executor,
            resolver: DependencyResolver::new(),
            config,
            cancel_tokens: RwLock::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Creates a Pending run after validating the pipeline and the request.
    ///
    /// # Errors
    ///
    /// - `Validation` for a cyclic or dangling dependency graph, an empty
    ///   pipeline, a malformed parameter name, or a scheduled trigger on a
    ///   paused pipeline. No run is created.
    /// - `ConcurrencyLimit` when the pipeline already has as many active runs
    ///   as its cap allows.
    /// - `NotFound` when the pipeline does not exist.
    pub async fn start_run(
        &self,
        pipeline_id: Uuid,
        trigger: TriggerType,
        triggered_by: &str,
        parameters: HashMap<String, String>,
    ) -> Result<PipelineRun, OrchestratorError> {
        let pipeline = self.store.get_pipeline(pipeline_id).await?;

        if pipeline.is_paused && trigger == TriggerType::Scheduled {
            return Err(ValidationError::InvalidInput(format!(
                "pipeline '{}' is paused",
                pipeline.name
            ))
            .into());
        }

        validate_parameters(&parameters)?;

        let jobs = self.store.list_jobs(pipeline_id).await?;
        if jobs.is_empty() {
            return Err(ValidationError::InvalidInput(format!(
                "pipeline '{}' has no jobs",
                pipeline.name
            ))
            .into());
        }
        self.resolver.validate(&jobs)?;

        let cap = pipeline
            .concurrency_limit
            .or(self.config.default_concurrency_cap);
        let run = PipelineRun::new(pipeline_id, trigger, triggered_by, parameters);
        let run = self
            .store
            .create_run(&run, cap)
            .await
            .map_err(|e| match e {
                StorageError::ConcurrencyLimit { active, limit } => {
                    OrchestratorError::ConcurrencyLimit {
                        pipeline_id,
                        active,
                        limit,
                    }
                }
                other => other.into(),
            })?;

        info!(
            run_id = %run.id,
            pipeline = %pipeline.name,
            trigger = %trigger,
            triggered_by = triggered_by,
            "Pipeline run created"
        );
        Ok(run)
    }

    /// Starts a run and drives it on a background task.
    pub async fn trigger(
        self: &Arc<Self>,
        pipeline_id: Uuid,
        trigger: TriggerType,
        triggered_by: &str,
        parameters: HashMap<String, String>,
    ) -> Result<PipelineRun, OrchestratorError> {
        let run = self
            .start_run(pipeline_id, trigger, triggered_by, parameters)
            .await?;
        self.token_for(run.id).await;

        let this = Arc::clone(self);
        let run_id = run.id;
        tokio::spawn(async move {
            if let Err(e) = this.drive(run_id).await {
                error!(run_id = %run_id, error = %e, "Pipeline run driver failed");
            }
        });

        Ok(run)
    }

    /// Drives a Pending run to a terminal status and returns the final row.
    ///
    /// A run that is not Pending is left untouched and returned as stored,
    /// so calling this twice is harmless.
    pub async fn drive(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        let run = match self.store.get_run(run_id).await {
            Ok(run) if run.status == RunStatus::Pending => run,
            other => {
                self.cancel_tokens.write().await.remove(&run_id);
                return Ok(other?);
            }
        };

        let now = Utc::now();
        let started = self
            .storage_retry
            .run("mark_run_started", || self.store.mark_run_started(run_id, now))
            .await;
        if !matches!(started, Ok(true)) {
            self.cancel_tokens.write().await.remove(&run_id);
            started?;
            return Ok(self.store.get_run(run_id).await?);
        }
        info!(run_id = %run_id, "Pipeline run started");

        let token = self.token_for(run_id).await;
        let result = self.drive_started(&run, &token).await;
        self.cancel_tokens.write().await.remove(&run_id);

        if let Err(e) = result {
            error!(run_id = %run_id, error = %e, "Pipeline run aborted");
            let message = e.to_string();
            self.close_open_job_runs(run_id, &message).await;
            if let Err(finish_err) = self
                .finalize(run_id, RunStatus::Failed, Some(&message))
                .await
            {
                error!(run_id = %run_id, error = %finish_err, "Failed to record run failure");
            }
            return Err(e);
        }

        Ok(self.store.get_run(run_id).await?)
    }

    async fn drive_started(
        &self,
        run: &PipelineRun,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let jobs = self.store.list_jobs(run.pipeline_id).await?;
        let batches = match self.resolver.resolve(&jobs) {
            Ok(batches) => batches,
            Err(e) => {
                let message = e.to_string();
                self.finalize(run.id, RunStatus::Failed, Some(&message))
                    .await?;
                return Ok(());
            }
        };

        let job_runs = self.prepare_job_runs(run, &batches).await?;
        let context = RunContext {
            run_id: run.id,
            pipeline_id: run.pipeline_id,
            principal: run.triggered_by.clone(),
            parameters: run.parameters.clone(),
        };

        let mut failure: Option<String> = None;
        let mut cancelled = false;

        for (index, batch) in batches.iter().enumerate() {
            if failure.is_none() && !cancelled && self.cancel_observed(run.id, token).await? {
                info!(run_id = %run.id, batch = index, "Cancellation observed");
                cancelled = true;
            }

            if cancelled || failure.is_some() {
                let (status, message) = if cancelled {
                    (JobRunStatus::Cancelled, Some(JOB_CANCELLED))
                } else {
                    (JobRunStatus::Skipped, None)
                };
                for job in batch {
                    if let Some(job_run) = job_runs.get(&job.id) {
                        self.finish_job_run(job_run, status, message).await?;
                    }
                }
                continue;
            }

            let outcomes = self
                .execute_batch(batch, &job_runs, &context, token)
                .await?;

            for (job, outcome) in batch.iter().zip(outcomes) {
                match outcome.status {
                    JobRunStatus::Failed if failure.is_none() => {
                        failure = Some(
                            outcome
                                .error
                                .unwrap_or_else(|| format!("job '{}' failed", job.name)),
                        );
                    }
                    JobRunStatus::Cancelled => cancelled = true,
                    _ => {}
                }
            }
        }

        let (status, message) = if cancelled {
            (RunStatus::Cancelled, Some(JOB_CANCELLED.to_string()))
        } else if let Some(message) = failure {
            (RunStatus::Failed, Some(message))
        } else {
            (RunStatus::Success, None)
        };
        self.finalize(run.id, status, message.as_deref()).await?;
        Ok(())
    }

    /// Runs one batch concurrently, bounded by `max_parallel_jobs`. Outcomes
    /// are returned in batch order.
    async fn execute_batch(
        &self,
        batch: &[Job],
        job_runs: &HashMap<Uuid, JobRun>,
        context: &RunContext,
        token: &CancellationToken,
    ) -> Result<Vec<JobOutcome>, OrchestratorError> {
        let limiter = Semaphore::new(self.config.max_parallel_jobs);

        let futures: Vec<_> = batch
            .iter()
            .map(|job| {
                let limiter = &limiter;
                async move {
                    let job_run = job_runs.get(&job.id).ok_or_else(|| {
                        StorageError::Corrupt(format!("no job-run prepared for job '{}'", job.name))
                    })?;
                    let _permit = limiter.acquire().await.map_err(|e| {
                        StorageError::Corrupt(format!("job limiter closed: {}", e))
                    })?;
                    self.executor.execute(job_run, job, context, token).await
                }
            })
            .collect();

        let results = futures::future::join_all(futures).await;
        results
            .into_iter()
            .map(|r| r.map_err(OrchestratorError::from))
            .collect()
    }

    /// Creates one Pending job-run per job in resolved order, reusing any
    /// rows already recorded for the run.
    async fn prepare_job_runs(
        &self,
        run: &PipelineRun,
        batches: &[Vec<Job>],
    ) -> Result<HashMap<Uuid, JobRun>, OrchestratorError> {
        let mut by_job: HashMap<Uuid, JobRun> = self
            .store
            .list_job_runs(run.id)
            .await?
            .into_iter()
            .map(|jr| (jr.job_id, jr))
            .collect();

        for job in batches.iter().flatten() {
            if by_job.contains_key(&job.id) {
                continue;
            }
            let job_run = JobRun::new(run.id, job);
            let created = self
                .storage_retry
                .run("create_job_run", || self.store.create_job_run(&job_run))
                .await?;
            by_job.insert(job.id, created);
        }
        Ok(by_job)
    }

    async fn cancel_observed(
        &self,
        run_id: Uuid,
        token: &CancellationToken,
    ) -> Result<bool, OrchestratorError> {
        if token.is_cancelled() {
            return Ok(true);
        }
        let run = self
            .storage_retry
            .run("get_run", || self.store.get_run(run_id))
            .await?;
        if run.cancel_requested {
            token.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    async fn finish_job_run(
        &self,
        job_run: &JobRun,
        status: JobRunStatus,
        message: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let written = self
            .storage_retry
            .run("finish_job_run", || {
                self.store.finish_job_run(job_run.id, status, message, now)
            })
            .await?;
        if written {
            self.metrics.record_job_run(status.as_str());
        }
        Ok(())
    }

    /// Closes the job-runs an aborted drive left open. Rows that never
    /// started become Skipped, the rest Failed with `message`. Best effort:
    /// errors are logged.
    async fn close_open_job_runs(&self, run_id: Uuid, message: &str) {
        let job_runs = match self.store.list_job_runs(run_id).await {
            Ok(job_runs) => job_runs,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to list job-runs of aborted run");
                return;
            }
        };

        for job_run in job_runs.iter().filter(|jr| !jr.status.is_terminal()) {
            let (status, error) = if job_run.started_at.is_none() {
                (JobRunStatus::Skipped, None)
            } else {
                (JobRunStatus::Failed, Some(message))
            };
            if let Err(e) = self.finish_job_run(job_run, status, error).await {
                error!(
                    run_id = %run_id,
                    job_name = %job_run.job_name,
                    error = %e,
                    "Failed to close job-run of aborted run"
                );
            }
        }
    }

    /// Writes the terminal status once. Later calls are no-ops.
    async fn finalize(
        &self,
        run_id: Uuid,
        status: RunStatus,
        message: Option<&str>,
    ) -> Result<bool, OrchestratorError> {
        let now = Utc::now();
        let written = self
            .storage_retry
            .run("finish_run", || {
                self.store.finish_run(run_id, status, message, now)
            })
            .await?;

        if written {
            let run = self.store.get_run(run_id).await?;
            let duration = run.duration().map(|d| d.num_milliseconds() as f64 / 1000.0);
            self.metrics.record_run(status.as_str(), duration);
            match status {
                RunStatus::Failed => warn!(
                    run_id = %run_id,
                    error = message.unwrap_or_default(),
                    "Pipeline run failed"
                ),
                _ => info!(run_id = %run_id, status = %status, "Pipeline run finished"),
            }
        }
        Ok(written)
    }

    async fn token_for(&self, run_id: Uuid) -> CancellationToken {
        let mut tokens = self.cancel_tokens.write().await;
        tokens.entry(run_id).or_default().clone()
    }

    /// Cancels every Pending run of a pipeline in one atomic step and
    /// returns how many were cancelled. Running and terminal runs are left
    /// alone.
    pub async fn cancel_pending(&self, pipeline_id: Uuid) -> Result<u64, OrchestratorError> {
        self.store.get_pipeline(pipeline_id).await?;
        let cancelled = self
            .store
            .cancel_pending_runs(pipeline_id, Utc::now())
            .await?;
        if cancelled > 0 {
            info!(pipeline_id = %pipeline_id, count = cancelled, "Cancelled pending runs");
        }
        Ok(cancelled)
    }

    /// Cancels a single run.
    ///
    /// Pending runs are cancelled immediately. Running runs are flagged and
    /// signalled; the driver stops at its next checkpoint and finalizes the
    /// run as Cancelled.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        match run.status {
            RunStatus::Pending => {
                let written = self.store.cancel_pending_run(run_id, Utc::now()).await?;
                if written {
                    self.metrics.record_run(RunStatus::Cancelled.as_str(), None);
                    info!(run_id = %run_id, "Pending run cancelled");
                    return Ok(self.store.get_run(run_id).await?);
                }
                // The run started meanwhile; fall back to the cooperative path.
                self.request_cancel(run_id).await
            }
            RunStatus::Running => self.request_cancel(run_id).await,
            status => Err(OrchestratorError::InvalidTransition {
                from: status.to_string(),
                reason: "run is already finished".to_string(),
            }),
        }
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        self.store.request_run_cancel(run_id).await?;
        if let Some(token) = self.cancel_tokens.read().await.get(&run_id) {
            token.cancel();
        }
        info!(run_id = %run_id, "Cancellation requested for running run");
        Ok(self.store.get_run(run_id).await?)
    }

    /// Number of Pending or Running runs of a pipeline.
    pub async fn count_active_runs(&self, pipeline_id: Uuid) -> Result<u64, OrchestratorError> {
        Ok(self.store.count_active_runs(pipeline_id).await?)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<PipelineRun, OrchestratorError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<PipelineRun>, OrchestratorError> {
        Ok(self.store.list_runs(filter).await?)
    }

    pub async fn list_job_runs(&self, run_id: Uuid) -> Result<Vec<JobRun>, OrchestratorError> {
        self.store.get_run(run_id).await?;
        Ok(self.store.list_job_runs(run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::ExecutionError;
    use crate::pipeline::Pipeline;
    use crate::storage::{MemoryStore, PipelineStore};

    struct NoopRunner;

    #[async_trait]
    impl NotebookRunner for NoopRunner {
        async fn run_notebook(
            &self,
            _job: &Job,
            _context: &RunContext,
            _attempt: u32,
            _cancel: CancellationToken,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    #[test]
    fn test_parameter_names() {
        let mut params = HashMap::new();
        params.insert("date".to_string(), "2024-01-01".to_string());
        params.insert("_region2".to_string(), "eu".to_string());
        assert!(validate_parameters(&params).is_ok());

        params.insert("2bad".to_string(), "x".to_string());
        assert_eq!(
            validate_parameters(&params),
            Err(ValidationError::InvalidParameterName("2bad".to_string()))
        );
    }

    #[test]
    fn test_parameter_names_reject_injection() {
        let mut params = HashMap::new();
        params.insert("x; DROP TABLE t".to_string(), "1".to_string());
        assert!(validate_parameters(&params).is_err());

        let mut params = HashMap::new();
        params.insert(String::new(), "1".to_string());
        assert!(validate_parameters(&params).is_err());
    }

    #[tokio::test]
    async fn test_drive_releases_tokens_on_every_path() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = store
            .create_pipeline(&Pipeline::new("tokens", "alice"))
            .await
            .unwrap();
        store
            .create_job(&Job::new(pipeline.id, "a", "nb-a"))
            .await
            .unwrap();
        let coordinator =
            RunCoordinator::new(store.clone(), Arc::new(NoopRunner), CoordinatorConfig::default());

        // Registered up front, the way `trigger` does, then cancelled before
        // the driver gets to it.
        let cancelled = coordinator
            .start_run(pipeline.id, TriggerType::Manual, "alice", HashMap::new())
            .await
            .unwrap();
        coordinator.token_for(cancelled.id).await;
        assert_eq!(coordinator.cancel_pending(pipeline.id).await.unwrap(), 1);
        let stored = coordinator.drive(cancelled.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Cancelled);
        assert!(coordinator.cancel_tokens.read().await.is_empty());

        let driven = coordinator
            .start_run(pipeline.id, TriggerType::Manual, "alice", HashMap::new())
            .await
            .unwrap();
        coordinator.token_for(driven.id).await;
        let finished = coordinator.drive(driven.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Success);
        assert!(coordinator.cancel_tokens.read().await.is_empty());

        // Driving a finished run again must not leave a token behind either.
        coordinator.token_for(driven.id).await;
        coordinator.drive(driven.id).await.unwrap();
        assert!(coordinator.cancel_tokens.read().await.is_empty());
    }
}
