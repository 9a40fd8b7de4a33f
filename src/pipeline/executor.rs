//! Execution of a single job-run with the job's retry policy.
//!
//! A job-run row is reused across attempts: each retry raises
//! `retry_attempt` on the same row (Running → Pending) and the next attempt
//! claims it again (Pending → Running). Transient and timeout failures are
//! retried in process with exponential backoff; terminal failures and
//! exhausted retries mark the row Failed with the causing message.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{NotebookRunner, RunContext};
use crate::error::ExecutionError;
use crate::metrics::MetricsCollector;
use crate::retry::{BackoffPolicy, StorageRetry};
use crate::storage::{Storage, StorageError};

use super::config::CoordinatorConfig;
use super::types::{Job, JobRun, JobRunStatus};

/// Error recorded on job-runs interrupted by a run cancellation.
pub const JOB_CANCELLED: &str = "run was cancelled";

/// Final state of a job-run as seen by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobRunStatus,
    pub error: Option<String>,
}

impl JobOutcome {
    fn of(job_run: &JobRun) -> Self {
        Self {
            status: job_run.status,
            error: job_run.error_message.clone(),
        }
    }
}

/// Runs one job-run to a terminal status.
pub struct JobExecutor {
    store: Arc<dyn Storage>,
    runner: Arc<dyn NotebookRunner>,
    backoff: BackoffPolicy,
    default_timeout: Duration,
    storage_retry: StorageRetry,
    metrics: MetricsCollector,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn Storage>,
        runner: Arc<dyn NotebookRunner>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            runner,
            backoff: config.job_backoff.clone(),
            default_timeout: config.default_job_timeout,
            storage_retry: config.storage_retry(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Executes `job_run` until it reaches a terminal status.
    ///
    /// Job-runs that are already terminal (for example Skipped) are returned
    /// unchanged. Execution failures are recorded on the row, never returned;
    /// an `Err` means a status write could not be persisted.
    pub async fn execute(
        &self,
        job_run: &JobRun,
        job: &Job,
        context: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, StorageError> {
        let id = job_run.id;
        let current = self
            .storage_retry
            .run("get_job_run", || self.store.get_job_run(id))
            .await?;
        if current.status.is_terminal() {
            return Ok(JobOutcome::of(&current));
        }

        let max_attempts = job.max_attempts();
        let timeout = job.timeout.unwrap_or(self.default_timeout);
        let mut attempt = current.retry_attempt;

        loop {
            if cancel.is_cancelled() {
                return self.finish(id, JobRunStatus::Cancelled, Some(JOB_CANCELLED)).await;
            }

            let now = Utc::now();
            let started = self
                .storage_retry
                .run("mark_job_run_started", || {
                    self.store.mark_job_run_started(id, now)
                })
                .await?;
            if !started {
                let row = self.store.get_job_run(id).await?;
                if row.status.is_terminal() {
                    return Ok(JobOutcome::of(&row));
                }
            }

            info!(
                run_id = %context.run_id,
                job_name = %job.name,
                attempt = attempt + 1,
                max_attempts = max_attempts,
                "Starting job attempt"
            );

            self.metrics.inc_jobs_in_progress();
            let result = self.attempt(job, context, attempt, timeout, cancel).await;
            self.metrics.dec_jobs_in_progress();

            let err = match result {
                Ok(()) => return self.finish(id, JobRunStatus::Success, None).await,
                Err(err) => err,
            };

            if err.is_cancelled() {
                return self
                    .finish(id, JobRunStatus::Cancelled, Some(JOB_CANCELLED))
                    .await;
            }

            if !err.is_retryable() || attempt + 1 >= max_attempts {
                warn!(
                    run_id = %context.run_id,
                    job_name = %job.name,
                    attempt = attempt + 1,
                    kind = %err.kind,
                    error = %err,
                    "Job failed"
                );
                return self
                    .finish(id, JobRunStatus::Failed, Some(&err.message))
                    .await;
            }

            let next = attempt + 1;
            let delay = self.backoff.delay(next);
            warn!(
                run_id = %context.run_id,
                job_name = %job.name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Job attempt failed, retrying"
            );

            let requeued = self
                .storage_retry
                .run("mark_job_run_retrying", || {
                    self.store.mark_job_run_retrying(id, next)
                })
                .await?;
            if !requeued {
                let row = self.store.get_job_run(id).await?;
                if row.status.is_terminal() {
                    return Ok(JobOutcome::of(&row));
                }
            }
            self.metrics.record_job_retry();

            tokio::select! {
                _ = cancel.cancelled() => {
                    return self
                        .finish(id, JobRunStatus::Cancelled, Some(JOB_CANCELLED))
                        .await;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = next;
        }
    }

    async fn attempt(
        &self,
        job: &Job,
        context: &RunContext,
        attempt: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let run = self
            .runner
            .run_notebook(job, context, attempt, cancel.child_token());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::cancelled(JOB_CANCELLED)),
            result = tokio::time::timeout(timeout, run) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ExecutionError::timeout(format!(
                    "job '{}' timed out after {}s",
                    job.name,
                    timeout.as_secs()
                ))),
            },
        }
    }

    async fn finish(
        &self,
        id: uuid::Uuid,
        status: JobRunStatus,
        error: Option<&str>,
    ) -> Result<JobOutcome, StorageError> {
        let now = Utc::now();
        let written = self
            .storage_retry
            .run("finish_job_run", || {
                self.store.finish_job_run(id, status, error, now)
            })
            .await?;

        if !written {
            let row = self.store.get_job_run(id).await?;
            debug!(job_run_id = %id, status = %row.status, "Job-run already finalized");
            return Ok(JobOutcome::of(&row));
        }

        self.metrics.record_job_run(status.as_str());
        Ok(JobOutcome {
            status,
            error: error.map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::types::{Pipeline, PipelineRun, TriggerType};
    use crate::storage::{MemoryStore, PipelineStore, RunStore};

    /// Notebook runner that replays a fixed list of outcomes.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<(), ExecutionError>>>,
        calls: Mutex<Vec<u32>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<(), ExecutionError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotebookRunner for Scripted {
        async fn run_notebook(
            &self,
            _job: &Job,
            _context: &RunContext,
            attempt: u32,
            _cancel: CancellationToken,
        ) -> Result<(), ExecutionError> {
            self.calls.lock().unwrap().push(attempt);
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_job_backoff(BackoffPolicy::new(
                Duration::from_millis(1),
                Duration::from_millis(5),
            ))
    }

    async fn setup(job: impl FnOnce(uuid::Uuid) -> Job) -> (Arc<MemoryStore>, Job, JobRun, RunContext) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = store
            .create_pipeline(&Pipeline::new("etl", "alice"))
            .await
            .unwrap();
        let job = store.create_job(&job(pipeline.id)).await.unwrap();
        let run = store
            .create_run(
                &PipelineRun::new(pipeline.id, TriggerType::Manual, "alice", HashMap::new()),
                None,
            )
            .await
            .unwrap();
        let job_run = store.create_job_run(&JobRun::new(run.id, &job)).await.unwrap();
        let context = RunContext {
            run_id: run.id,
            pipeline_id: pipeline.id,
            principal: "alice".into(),
            parameters: HashMap::new(),
        };
        (store, job, job_run, context)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let (store, job, job_run, ctx) = setup(|p| Job::new(p, "load", "nb-1")).await;
        let runner = Scripted::new(vec![Ok(())]);
        let executor = JobExecutor::new(store.clone(), runner.clone(), &fast_config());

        let outcome = executor
            .execute(&job_run, &job, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, JobRunStatus::Success);
        let row = store.get_job_run(job_run.id).await.unwrap();
        assert_eq!(row.status, JobRunStatus::Success);
        assert_eq!(row.retry_attempt, 0);
        assert!(row.started_at.is_some());
        assert!(row.finished_at.is_some());
        assert_eq!(runner.calls(), vec![0]);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_on_same_row() {
        let (store, job, job_run, ctx) =
            setup(|p| Job::new(p, "load", "nb-1").with_retry_count(2)).await;
        let runner = Scripted::new(vec![
            Err(ExecutionError::transient("connection reset")),
            Err(ExecutionError::transient("connection reset")),
            Ok(()),
        ]);
        let executor = JobExecutor::new(store.clone(), runner.clone(), &fast_config());

        let outcome = executor
            .execute(&job_run, &job, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, JobRunStatus::Success);
        assert_eq!(runner.calls(), vec![0, 1, 2]);
        let row = store.get_job_run(job_run.id).await.unwrap();
        assert_eq!(row.retry_attempt, 2);
        assert_eq!(store.list_job_runs(ctx.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let (store, job, job_run, ctx) =
            setup(|p| Job::new(p, "load", "nb-1").with_retry_count(5)).await;
        let runner = Scripted::new(vec![Err(ExecutionError::terminal("syntax error at or near \"SELEC\""))]);
        let executor = JobExecutor::new(store.clone(), runner.clone(), &fast_config());

        let outcome = executor
            .execute(&job_run, &job, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, JobRunStatus::Failed);
        assert_eq!(runner.calls().len(), 1);
        let row = store.get_job_run(job_run.id).await.unwrap();
        assert!(row.error_message.unwrap().contains("syntax error"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_last_error() {
        let (store, job, job_run, ctx) =
            setup(|p| Job::new(p, "load", "nb-1").with_retry_count(1)).await;
        let runner = Scripted::new(vec![
            Err(ExecutionError::transient("first")),
            Err(ExecutionError::transient("second")),
        ]);
        let executor = JobExecutor::new(store.clone(), runner.clone(), &fast_config());

        let outcome = executor
            .execute(&job_run, &job, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, JobRunStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("second"));
        assert_eq!(store.get_job_run(job_run.id).await.unwrap().retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_terminal_job_run_is_returned_unchanged() {
        let (store, job, job_run, ctx) = setup(|p| Job::new(p, "load", "nb-1")).await;
        store
            .finish_job_run(job_run.id, JobRunStatus::Skipped, None, Utc::now())
            .await
            .unwrap();
        let runner = Scripted::new(vec![]);
        let executor = JobExecutor::new(store.clone(), runner.clone(), &fast_config());

        let outcome = executor
            .execute(&job_run, &job, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, JobRunStatus::Skipped);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_running() {
        let (store, job, job_run, ctx) = setup(|p| Job::new(p, "load", "nb-1")).await;
        let runner = Scripted::new(vec![]);
        let executor = JobExecutor::new(store.clone(), runner.clone(), &fast_config());
        let token = CancellationToken::new();
        token.cancel();

        let outcome = executor.execute(&job_run, &job, &ctx, &token).await.unwrap();

        assert_eq!(outcome.status, JobRunStatus::Cancelled);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        struct Slow;

        #[async_trait]
        impl NotebookRunner for Slow {
            async fn run_notebook(
                &self,
                _job: &Job,
                _context: &RunContext,
                _attempt: u32,
                _cancel: CancellationToken,
            ) -> Result<(), ExecutionError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }

        let (store, job, job_run, ctx) = setup(|p| {
            Job::new(p, "load", "nb-1")
                .with_retry_count(1)
                .with_timeout(Duration::from_millis(10))
        })
        .await;
        let executor = JobExecutor::new(store.clone(), Arc::new(Slow), &fast_config());

        let outcome = executor
            .execute(&job_run, &job, &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, JobRunStatus::Failed);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert_eq!(store.get_job_run(job_run.id).await.unwrap().retry_attempt, 1);
    }
}
