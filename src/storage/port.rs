//! Storage port consumed by the orchestration core.
//!
//! Every status transition is expressed as a conditional update that names
//! the statuses it is allowed to leave from and reports whether it applied.
//! Callers never read a status and then write an unconditional update;
//! losing a race shows up as `Ok(false)` / `Ok(None)`, not as an error.
//! Partial read-modify-write updates are reserved for pipeline metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::{
    Job, JobRun, JobRunStatus, Pipeline, PipelineRun, RunFilter, RunStatus, UnknownStatus,
};
use crate::scheduler::{CancelOutcome, HeartbeatAck, QueryJob, QueryJobStatus, QueryResult};

use super::migrations::MigrationError;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Record not found.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The per-pipeline active run cap is reached.
    #[error("Concurrency limit reached: {active} active runs (limit {limit})")]
    ConcurrencyLimit { active: u64, limit: u32 },

    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A persisted row holds a value this build cannot interpret.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) => true,
            Self::QueryFailed(err) => is_transient_sqlx(err),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("23505") {
                return Self::Conflict(db.message().to_string());
            }
        }
        Self::QueryFailed(err)
    }
}

impl From<UnknownStatus> for StorageError {
    fn from(err: UnknownStatus) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Pool exhaustion, I/O, serialization failures and deadlocks are retryable.
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") | Some("55P03") => true,
            Some(code) => code.starts_with("08") || code.starts_with("57P"),
            None => false,
        },
        _ => false,
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Pipeline and job definitions.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Inserts a pipeline. Duplicate names yield `Conflict`.
    async fn create_pipeline(&self, pipeline: &Pipeline) -> StorageResult<Pipeline>;

    async fn get_pipeline(&self, id: Uuid) -> StorageResult<Pipeline>;

    async fn get_pipeline_by_name(&self, name: &str) -> StorageResult<Pipeline>;

    async fn list_pipelines(&self) -> StorageResult<Vec<Pipeline>>;

    /// Rewrites description, concurrency limit, paused flag and schedule.
    async fn update_pipeline(&self, pipeline: &Pipeline) -> StorageResult<Pipeline>;

    /// Deletes a pipeline together with its jobs, runs and job-runs.
    async fn delete_pipeline(&self, id: Uuid) -> StorageResult<()>;

    /// Inserts a job. Duplicate names within the pipeline yield `Conflict`.
    async fn create_job(&self, job: &Job) -> StorageResult<Job>;

    async fn get_job(&self, id: Uuid) -> StorageResult<Job>;

    /// Lists the jobs of a pipeline ordered by `job_order`, then name.
    async fn list_jobs(&self, pipeline_id: Uuid) -> StorageResult<Vec<Job>>;

    async fn delete_job(&self, id: Uuid) -> StorageResult<()>;
}

/// Pipeline runs and job-runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a Pending run. When `cap` is set, counting the pipeline's
    /// active runs and inserting happen in one transaction, and the insert is
    /// refused with `ConcurrencyLimit` once `cap` active runs exist.
    async fn create_run(&self, run: &PipelineRun, cap: Option<u32>) -> StorageResult<PipelineRun>;

    async fn get_run(&self, id: Uuid) -> StorageResult<PipelineRun>;

    /// Lists runs newest first.
    async fn list_runs(&self, filter: &RunFilter) -> StorageResult<Vec<PipelineRun>>;

    /// Pending → Running, setting `started_at`. Returns false if the run was
    /// not Pending.
    async fn mark_run_started(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool>;

    /// Pending|Running → `status` (terminal). Returns false if the run was
    /// already terminal, in which case nothing is written.
    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Sets the cooperative cancel flag on a Running run.
    async fn request_run_cancel(&self, id: Uuid) -> StorageResult<bool>;

    /// Counts runs in {Pending, Running}.
    async fn count_active_runs(&self, pipeline_id: Uuid) -> StorageResult<u64>;

    /// Cancels every Pending run of the pipeline in one statement.
    async fn cancel_pending_runs(
        &self,
        pipeline_id: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<u64>;

    /// Pending → Cancelled for a single run. Returns false if the run was
    /// no longer Pending.
    async fn cancel_pending_run(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool>;

    async fn create_job_run(&self, job_run: &JobRun) -> StorageResult<JobRun>;

    async fn get_job_run(&self, id: Uuid) -> StorageResult<JobRun>;

    /// Lists the job-runs of a run in creation order.
    async fn list_job_runs(&self, run_id: Uuid) -> StorageResult<Vec<JobRun>>;

    /// Pending → Running. `started_at` keeps the first attempt's time.
    async fn mark_job_run_started(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool>;

    /// Running → Pending with `retry_attempt` raised to `attempt`. Refused
    /// unless `attempt` is greater than the stored value.
    async fn mark_job_run_retrying(&self, id: Uuid, attempt: u32) -> StorageResult<bool>;

    /// Pending|Running → `status` (terminal). Returns false if already
    /// terminal.
    async fn finish_job_run(
        &self,
        id: Uuid,
        status: JobRunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;
}

/// Standalone query jobs.
#[async_trait]
pub trait QueryJobStore: Send + Sync {
    /// Inserts a Queued job. A duplicate (principal, request id) yields
    /// `Conflict`.
    async fn create_query_job(&self, job: &QueryJob) -> StorageResult<QueryJob>;

    async fn get_query_job(&self, id: Uuid) -> StorageResult<QueryJob>;

    async fn find_query_job_by_request(
        &self,
        principal: &str,
        request_id: &str,
    ) -> StorageResult<Option<QueryJob>>;

    /// Atomically moves the oldest claimable job to Running, assigning it to
    /// `worker_id` and incrementing `attempt_count`. At most one caller
    /// receives any given attempt.
    async fn claim_next_query_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<QueryJob>>;

    /// Refreshes `last_heartbeat_at` if the job is still Running at
    /// `attempt`.
    async fn heartbeat_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> StorageResult<HeartbeatAck>;

    /// Running@attempt → Succeeded with the result set.
    async fn complete_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        result: &QueryResult,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Running@attempt → Retrying with `next_retry_at`, or Cancelled when a
    /// cancel was requested during the attempt. Returns the status written,
    /// `None` if the attempt no longer owns the job.
    async fn retry_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<QueryJobStatus>>;

    /// Running@attempt → Failed, or Cancelled when a cancel was requested
    /// during the attempt. Same return as `retry_query_job`.
    async fn fail_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<QueryJobStatus>>;

    /// Queued|Retrying → Cancelled, Running → cancel flag set, terminal →
    /// unchanged. One atomic step.
    async fn cancel_query_job(&self, id: Uuid, now: DateTime<Utc>)
        -> StorageResult<CancelOutcome>;

    /// Running@attempt → Cancelled, acknowledging a cooperative cancel.
    async fn ack_query_job_cancel(
        &self,
        id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Running jobs whose last heartbeat is older than `stale_before` become
    /// Retrying (eligible at `now`), Failed if no attempts remain, or
    /// Cancelled if a cancel was pending. Returns the number of jobs moved.
    async fn reap_stale_query_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<u64>;

    async fn delete_query_job(&self, id: Uuid) -> StorageResult<()>;
}

/// A backend implementing every storage concern.
pub trait Storage: PipelineStore + RunStore + QueryJobStore {}

impl<T: PipelineStore + RunStore + QueryJobStore> Storage for T {}
