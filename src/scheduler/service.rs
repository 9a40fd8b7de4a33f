//! Standalone query job scheduling.
//!
//! Jobs are submitted Queued, claimed by workers through a single
//! conditional update, executed with a heartbeat running alongside, and then
//! completed, retried with backoff or failed. Every worker write is fenced
//! on the claimed attempt, so a worker whose attempt was reaped or cancelled
//! cannot overwrite the job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::QueryEngine;
use crate::error::{ExecutionError, OrchestratorError, ValidationError};
use crate::metrics::MetricsCollector;
use crate::pipeline::config::{parse_env_value, ConfigError};
use crate::retry::{BackoffPolicy, StorageRetry};
use crate::storage::{Storage, StorageError, QUERY_CANCELLED};

use super::job::{CancelOutcome, HeartbeatAck, QueryJob, QueryJobStatus, DEFAULT_MAX_ATTEMPTS};

/// Configuration for the query job scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Attempts per job, including the first.
    pub max_attempts: u32,
    /// Delay before a Retrying job becomes claimable again.
    pub backoff: BackoffPolicy,
    /// How often a running attempt refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Running jobs silent for longer than this are reaped.
    pub liveness_timeout: Duration,
    /// Attempts for each status write.
    pub storage_retry_attempts: u32,
    /// Server-side limit applied to each query, if any.
    pub statement_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(30))
                .with_jitter(0.2),
            heartbeat_interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(30),
            storage_retry_attempts: 3,
            statement_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QUERY_JOB_MAX_ATTEMPTS`: Attempts per job (default: 3)
    /// - `QUERY_JOB_BACKOFF_BASE_MS`: First retry delay (default: 200)
    /// - `QUERY_JOB_BACKOFF_MAX_MS`: Retry delay cap (default: 30000)
    /// - `QUERY_JOB_HEARTBEAT_MS`: Heartbeat interval (default: 1000)
    /// - `QUERY_JOB_LIVENESS_TIMEOUT_SECS`: Heartbeat expiry (default: 30)
    /// - `QUERY_JOB_STATEMENT_TIMEOUT_SECS`: Per-query server limit (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("QUERY_JOB_MAX_ATTEMPTS") {
            config.max_attempts = parse_env_value(&val, "QUERY_JOB_MAX_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("QUERY_JOB_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "QUERY_JOB_BACKOFF_BASE_MS")?;
            config.backoff.base = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("QUERY_JOB_BACKOFF_MAX_MS") {
            let ms: u64 = parse_env_value(&val, "QUERY_JOB_BACKOFF_MAX_MS")?;
            config.backoff.max = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("QUERY_JOB_HEARTBEAT_MS") {
            let ms: u64 = parse_env_value(&val, "QUERY_JOB_HEARTBEAT_MS")?;
            config.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("QUERY_JOB_LIVENESS_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUERY_JOB_LIVENESS_TIMEOUT_SECS")?;
            config.liveness_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("QUERY_JOB_STATEMENT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "QUERY_JOB_STATEMENT_TIMEOUT_SECS")?;
            config.statement_timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be greater than 0".to_string(),
            ));
        }

        if self.liveness_timeout <= self.heartbeat_interval {
            return Err(ConfigError::ValidationFailed(
                "liveness_timeout must exceed heartbeat_interval".to_string(),
            ));
        }

        if self.storage_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "storage_retry_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

/// Submits, tracks and executes query jobs.
pub struct QueryJobScheduler {
    store: Arc<dyn Storage>,
    engine: Arc<dyn QueryEngine>,
    config: SchedulerConfig,
    storage_retry: StorageRetry,
    /// Tokens of attempts executing in this process, keyed by job id and
    /// attempt.
    running: RwLock<HashMap<(Uuid, u32), CancellationToken>>,
    metrics: MetricsCollector,
}

impl QueryJobScheduler {
    pub fn new(
        store: Arc<dyn Storage>,
        engine: Arc<dyn QueryEngine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            storage_retry: StorageRetry::new(config.storage_retry_attempts),
            store,
            engine,
            config,
            running: RwLock::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submits a query job, or returns the existing one when the principal
    /// already used `request_id`. A missing or blank request id is replaced
    /// by a generated one.
    pub async fn submit(
        &self,
        principal: &str,
        sql: &str,
        request_id: Option<&str>,
    ) -> Result<QueryJob, OrchestratorError> {
        if principal.trim().is_empty() {
            return Err(ValidationError::InvalidInput("principal is required".into()).into());
        }
        if sql.trim().is_empty() {
            return Err(ValidationError::InvalidInput("sql query is required".into()).into());
        }

        let request_id = match request_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        if let Some(existing) = self
            .store
            .find_query_job_by_request(principal, &request_id)
            .await?
        {
            debug!(job_id = %existing.id, request_id = %request_id, "Returning existing query job");
            return Ok(existing);
        }

        let job = QueryJob::new(principal, request_id.as_str(), sql)
            .with_max_attempts(self.config.max_attempts);
        match self.store.create_query_job(&job).await {
            Ok(created) => {
                info!(job_id = %created.id, principal = principal, "Query job submitted");
                Ok(created)
            }
            Err(StorageError::Conflict(_)) => {
                // Lost the insert race to a concurrent submit of the same request.
                self.store
                    .find_query_job_by_request(principal, &request_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::not_found("query job", &request_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a job owned by `principal`. Jobs of other principals are
    /// reported as not found.
    pub async fn get(&self, principal: &str, id: Uuid) -> Result<QueryJob, OrchestratorError> {
        let job = self.store.get_query_job(id).await?;
        if job.principal != principal {
            return Err(OrchestratorError::not_found("query job", id));
        }
        Ok(job)
    }

    /// Cancels a job. Queued and Retrying jobs are cancelled at once; a
    /// Running job is flagged and its worker stops at the next checkpoint.
    pub async fn cancel(
        &self,
        principal: &str,
        id: Uuid,
    ) -> Result<CancelOutcome, OrchestratorError> {
        self.get(principal, id).await?;
        let outcome = self.store.cancel_query_job(id, Utc::now()).await?;

        match outcome {
            CancelOutcome::Cancelled => {
                info!(job_id = %id, "Query job cancelled");
                self.metrics.record_query_job(QueryJobStatus::Cancelled.as_str(), 0.0);
            }
            CancelOutcome::Requested => {
                for (_, token) in self
                    .running
                    .read()
                    .await
                    .iter()
                    .filter(|((job_id, _), _)| *job_id == id)
                {
                    token.cancel();
                }
                info!(job_id = %id, "Cancellation requested for running query job");
            }
            CancelOutcome::AlreadyTerminal(status) => {
                debug!(job_id = %id, status = %status, "Query job already finished");
            }
        }
        Ok(outcome)
    }

    /// Cancels the job if needed, then removes it.
    pub async fn delete(&self, principal: &str, id: Uuid) -> Result<(), OrchestratorError> {
        self.cancel(principal, id).await?;
        self.store.delete_query_job(id).await?;
        info!(job_id = %id, "Query job deleted");
        Ok(())
    }

    /// Claims the oldest claimable job for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<QueryJob>, StorageError> {
        let now = Utc::now();
        self.storage_retry
            .run("claim_next_query_job", || {
                self.store.claim_next_query_job(worker_id, now)
            })
            .await
    }

    /// Claims and executes at most one job. Returns the status the job was
    /// left in, or `None` when nothing was claimable.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<QueryJobStatus>, StorageError> {
        match self.claim_next(worker_id).await? {
            Some(job) => self.execute_claimed(job, worker_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Executes a claimed attempt and records its outcome.
    pub async fn execute_claimed(
        &self,
        job: QueryJob,
        worker_id: &str,
    ) -> Result<QueryJobStatus, StorageError> {
        let id = job.id;
        let attempt = job.attempt_count;
        info!(
            job_id = %id,
            worker_id = worker_id,
            attempt = attempt,
            max_attempts = job.max_attempts,
            "Executing query job"
        );

        let token = CancellationToken::new();
        self.running.write().await.insert((id, attempt), token.clone());

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.store),
            id,
            attempt,
            self.config.heartbeat_interval,
            token.clone(),
            heartbeat_stop.clone(),
        ));

        let started = Instant::now();
        self.metrics.inc_jobs_in_progress();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ExecutionError::cancelled(QUERY_CANCELLED)),
            result = self.engine.execute(&job.principal, &job.sql_text, token.child_token()) => result,
        };
        self.metrics.dec_jobs_in_progress();
        let elapsed = started.elapsed().as_secs_f64();

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(job_id = %id, error = %e, "Heartbeat task ended abnormally");
        }
        self.running.write().await.remove(&(id, attempt));

        let now = Utc::now();
        let written = match result {
            Ok(rows) => self
                .storage_retry
                .run("complete_query_job", || {
                    self.store.complete_query_job(id, attempt, &rows, now)
                })
                .await?
                .then_some(QueryJobStatus::Succeeded),
            Err(err) if err.is_cancelled() => self
                .storage_retry
                .run("ack_query_job_cancel", || {
                    self.store.ack_query_job_cancel(id, attempt, now)
                })
                .await?
                .then_some(QueryJobStatus::Cancelled),
            Err(err) if err.is_retryable() && attempt < job.max_attempts => {
                let delay = self.config.backoff.delay(attempt);
                let next_retry_at =
                    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                warn!(
                    job_id = %id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Query job attempt failed, scheduling retry"
                );
                self.storage_retry
                    .run("retry_query_job", || {
                        self.store
                            .retry_query_job(id, attempt, next_retry_at, &err.message, now)
                    })
                    .await?
            }
            Err(err) => {
                warn!(
                    job_id = %id,
                    attempt = attempt,
                    kind = %err.kind,
                    error = %err,
                    "Query job failed"
                );
                self.storage_retry
                    .run("fail_query_job", || {
                        self.store.fail_query_job(id, attempt, &err.message, now)
                    })
                    .await?
            }
        };

        let Some(target) = written else {
            let current = self.store.get_query_job(id).await?;
            warn!(
                job_id = %id,
                attempt = attempt,
                status = %current.status,
                "Lost ownership of query job, discarding outcome"
            );
            return Ok(current.status);
        };

        self.metrics.record_query_job(target.as_str(), elapsed);
        info!(job_id = %id, status = %target, "Query job attempt finished");
        Ok(target)
    }

    /// Requeues or fails Running jobs whose heartbeat has expired.
    pub async fn reap_stale(&self) -> Result<u64, StorageError> {
        let now = Utc::now();
        let liveness = chrono::Duration::from_std(self.config.liveness_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let reaped = self
            .store
            .reap_stale_query_jobs(now - liveness, now)
            .await?;
        if reaped > 0 {
            warn!(count = reaped, "Reaped query jobs with expired heartbeats");
            self.metrics.record_reaped(reaped);
        }
        Ok(reaped)
    }
}

/// Refreshes the heartbeat of one attempt until `stop` fires. Cancels
/// `token` when ownership is lost or a cancel was requested.
async fn heartbeat_loop(
    store: Arc<dyn Storage>,
    id: Uuid,
    attempt: u32,
    interval: Duration,
    token: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The claim already recorded a heartbeat.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store.heartbeat_query_job(id, attempt, Utc::now()).await {
            Ok(HeartbeatAck::Alive { cancel_requested: false }) => {}
            Ok(HeartbeatAck::Alive { cancel_requested: true }) => {
                debug!(job_id = %id, "Cancel flag observed by heartbeat");
                token.cancel();
            }
            Ok(HeartbeatAck::Lost) => {
                warn!(job_id = %id, attempt = attempt, "Heartbeat rejected, attempt no longer owned");
                token.cancel();
                return;
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Heartbeat write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::scheduler::QueryResult;
    use crate::storage::{MemoryStore, QueryJobStore};

    /// Runs until its token is cancelled.
    #[derive(Default)]
    struct UntilCancelled {
        started: Notify,
    }

    #[async_trait]
    impl QueryEngine for UntilCancelled {
        async fn execute(
            &self,
            _principal: &str,
            _sql: &str,
            cancel: CancellationToken,
        ) -> Result<QueryResult, ExecutionError> {
            self.started.notify_one();
            cancel.cancelled().await;
            Err(ExecutionError::cancelled("query canceled"))
        }
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff.base, Duration::from_millis(200));
        assert_eq!(config.backoff.max, Duration::from_secs(30));
        assert!((config.backoff.jitter - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.liveness_timeout, Duration::from_secs(30));
        assert!(config.statement_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_liveness_must_exceed_heartbeat() {
        let config = SchedulerConfig::default()
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_liveness_timeout(Duration::from_secs(5));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("liveness_timeout"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let config = SchedulerConfig::default().with_max_attempts(0);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_unwinding_attempt_keeps_successor_token() {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(UntilCancelled::default());
        let config = SchedulerConfig::default()
            .with_heartbeat_interval(Duration::from_secs(3600))
            .with_liveness_timeout(Duration::from_secs(7200));
        let scheduler = Arc::new(QueryJobScheduler::new(store.clone(), engine.clone(), config));
        let job = scheduler.submit("alice", "SELECT 1", None).await.unwrap();

        let first = scheduler.claim_next("w1").await.unwrap().unwrap();
        let first_attempt = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.execute_claimed(first, "w1").await })
        };
        engine.started.notified().await;

        // The first attempt is reaped and reclaimed while still executing.
        let now = Utc::now();
        let reaped = store
            .reap_stale_query_jobs(now + chrono::Duration::hours(3), now)
            .await
            .unwrap();
        assert_eq!(reaped, 1);
        let second = scheduler.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(second.attempt_count, 2);
        let second_attempt = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.execute_claimed(second, "w2").await })
        };
        engine.started.notified().await;

        scheduler
            .running
            .read()
            .await
            .get(&(job.id, 1))
            .unwrap()
            .cancel();
        let status = first_attempt.await.unwrap().unwrap();
        assert_eq!(status, QueryJobStatus::Running);
        assert!(scheduler.running.read().await.contains_key(&(job.id, 2)));

        assert_eq!(
            scheduler.cancel("alice", job.id).await.unwrap(),
            CancelOutcome::Requested
        );
        let status = tokio::time::timeout(Duration::from_secs(5), second_attempt)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, QueryJobStatus::Cancelled);
        assert!(scheduler.running.read().await.is_empty());
    }
}
