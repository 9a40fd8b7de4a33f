//! In-memory storage backend.
//!
//! All state sits behind a single async mutex, so every trait method is one
//! atomic step and the conditional-update contract holds trivially. Useful
//! for embedding and for tests; nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::pipeline::{Job, JobRun, JobRunStatus, Pipeline, PipelineRun, RunFilter, RunStatus};
use crate::scheduler::{CancelOutcome, HeartbeatAck, QueryJob, QueryJobStatus, QueryResult};

use super::port::{PipelineStore, QueryJobStore, RunStore, StorageError, StorageResult};

#[derive(Debug, Default)]
struct State {
    pipelines: Vec<Pipeline>,
    jobs: Vec<Job>,
    runs: Vec<PipelineRun>,
    job_runs: Vec<JobRun>,
    query_jobs: Vec<QueryJob>,
}

impl State {
    fn run_mut(&mut self, id: Uuid) -> StorageResult<&mut PipelineRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::not_found("pipeline run", id))
    }

    fn job_run_mut(&mut self, id: Uuid) -> StorageResult<&mut JobRun> {
        self.job_runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::not_found("job run", id))
    }

    fn query_job_mut(&mut self, id: Uuid) -> StorageResult<&mut QueryJob> {
        self.query_jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| StorageError::not_found("query job", id))
    }

    /// The job if it is Running at `attempt`.
    fn owned_query_job(&mut self, id: Uuid, attempt: u32) -> StorageResult<Option<&mut QueryJob>> {
        let job = self.query_job_mut(id)?;
        if job.status == QueryJobStatus::Running && job.attempt_count == attempt {
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    fn active_runs(&self, pipeline_id: Uuid) -> u64 {
        self.runs
            .iter()
            .filter(|r| r.pipeline_id == pipeline_id && r.status.is_active())
            .count() as u64
    }
}

fn mark_cancelled(job: &mut QueryJob, now: DateTime<Utc>) {
    job.status = QueryJobStatus::Cancelled;
    job.error_message = Some(super::QUERY_CANCELLED.to_string());
    job.next_retry_at = None;
    job.completed_at = Some(now);
}

/// Storage backend holding everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn create_pipeline(&self, pipeline: &Pipeline) -> StorageResult<Pipeline> {
        let mut state = self.state.lock().await;
        if state.pipelines.iter().any(|p| p.name == pipeline.name) {
            return Err(StorageError::Conflict(format!(
                "pipeline '{}' already exists",
                pipeline.name
            )));
        }
        state.pipelines.push(pipeline.clone());
        Ok(pipeline.clone())
    }

    async fn get_pipeline(&self, id: Uuid) -> StorageResult<Pipeline> {
        let state = self.state.lock().await;
        state
            .pipelines
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("pipeline", id))
    }

    async fn get_pipeline_by_name(&self, name: &str) -> StorageResult<Pipeline> {
        let state = self.state.lock().await;
        state
            .pipelines
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| StorageError::not_found("pipeline", name))
    }

    async fn list_pipelines(&self) -> StorageResult<Vec<Pipeline>> {
        let state = self.state.lock().await;
        let mut pipelines = state.pipelines.clone();
        pipelines.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pipelines)
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> StorageResult<Pipeline> {
        let mut state = self.state.lock().await;
        let stored = state
            .pipelines
            .iter_mut()
            .find(|p| p.id == pipeline.id)
            .ok_or_else(|| StorageError::not_found("pipeline", pipeline.id))?;
        stored.description = pipeline.description.clone();
        stored.concurrency_limit = pipeline.concurrency_limit;
        stored.is_paused = pipeline.is_paused;
        stored.schedule_cron = pipeline.schedule_cron.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn delete_pipeline(&self, id: Uuid) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let before = state.pipelines.len();
        state.pipelines.retain(|p| p.id != id);
        if state.pipelines.len() == before {
            return Err(StorageError::not_found("pipeline", id));
        }
        state.jobs.retain(|j| j.pipeline_id != id);
        let run_ids: Vec<Uuid> = state
            .runs
            .iter()
            .filter(|r| r.pipeline_id == id)
            .map(|r| r.id)
            .collect();
        state.runs.retain(|r| r.pipeline_id != id);
        state.job_runs.retain(|jr| !run_ids.contains(&jr.run_id));
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> StorageResult<Job> {
        let mut state = self.state.lock().await;
        if !state.pipelines.iter().any(|p| p.id == job.pipeline_id) {
            return Err(StorageError::not_found("pipeline", job.pipeline_id));
        }
        if state
            .jobs
            .iter()
            .any(|j| j.pipeline_id == job.pipeline_id && j.name == job.name)
        {
            return Err(StorageError::Conflict(format!(
                "job '{}' already exists in pipeline",
                job.name
            )));
        }
        state.jobs.push(job.clone());
        Ok(job.clone())
    }

    async fn get_job(&self, id: Uuid) -> StorageResult<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("job", id))
    }

    async fn list_jobs(&self, pipeline_id: Uuid) -> StorageResult<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .iter()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.job_order.cmp(&b.job_order).then_with(|| a.name.cmp(&b.name)));
        Ok(jobs)
    }

    async fn delete_job(&self, id: Uuid) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != id);
        if state.jobs.len() == before {
            return Err(StorageError::not_found("job", id));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: &PipelineRun, cap: Option<u32>) -> StorageResult<PipelineRun> {
        let mut state = self.state.lock().await;
        if !state.pipelines.iter().any(|p| p.id == run.pipeline_id) {
            return Err(StorageError::not_found("pipeline", run.pipeline_id));
        }
        if let Some(limit) = cap {
            let active = state.active_runs(run.pipeline_id);
            if active >= u64::from(limit) {
                return Err(StorageError::ConcurrencyLimit { active, limit });
            }
        }
        state.runs.push(run.clone());
        Ok(run.clone())
    }

    async fn get_run(&self, id: Uuid) -> StorageResult<PipelineRun> {
        let mut state = self.state.lock().await;
        state.run_mut(id).map(|r| r.clone())
    }

    async fn list_runs(&self, filter: &RunFilter) -> StorageResult<Vec<PipelineRun>> {
        let state = self.state.lock().await;
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_run_started(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(id)?;
        if run.status != RunStatus::Pending {
            return Ok(false);
        }
        run.status = RunStatus::Running;
        run.started_at.get_or_insert(now);
        Ok(true)
    }

    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(id)?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = status;
        run.error_message = error.map(str::to_string);
        run.finished_at = Some(now);
        Ok(true)
    }

    async fn request_run_cancel(&self, id: Uuid) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(id)?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.cancel_requested = true;
        Ok(true)
    }

    async fn count_active_runs(&self, pipeline_id: Uuid) -> StorageResult<u64> {
        let state = self.state.lock().await;
        Ok(state.active_runs(pipeline_id))
    }

    async fn cancel_pending_runs(
        &self,
        pipeline_id: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        let mut cancelled = 0;
        for run in state
            .runs
            .iter_mut()
            .filter(|r| r.pipeline_id == pipeline_id && r.status == RunStatus::Pending)
        {
            run.status = RunStatus::Cancelled;
            run.error_message = Some(super::CANCELLED_WHILE_PENDING.to_string());
            run.finished_at = Some(now);
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn cancel_pending_run(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let run = state.run_mut(id)?;
        if run.status != RunStatus::Pending {
            return Ok(false);
        }
        run.status = RunStatus::Cancelled;
        run.error_message = Some(super::CANCELLED_WHILE_PENDING.to_string());
        run.finished_at = Some(now);
        Ok(true)
    }

    async fn create_job_run(&self, job_run: &JobRun) -> StorageResult<JobRun> {
        let mut state = self.state.lock().await;
        if !state.runs.iter().any(|r| r.id == job_run.run_id) {
            return Err(StorageError::not_found("pipeline run", job_run.run_id));
        }
        state.job_runs.push(job_run.clone());
        Ok(job_run.clone())
    }

    async fn get_job_run(&self, id: Uuid) -> StorageResult<JobRun> {
        let mut state = self.state.lock().await;
        state.job_run_mut(id).map(|jr| jr.clone())
    }

    async fn list_job_runs(&self, run_id: Uuid) -> StorageResult<Vec<JobRun>> {
        let state = self.state.lock().await;
        Ok(state
            .job_runs
            .iter()
            .filter(|jr| jr.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn mark_job_run_started(&self, id: Uuid, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let job_run = state.job_run_mut(id)?;
        if job_run.status != JobRunStatus::Pending {
            return Ok(false);
        }
        job_run.status = JobRunStatus::Running;
        job_run.started_at.get_or_insert(now);
        Ok(true)
    }

    async fn mark_job_run_retrying(&self, id: Uuid, attempt: u32) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let job_run = state.job_run_mut(id)?;
        if job_run.status != JobRunStatus::Running || job_run.retry_attempt >= attempt {
            return Ok(false);
        }
        job_run.status = JobRunStatus::Pending;
        job_run.retry_attempt = attempt;
        Ok(true)
    }

    async fn finish_job_run(
        &self,
        id: Uuid,
        status: JobRunStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let job_run = state.job_run_mut(id)?;
        if job_run.status.is_terminal() {
            return Ok(false);
        }
        job_run.status = status;
        job_run.error_message = error.map(str::to_string);
        job_run.finished_at = Some(now);
        Ok(true)
    }
}

#[async_trait]
impl QueryJobStore for MemoryStore {
    async fn create_query_job(&self, job: &QueryJob) -> StorageResult<QueryJob> {
        let mut state = self.state.lock().await;
        if state
            .query_jobs
            .iter()
            .any(|j| j.principal == job.principal && j.request_id == job.request_id)
        {
            return Err(StorageError::Conflict(format!(
                "request '{}' already submitted",
                job.request_id
            )));
        }
        state.query_jobs.push(job.clone());
        Ok(job.clone())
    }

    async fn get_query_job(&self, id: Uuid) -> StorageResult<QueryJob> {
        let mut state = self.state.lock().await;
        state.query_job_mut(id).map(|j| j.clone())
    }

    async fn find_query_job_by_request(
        &self,
        principal: &str,
        request_id: &str,
    ) -> StorageResult<Option<QueryJob>> {
        let state = self.state.lock().await;
        Ok(state
            .query_jobs
            .iter()
            .find(|j| j.principal == principal && j.request_id == request_id)
            .cloned())
    }

    async fn claim_next_query_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<QueryJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state
            .query_jobs
            .iter_mut()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| j.created_at)
        else {
            return Ok(None);
        };
        job.status = QueryJobStatus::Running;
        job.attempt_count += 1;
        job.worker_id = Some(worker_id.to_string());
        job.last_heartbeat_at = Some(now);
        job.next_retry_at = None;
        job.started_at.get_or_insert(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> StorageResult<HeartbeatAck> {
        let mut state = self.state.lock().await;
        match state.owned_query_job(id, attempt)? {
            Some(job) => {
                job.last_heartbeat_at = Some(now);
                job.updated_at = now;
                Ok(HeartbeatAck::Alive {
                    cancel_requested: job.cancel_requested,
                })
            }
            None => Ok(HeartbeatAck::Lost),
        }
    }

    async fn complete_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        result: &QueryResult,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.owned_query_job(id, attempt)? else {
            return Ok(false);
        };
        job.status = QueryJobStatus::Succeeded;
        job.result = Some(result.clone());
        job.error_message = None;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn retry_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<QueryJobStatus>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.owned_query_job(id, attempt)? else {
            return Ok(None);
        };
        if job.cancel_requested {
            mark_cancelled(job, now);
        } else {
            job.status = QueryJobStatus::Retrying;
            job.next_retry_at = Some(next_retry_at);
            job.error_message = Some(error.to_string());
        }
        job.worker_id = None;
        job.updated_at = now;
        Ok(Some(job.status))
    }

    async fn fail_query_job(
        &self,
        id: Uuid,
        attempt: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<QueryJobStatus>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.owned_query_job(id, attempt)? else {
            return Ok(None);
        };
        if job.cancel_requested {
            mark_cancelled(job, now);
        } else {
            job.status = QueryJobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.completed_at = Some(now);
        }
        job.updated_at = now;
        Ok(Some(job.status))
    }

    async fn cancel_query_job(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<CancelOutcome> {
        let mut state = self.state.lock().await;
        let job = state.query_job_mut(id)?;
        let outcome = match job.status {
            QueryJobStatus::Queued | QueryJobStatus::Retrying => {
                job.status = QueryJobStatus::Cancelled;
                job.error_message = Some(super::QUERY_CANCELLED.to_string());
                job.completed_at = Some(now);
                CancelOutcome::Cancelled
            }
            QueryJobStatus::Running => {
                job.cancel_requested = true;
                CancelOutcome::Requested
            }
            terminal => return Ok(CancelOutcome::AlreadyTerminal(terminal)),
        };
        job.updated_at = now;
        Ok(outcome)
    }

    async fn ack_query_job_cancel(
        &self,
        id: Uuid,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let Some(job) = state.owned_query_job(id, attempt)? else {
            return Ok(false);
        };
        mark_cancelled(job, now);
        job.updated_at = now;
        Ok(true)
    }

    async fn reap_stale_query_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        let mut reaped = 0;
        for job in state.query_jobs.iter_mut().filter(|j| {
            j.status == QueryJobStatus::Running
                && j.last_heartbeat_at.map_or(true, |hb| hb < stale_before)
        }) {
            if job.cancel_requested {
                mark_cancelled(job, now);
            } else if job.should_retry() {
                job.status = QueryJobStatus::Retrying;
                job.next_retry_at = Some(now);
                job.error_message = Some(super::HEARTBEAT_EXPIRED.to_string());
            } else {
                job.status = QueryJobStatus::Failed;
                job.error_message = Some(super::HEARTBEAT_EXPIRED.to_string());
                job.completed_at = Some(now);
            }
            job.worker_id = None;
            job.updated_at = now;
            reaped += 1;
        }
        Ok(reaped)
    }

    async fn delete_query_job(&self, id: Uuid) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let before = state.query_jobs.len();
        state.query_jobs.retain(|j| j.id != id);
        if state.query_jobs.len() == before {
            return Err(StorageError::not_found("query job", id));
        }
        Ok(())
    }
}
