//! Pipeline and job management.
//!
//! Enforces the definition invariants at write time: unique job names per
//! pipeline, known dependencies, an acyclic graph and a parseable schedule.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{OrchestratorError, ValidationError};
use crate::storage::Storage;

use super::dag::DependencyResolver;
use super::schedule::parse_schedule;
use super::types::{Job, Pipeline};

pub struct PipelineService {
    store: Arc<dyn Storage>,
    resolver: DependencyResolver,
}

impl PipelineService {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            resolver: DependencyResolver::new(),
        }
    }

    pub async fn create_pipeline(&self, pipeline: Pipeline) -> Result<Pipeline, OrchestratorError> {
        if pipeline.name.trim().is_empty() {
            return Err(ValidationError::InvalidInput("pipeline name cannot be empty".into()).into());
        }
        if pipeline.concurrency_limit == Some(0) {
            return Err(ValidationError::InvalidInput(
                "concurrency limit must be greater than 0".into(),
            )
            .into());
        }
        if let Some(expression) = &pipeline.schedule_cron {
            parse_schedule(expression)?;
        }

        let created = self.store.create_pipeline(&pipeline).await?;
        info!(pipeline_id = %created.id, name = %created.name, "Pipeline created");
        Ok(created)
    }

    pub async fn get_pipeline(&self, id: Uuid) -> Result<Pipeline, OrchestratorError> {
        Ok(self.store.get_pipeline(id).await?)
    }

    pub async fn get_pipeline_by_name(&self, name: &str) -> Result<Pipeline, OrchestratorError> {
        Ok(self.store.get_pipeline_by_name(name).await?)
    }

    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>, OrchestratorError> {
        Ok(self.store.list_pipelines().await?)
    }

    /// Pauses or resumes scheduled triggers.
    pub async fn set_paused(&self, id: Uuid, paused: bool) -> Result<Pipeline, OrchestratorError> {
        let mut pipeline = self.store.get_pipeline(id).await?;
        pipeline.is_paused = paused;
        pipeline.updated_at = Utc::now();
        Ok(self.store.update_pipeline(&pipeline).await?)
    }

    pub async fn set_concurrency_limit(
        &self,
        id: Uuid,
        limit: Option<u32>,
    ) -> Result<Pipeline, OrchestratorError> {
        if limit == Some(0) {
            return Err(ValidationError::InvalidInput(
                "concurrency limit must be greater than 0".into(),
            )
            .into());
        }
        let mut pipeline = self.store.get_pipeline(id).await?;
        pipeline.concurrency_limit = limit;
        pipeline.updated_at = Utc::now();
        Ok(self.store.update_pipeline(&pipeline).await?)
    }

    /// Sets or clears the cron schedule.
    pub async fn set_schedule(
        &self,
        id: Uuid,
        schedule_cron: Option<String>,
    ) -> Result<Pipeline, OrchestratorError> {
        if let Some(expression) = &schedule_cron {
            parse_schedule(expression)?;
        }
        let mut pipeline = self.store.get_pipeline(id).await?;
        pipeline.schedule_cron = schedule_cron;
        pipeline.updated_at = Utc::now();
        let updated = self.store.update_pipeline(&pipeline).await?;
        info!(
            pipeline_id = %id,
            schedule = ?updated.schedule_cron,
            "Pipeline schedule updated"
        );
        Ok(updated)
    }

    /// Deletes a pipeline with its jobs, runs and job-runs.
    pub async fn delete_pipeline(&self, id: Uuid) -> Result<(), OrchestratorError> {
        self.store.delete_pipeline(id).await?;
        info!(pipeline_id = %id, "Pipeline deleted");
        Ok(())
    }

    /// Adds a job, rejecting duplicates, unknown dependencies and cycles.
    pub async fn add_job(&self, job: Job) -> Result<Job, OrchestratorError> {
        if job.name.trim().is_empty() {
            return Err(ValidationError::InvalidInput("job name cannot be empty".into()).into());
        }
        if job.notebook_id.trim().is_empty() {
            return Err(ValidationError::InvalidInput(format!(
                "job '{}' has no notebook",
                job.name
            ))
            .into());
        }

        self.store.get_pipeline(job.pipeline_id).await?;
        let mut jobs = self.store.list_jobs(job.pipeline_id).await?;
        if jobs.iter().any(|j| j.name == job.name) {
            return Err(OrchestratorError::Conflict(format!(
                "job '{}' already exists in pipeline",
                job.name
            )));
        }

        jobs.push(job.clone());
        self.resolver.validate(&jobs)?;

        let created = self.store.create_job(&job).await?;
        info!(
            pipeline_id = %created.pipeline_id,
            job_name = %created.name,
            depends_on = ?created.depends_on,
            "Job added"
        );
        Ok(created)
    }

    /// Lists jobs ordered by `job_order`, then name.
    pub async fn list_jobs(&self, pipeline_id: Uuid) -> Result<Vec<Job>, OrchestratorError> {
        self.store.get_pipeline(pipeline_id).await?;
        Ok(self.store.list_jobs(pipeline_id).await?)
    }

    /// Removes a job that no other job depends on.
    pub async fn remove_job(&self, pipeline_id: Uuid, name: &str) -> Result<(), OrchestratorError> {
        let jobs = self.store.list_jobs(pipeline_id).await?;
        let job = jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| OrchestratorError::not_found("job", name))?;

        if let Some(dependent) = jobs.iter().find(|j| j.depends_on.iter().any(|d| d == name)) {
            return Err(ValidationError::InvalidInput(format!(
                "job '{}' is required by '{}'",
                name, dependent.name
            ))
            .into());
        }

        self.store.delete_job(job.id).await?;
        info!(pipeline_id = %pipeline_id, job_name = name, "Job removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn service() -> PipelineService {
        PipelineService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_pipeline_rejects_duplicates() {
        let svc = service();
        svc.create_pipeline(Pipeline::new("etl", "alice")).await.unwrap();
        let err = svc
            .create_pipeline(Pipeline::new("etl", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_pipeline_rejects_empty_name() {
        let err = service()
            .create_pipeline(Pipeline::new("  ", "alice"))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_add_job_rejects_unknown_dependency() {
        let svc = service();
        let p = svc.create_pipeline(Pipeline::new("etl", "alice")).await.unwrap();

        let err = svc
            .add_job(Job::new(p.id, "b", "nb").with_depends_on(["a"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::UnknownDependency { .. })
        ));
        assert!(svc.list_jobs(p.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_job_rejects_duplicate_name() {
        let svc = service();
        let p = svc.create_pipeline(Pipeline::new("etl", "alice")).await.unwrap();
        svc.add_job(Job::new(p.id, "a", "nb")).await.unwrap();

        let err = svc.add_job(Job::new(p.id, "a", "nb2")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_add_job_rejects_self_dependency() {
        let svc = service();
        let p = svc.create_pipeline(Pipeline::new("etl", "alice")).await.unwrap();

        let err = svc
            .add_job(Job::new(p.id, "a", "nb").with_depends_on(["a"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Validation(ValidationError::Cycle { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_job_refuses_while_depended_on() {
        let svc = service();
        let p = svc.create_pipeline(Pipeline::new("etl", "alice")).await.unwrap();
        svc.add_job(Job::new(p.id, "a", "nb")).await.unwrap();
        svc.add_job(Job::new(p.id, "b", "nb").with_depends_on(["a"]))
            .await
            .unwrap();

        assert!(svc.remove_job(p.id, "a").await.unwrap_err().is_validation());
        svc.remove_job(p.id, "b").await.unwrap();
        svc.remove_job(p.id, "a").await.unwrap();
        assert!(svc.list_jobs(p.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_paused_and_limit() {
        let svc = service();
        let p = svc.create_pipeline(Pipeline::new("etl", "alice")).await.unwrap();

        let p = svc.set_paused(p.id, true).await.unwrap();
        assert!(p.is_paused);

        let p = svc.set_concurrency_limit(p.id, Some(2)).await.unwrap();
        assert_eq!(p.concurrency_limit, Some(2));
        assert!(svc.set_concurrency_limit(p.id, Some(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_schedule_is_validated_on_write() {
        let svc = service();
        let err = svc
            .create_pipeline(Pipeline::new("etl", "alice").with_schedule("every day"))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let p = svc
            .create_pipeline(Pipeline::new("etl", "alice").with_schedule("0 3 * * *"))
            .await
            .unwrap();
        assert_eq!(p.schedule_cron.as_deref(), Some("0 3 * * *"));

        assert!(svc
            .set_schedule(p.id, Some("0 25 * * *".to_string()))
            .await
            .unwrap_err()
            .is_validation());
        let p = svc.set_schedule(p.id, None).await.unwrap();
        assert!(p.schedule_cron.is_none());
    }
}
