//! Pipeline definitions and run orchestration.
//!
//! # Architecture
//!
//! - **Types**: pipelines, jobs, runs, job-runs and their status enums
//! - **Dag**: the dependency resolver that turns jobs into ordered batches
//! - **Service**: pipeline and job management with write-time validation
//! - **Coordinator**: run lifecycle (start, drive, cancel, count)
//! - **Executor**: one job-run with retries, timeouts and cancellation
//! - **Config**: coordinator settings, from code or environment
//! - **Schedule**: cron triggers for pipelines with a schedule
//!
//! # Run Flow
//!
//! 1. **Start**: the dependency graph and parameters are validated and the
//!    concurrency cap is checked; the run is stored as Pending
//! 2. **Drive**: the run moves to Running and one job-run per job is created
//! 3. **Batches**: each batch runs concurrently and must finish before the
//!    next one starts
//! 4. **Finalize**: the run ends Success, Failed (later job-runs Skipped) or
//!    Cancelled, exactly once
//!
//! # Example
//!
//! ```rust,ignore
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use catalog_orchestrator::pipeline::{
//!     CoordinatorConfig, Job, Pipeline, PipelineService, RunCoordinator, TriggerType,
//! };
//!
//! let service = PipelineService::new(store.clone());
//! let pipeline = service.create_pipeline(Pipeline::new("nightly", "alice")).await?;
//! service.add_job(Job::new(pipeline.id, "step-1", "nb-extract")).await?;
//! service
//!     .add_job(Job::new(pipeline.id, "step-2", "nb-load").with_depends_on(["step-1"]))
//!     .await?;
//!
//! let coordinator = RunCoordinator::new(store, runner, CoordinatorConfig::default());
//! let run = coordinator
//!     .start_run(pipeline.id, TriggerType::Manual, "alice", HashMap::new())
//!     .await?;
//! let finished = coordinator.drive(run.id).await?;
//! println!("Run {} finished with status: {}", finished.id, finished.status);
//! ```

pub mod config;
pub mod coordinator;
pub mod dag;
pub mod executor;
pub mod schedule;
pub mod service;
pub mod types;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{validate_parameters, RunCoordinator};
pub use dag::DependencyResolver;
pub use executor::{JobExecutor, JobOutcome};
pub use schedule::{parse_schedule, CronScheduler, CronSchedulerConfig, SCHEDULER_PRINCIPAL};
pub use service::PipelineService;
pub use types::{
    Job, JobRun, JobRunStatus, Pipeline, PipelineRun, RunFilter, RunStatus, TriggerType,
    UnknownStatus,
};
