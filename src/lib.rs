//! catalog-orchestrator: job and pipeline execution for a data catalog.
//!
//! Pipelines are DAGs of notebook jobs. A run executes the DAG in dependency
//! batches with bounded retries and cooperative cancellation. Ad-hoc SQL is
//! submitted as durable query jobs that a pool of workers claims, heartbeats
//! and retries with backoff.

pub mod cli;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{ExecutionError, OrchestratorError, ValidationError};
