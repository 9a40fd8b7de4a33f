//! Execution collaborators.
//!
//! The orchestration core never runs SQL itself. Pipeline jobs are handed to
//! a [`NotebookRunner`] and query jobs to a [`QueryEngine`]; both report
//! failures as [`ExecutionError`] so retry policies can tell transient from
//! terminal errors. Implementations must observe the cancellation token.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::pipeline::Job;
use crate::scheduler::QueryResult;

pub mod postgres;

pub use postgres::{PgNotebookRunner, PgQueryEngine};

/// Run-level context passed to every notebook invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    /// Principal that triggered the run.
    pub principal: String,
    pub parameters: HashMap<String, String>,
}

/// Executes the notebook bound to a pipeline job.
#[async_trait]
pub trait NotebookRunner: Send + Sync {
    /// Runs one attempt. `attempt` is zero-based.
    async fn run_notebook(
        &self,
        job: &Job,
        context: &RunContext,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Result<(), ExecutionError>;
}

/// Executes a standalone SQL statement on behalf of a principal.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(
        &self,
        principal: &str,
        sql: &str,
        cancel: CancellationToken,
    ) -> Result<QueryResult, ExecutionError>;
}
