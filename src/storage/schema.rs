//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the PostgreSQL
//! storage backend. Statements are idempotent and applied in order by the
//! migration runner.

/// SQL schema for creating the pipelines table.
pub const CREATE_PIPELINES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    id UUID PRIMARY KEY,
    name VARCHAR(255) NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    owner VARCHAR(255) NOT NULL,
    concurrency_limit INTEGER CHECK (concurrency_limit IS NULL OR concurrency_limit > 0),
    is_paused BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the pipeline_jobs table.
pub const CREATE_PIPELINE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_jobs (
    id UUID PRIMARY KEY,
    pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name VARCHAR(255) NOT NULL,
    notebook_id VARCHAR(255) NOT NULL,
    depends_on TEXT[] NOT NULL DEFAULT '{}',
    job_order INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    timeout_seconds BIGINT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(pipeline_id, name)
)
"#;

/// SQL schema for creating the pipeline_runs table.
pub const CREATE_PIPELINE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id UUID PRIMARY KEY,
    pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    status VARCHAR(32) NOT NULL,
    trigger_type VARCHAR(32) NOT NULL,
    triggered_by VARCHAR(255) NOT NULL,
    parameters JSONB NOT NULL DEFAULT '{}',
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ
)
"#;

/// SQL schema for creating the pipeline_job_runs table.
pub const CREATE_PIPELINE_JOB_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_job_runs (
    id UUID PRIMARY KEY,
    run_id UUID NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    job_id UUID NOT NULL,
    job_name VARCHAR(255) NOT NULL,
    status VARCHAR(32) NOT NULL,
    retry_attempt INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    seq BIGSERIAL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ
)
"#;

/// SQL schema for creating the query_jobs table.
pub const CREATE_QUERY_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS query_jobs (
    id UUID PRIMARY KEY,
    principal_name VARCHAR(255) NOT NULL,
    request_id VARCHAR(255) NOT NULL,
    sql_text TEXT NOT NULL,
    status VARCHAR(32) NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    next_retry_at TIMESTAMPTZ,
    last_heartbeat_at TIMESTAMPTZ,
    worker_id VARCHAR(255),
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    result JSONB,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE(principal_name, request_id)
)
"#;

/// Notebook cells read by the SQL notebook runner. Owned by the notebook
/// service; created here so a fresh database can run pipelines.
pub const CREATE_NOTEBOOK_CELLS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notebook_cells (
    notebook_id VARCHAR(255) NOT NULL,
    position INTEGER NOT NULL,
    cell_type VARCHAR(32) NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (notebook_id, position)
)
"#;

/// Index backing active-run counts and per-pipeline listing.
pub const CREATE_PIPELINE_RUNS_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_pipeline_status ON pipeline_runs(pipeline_id, status)
"#;

/// Index backing newest-first run listing.
pub const CREATE_PIPELINE_RUNS_CREATED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipeline_runs_created_at ON pipeline_runs(created_at DESC)
"#;

pub const CREATE_PIPELINE_JOB_RUNS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pipeline_job_runs_run_id ON pipeline_job_runs(run_id, seq)
"#;

/// Index backing the claim query.
pub const CREATE_QUERY_JOBS_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_query_jobs_claimable ON query_jobs(status, next_retry_at, created_at)
"#;

/// Partial index backing the stale-heartbeat sweep.
pub const CREATE_QUERY_JOBS_HEARTBEAT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_query_jobs_heartbeat ON query_jobs(last_heartbeat_at) WHERE status = 'running'
"#;

/// Cron schedule of a pipeline. Added after the initial table.
pub const ADD_PIPELINES_SCHEDULE_COLUMN: &str = r#"
ALTER TABLE pipelines ADD COLUMN IF NOT EXISTS schedule_cron VARCHAR(255)
"#;

/// All schema creation statements in order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PIPELINES_TABLE,
        CREATE_PIPELINE_JOBS_TABLE,
        CREATE_PIPELINE_RUNS_TABLE,
        CREATE_PIPELINE_JOB_RUNS_TABLE,
        CREATE_QUERY_JOBS_TABLE,
        CREATE_NOTEBOOK_CELLS_TABLE,
        CREATE_PIPELINE_RUNS_STATUS_INDEX,
        CREATE_PIPELINE_RUNS_CREATED_INDEX,
        CREATE_PIPELINE_JOB_RUNS_INDEX,
        CREATE_QUERY_JOBS_CLAIM_INDEX,
        CREATE_QUERY_JOBS_HEARTBEAT_INDEX,
        ADD_PIPELINES_SCHEDULE_COLUMN,
    ]
}
