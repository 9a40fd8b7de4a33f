//! Integration tests for the PostgreSQL storage backend.
//!
//! These tests need a disposable database.
//! Run with: DATABASE_URL=postgres://localhost/catalog_test cargo test --test postgres_integration -- --ignored

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use catalog_orchestrator::pipeline::{
    Job, JobRun, JobRunStatus, Pipeline, PipelineRun, RunStatus, TriggerType,
};
use catalog_orchestrator::scheduler::{QueryJob, QueryJobStatus, QueryResult};
use catalog_orchestrator::storage::{
    Database, PipelineStore, QueryJobStore, RunStore, StorageError, CANCELLED_WHILE_PENDING,
};

async fn connect() -> Database {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL environment variable must be set for integration tests");
    let db = Database::connect(&url, 10)
        .await
        .expect("Should connect to database");
    db.run_migrations().await.expect("Migrations should apply");
    db
}

async fn pipeline_with_job(db: &Database, limit: Option<u32>) -> (Pipeline, Job) {
    let mut pipeline = Pipeline::new(format!("it-{}", Uuid::new_v4()), "integration");
    pipeline.concurrency_limit = limit;
    let pipeline = db.create_pipeline(&pipeline).await.expect("create pipeline");
    let job = db
        .create_job(&Job::new(pipeline.id, "only", "nb-only"))
        .await
        .expect("create job");
    (pipeline, job)
}

fn pending_run(pipeline_id: Uuid) -> PipelineRun {
    PipelineRun::new(pipeline_id, TriggerType::Manual, "integration", HashMap::new())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test postgres_integration -- --ignored
async fn test_migrations_are_idempotent() {
    let db = connect().await;
    let applied = db.run_migrations().await.expect("second run should succeed");
    assert_eq!(applied, 0);

    let history = db.applied_migrations().await.expect("history should load");
    assert!(!history.is_empty());
    let names: Vec<_> = history.iter().map(|m| m.name.clone()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[tokio::test]
#[ignore]
async fn test_concurrency_cap_holds_under_parallel_inserts() {
    let db = Arc::new(connect().await);
    let (pipeline, _) = pipeline_with_job(&db, Some(2)).await;

    let attempts = futures::future::join_all((0..8).map(|_| {
        let db = Arc::clone(&db);
        let run = pending_run(pipeline.id);
        async move { db.create_run(&run, Some(2)).await }
    }))
    .await;

    let created = attempts.iter().filter(|r| r.is_ok()).count();
    let rejected = attempts
        .iter()
        .filter(|r| matches!(r, Err(StorageError::ConcurrencyLimit { .. })))
        .count();
    assert_eq!(created, 2);
    assert_eq!(rejected, 6);
    assert_eq!(db.count_active_runs(pipeline.id).await.unwrap(), 2);
}

#[tokio::test]
#[ignore]
async fn test_run_transitions_are_compare_and_swap() {
    let db = connect().await;
    let (pipeline, job) = pipeline_with_job(&db, None).await;
    let run = db.create_run(&pending_run(pipeline.id), None).await.unwrap();

    let now = Utc::now();
    assert!(db.mark_run_started(run.id, now).await.unwrap());
    assert!(!db.mark_run_started(run.id, now).await.unwrap());
    assert!(!db.cancel_pending_run(run.id, now).await.unwrap());

    let job_run = db.create_job_run(&JobRun::new(run.id, &job)).await.unwrap();
    assert!(db.mark_job_run_started(job_run.id, now).await.unwrap());
    assert!(db
        .finish_job_run(job_run.id, JobRunStatus::Success, None, now)
        .await
        .unwrap());
    assert!(!db
        .finish_job_run(job_run.id, JobRunStatus::Failed, Some("late"), now)
        .await
        .unwrap());

    assert!(db
        .finish_run(run.id, RunStatus::Success, None, Utc::now())
        .await
        .unwrap());
    assert!(!db
        .finish_run(run.id, RunStatus::Failed, Some("late"), Utc::now())
        .await
        .unwrap());
    assert_eq!(db.get_run(run.id).await.unwrap().status, RunStatus::Success);
}

#[tokio::test]
#[ignore]
async fn test_cancel_pending_runs_only_touches_pending() {
    let db = connect().await;
    let (pipeline, _) = pipeline_with_job(&db, None).await;
    let pending = db.create_run(&pending_run(pipeline.id), None).await.unwrap();
    let running = db.create_run(&pending_run(pipeline.id), None).await.unwrap();
    db.mark_run_started(running.id, Utc::now()).await.unwrap();

    assert_eq!(db.cancel_pending_runs(pipeline.id, Utc::now()).await.unwrap(), 1);
    assert_eq!(db.cancel_pending_runs(pipeline.id, Utc::now()).await.unwrap(), 0);

    let cancelled = db.get_run(pending.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);
    assert_eq!(
        cancelled.error_message.as_deref(),
        Some(CANCELLED_WHILE_PENDING)
    );
    assert_eq!(
        db.get_run(running.id).await.unwrap().status,
        RunStatus::Running
    );
}

#[tokio::test]
#[ignore]
async fn test_query_job_claims_are_exclusive() {
    let db = Arc::new(connect().await);
    let principal = format!("it-{}", Uuid::new_v4());
    let job = db
        .create_query_job(&QueryJob::new(principal.as_str(), "req-1", "SELECT 1"))
        .await
        .unwrap();

    let claims = futures::future::join_all((0..8).map(|i| {
        let db = Arc::clone(&db);
        async move { db.claim_next_query_job(&format!("worker-{}", i), Utc::now()).await }
    }))
    .await;

    let mine: Vec<_> = claims
        .into_iter()
        .filter_map(|c| c.unwrap())
        .filter(|claimed| claimed.id == job.id)
        .collect();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].attempt_count, 1);

    let stale = db
        .complete_query_job(job.id, 0, &QueryResult::empty(), Utc::now())
        .await
        .unwrap();
    assert!(!stale);
    assert!(db
        .complete_query_job(job.id, 1, &QueryResult::empty(), Utc::now())
        .await
        .unwrap());
    assert_eq!(
        db.get_query_job(job.id).await.unwrap().status,
        QueryJobStatus::Succeeded
    );
}

#[tokio::test]
#[ignore]
async fn test_request_id_is_unique_per_principal() {
    let db = connect().await;
    let principal = format!("it-{}", Uuid::new_v4());
    let first = db
        .create_query_job(&QueryJob::new(principal.as_str(), "req-1", "SELECT 1"))
        .await
        .unwrap();

    let duplicate = db
        .create_query_job(&QueryJob::new(principal.as_str(), "req-1", "SELECT 1"))
        .await;
    assert!(matches!(duplicate, Err(StorageError::Conflict(_))));

    let found = db
        .find_query_job_by_request(&principal, "req-1")
        .await
        .unwrap()
        .expect("job should be found by request id");
    assert_eq!(found.id, first.id);
}

#[tokio::test]
#[ignore]
async fn test_failed_attempt_with_pending_cancel_ends_cancelled() {
    let db = connect().await;
    let principal = format!("it-{}", Uuid::new_v4());
    let job = db
        .create_query_job(&QueryJob::new(principal.as_str(), "req-1", "SELECT 1"))
        .await
        .unwrap();

    // Claims go to the oldest claimable job, so keep claiming until ours.
    loop {
        let claimed = db
            .claim_next_query_job("worker-1", Utc::now())
            .await
            .unwrap()
            .expect("job should be claimable");
        if claimed.id == job.id {
            break;
        }
    }
    db.cancel_query_job(job.id, Utc::now()).await.unwrap();

    let written = db
        .retry_query_job(job.id, 1, Utc::now(), "connection reset", Utc::now())
        .await
        .unwrap();
    assert_eq!(written, Some(QueryJobStatus::Cancelled));

    let stored = db.get_query_job(job.id).await.unwrap();
    assert_eq!(stored.status, QueryJobStatus::Cancelled);
    assert!(stored.next_retry_at.is_none());
    assert!(stored.completed_at.is_some());
    assert_eq!(
        db.fail_query_job(job.id, 1, "late", Utc::now()).await.unwrap(),
        None
    );
}
