//! Asynchronous query jobs with durable state and a pool of workers.
//!
//! - **QueryJob**: a persisted SQL query submitted on behalf of a principal
//! - **QueryJobScheduler**: submit, inspect, cancel, claim, execute and reap
//! - **WorkerPool**: concurrent workers claiming jobs from storage
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Submitter  │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ submit(request_id)
//!                      ┌──────▼───────┐
//!                      │  query_jobs  │◄──── reaper (expired heartbeats)
//!                      │    table     │
//!                      └──────┬───────┘
//!                             │ claim (SKIP LOCKED)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use catalog_orchestrator::scheduler::{
//!     QueryJobScheduler, SchedulerConfig, WorkerPool, WorkerPoolConfig,
//! };
//!
//! let scheduler = Arc::new(QueryJobScheduler::new(store, engine, SchedulerConfig::default()));
//! let job = scheduler.submit("alice", "SELECT 1", Some("req-42")).await?;
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(4), Arc::clone(&scheduler));
//! pool.start().await?;
//! // ...
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability
//!
//! - **Exclusive claims**: a job is claimed by at most one worker at a time
//! - **Fenced writes**: outcomes from a worker that lost the job are dropped
//! - **Crash recovery**: the reaper requeues jobs whose heartbeat expired
//! - **Idempotent submit**: a repeated request id returns the original job

pub mod job;
pub mod service;
pub mod worker_pool;

pub use job::{
    CancelOutcome, HeartbeatAck, QueryJob, QueryJobStatus, QueryResult, ResultValue,
    DEFAULT_MAX_ATTEMPTS,
};
pub use service::{QueryJobScheduler, SchedulerConfig};
pub use worker_pool::{PoolError, PoolStats, Worker, WorkerPool, WorkerPoolConfig};
