//! Query job definitions for the scheduler.
//!
//! This module defines the core types of the standalone query job system:
//!
//! - `QueryJob`: a single SQL statement submitted by a principal
//! - `QueryJobStatus`: the queued → running → retrying → terminal lifecycle
//! - `QueryResult` / `ResultValue`: the typed result set of a successful job

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::UnknownStatus;

/// Default maximum number of attempts for a query job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a query job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryJobStatus {
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker that is heartbeating.
    Running,
    /// A transient failure happened; waiting for `next_retry_at`.
    Retrying,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for QueryJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryJobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A single cell of a result row.
///
/// The set of variants is closed so results survive a round trip through
/// JSON storage without losing their type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResultValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Result set of a succeeded query job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ResultValue>>,
    pub row_count: u64,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<ResultValue>>) -> Self {
        let row_count = rows.len() as u64;
        Self {
            columns,
            rows,
            row_count,
        }
    }

    /// Result of a statement that returned no rows.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// A standalone SQL statement executed asynchronously on behalf of a principal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryJob {
    pub id: Uuid,
    pub principal: String,
    /// Idempotency key, unique per principal.
    pub request_id: String,
    pub sql_text: String,
    pub status: QueryJobStatus,
    /// Number of Running assignments so far. Also the fencing generation
    /// every worker write is checked against.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub result: Option<QueryResult>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl QueryJob {
    /// Creates a new Queued job with the default attempt budget.
    pub fn new(
        principal: impl Into<String>,
        request_id: impl Into<String>,
        sql_text: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            request_id: request_id.into(),
            sql_text: sql_text.into(),
            status: QueryJobStatus::Queued,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_retry_at: None,
            last_heartbeat_at: None,
            worker_id: None,
            cancel_requested: false,
            result: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns whether another attempt is allowed after the current one.
    pub fn should_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Returns true if a worker may claim the job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.cancel_requested {
            return false;
        }
        match self.status {
            QueryJobStatus::Queued => true,
            QueryJobStatus::Retrying => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

/// Reply to a worker heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAck {
    /// The worker still owns the attempt.
    Alive { cancel_requested: bool },
    /// The attempt was reaped, cancelled or finished elsewhere.
    Lost,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was Queued or Retrying and is now Cancelled.
    Cancelled,
    /// The job is Running; its worker will stop at the next checkpoint.
    Requested,
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(QueryJobStatus),
}
