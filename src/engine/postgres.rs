//! PostgreSQL-backed notebook runner and query engine.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Column, Executor, PgPool, Row, TypeInfo, ValueRef};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::pipeline::Job;
use crate::scheduler::{QueryResult, ResultValue};

use super::{NotebookRunner, QueryEngine, RunContext};

/// Prefix of the session settings that carry run parameters.
pub const PARAMETER_NAMESPACE: &str = "pipeline";

/// Maps a driver error onto the retry taxonomy.
pub fn classify_sqlx_error(err: &sqlx::Error) -> ExecutionError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            ExecutionError::transient(err.to_string())
        }
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let message = db.message().to_string();
            match code.as_str() {
                // serialization_failure, deadlock_detected, lock_not_available
                "40001" | "40P01" | "55P03" => ExecutionError::transient(message),
                // query_canceled (statement_timeout)
                "57014" => ExecutionError::timeout(message),
                c if c.starts_with("08") || c.starts_with("53") || c.starts_with("57P") => {
                    ExecutionError::transient(message)
                }
                _ => ExecutionError::terminal(message),
            }
        }
        other => ExecutionError::classify(other.to_string()),
    }
}

fn decode_error(column: &str, err: sqlx::Error) -> ExecutionError {
    ExecutionError::terminal(format!("failed to decode column '{}': {}", column, err))
}

fn decode_cell(row: &PgRow, idx: usize) -> Result<ResultValue, ExecutionError> {
    let column = &row.columns()[idx];
    let name = column.name();
    let raw = row.try_get_raw(idx).map_err(|e| decode_error(name, e))?;
    if raw.is_null() {
        return Ok(ResultValue::Null);
    }

    let value = match column.type_info().name() {
        "BOOL" => ResultValue::Bool(row.try_get(idx).map_err(|e| decode_error(name, e))?),
        "INT2" => ResultValue::Int(i64::from(
            row.try_get::<i16, _>(idx).map_err(|e| decode_error(name, e))?,
        )),
        "INT4" => ResultValue::Int(i64::from(
            row.try_get::<i32, _>(idx).map_err(|e| decode_error(name, e))?,
        )),
        "INT8" => ResultValue::Int(row.try_get(idx).map_err(|e| decode_error(name, e))?),
        "FLOAT4" => ResultValue::Float(f64::from(
            row.try_get::<f32, _>(idx).map_err(|e| decode_error(name, e))?,
        )),
        "FLOAT8" => ResultValue::Float(row.try_get(idx).map_err(|e| decode_error(name, e))?),
        "BYTEA" => ResultValue::Bytes(row.try_get(idx).map_err(|e| decode_error(name, e))?),
        "UUID" => ResultValue::Text(
            row.try_get::<Uuid, _>(idx)
                .map_err(|e| decode_error(name, e))?
                .to_string(),
        ),
        "TIMESTAMPTZ" => ResultValue::Text(
            row.try_get::<DateTime<Utc>, _>(idx)
                .map_err(|e| decode_error(name, e))?
                .to_rfc3339(),
        ),
        "TIMESTAMP" => ResultValue::Text(
            row.try_get::<NaiveDateTime, _>(idx)
                .map_err(|e| decode_error(name, e))?
                .to_string(),
        ),
        "DATE" => ResultValue::Text(
            row.try_get::<NaiveDate, _>(idx)
                .map_err(|e| decode_error(name, e))?
                .to_string(),
        ),
        "JSON" | "JSONB" => ResultValue::Text(
            row.try_get::<serde_json::Value, _>(idx)
                .map_err(|e| decode_error(name, e))?
                .to_string(),
        ),
        other => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => ResultValue::Text(text),
            Err(_) => ResultValue::Text(format!("<{}>", other.to_lowercase())),
        },
    };
    Ok(value)
}

/// Converts fetched rows into a typed result set.
pub fn rows_to_result(columns: Vec<String>, rows: &[PgRow]) -> Result<QueryResult, ExecutionError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            cells.push(decode_cell(row, idx)?);
        }
        out.push(cells);
    }
    Ok(QueryResult::new(columns, out))
}

/// Query engine executing statements on a PostgreSQL pool.
#[derive(Clone)]
pub struct PgQueryEngine {
    pool: PgPool,
    statement_timeout: Option<Duration>,
}

impl PgQueryEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statement_timeout: None,
        }
    }

    /// Bounds each statement with a server-side `statement_timeout`.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    async fn run(&self, sql: &str) -> Result<QueryResult, ExecutionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error(&e))?;

        if let Some(timeout) = self.statement_timeout {
            sqlx::query("SELECT set_config('statement_timeout', $1, true)")
                .bind(format!("{}ms", timeout.as_millis()))
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error(&e))?;
        }

        let rows = sqlx::query(sql)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| classify_sqlx_error(&e))?;

        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => (&mut *tx)
                .describe(sql)
                .await
                .map(|d| d.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default(),
        };

        tx.commit().await.map_err(|e| classify_sqlx_error(&e))?;
        rows_to_result(columns, &rows)
    }
}

#[async_trait]
impl QueryEngine for PgQueryEngine {
    async fn execute(
        &self,
        principal: &str,
        sql: &str,
        cancel: CancellationToken,
    ) -> Result<QueryResult, ExecutionError> {
        debug!(principal = principal, "Executing query");
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::cancelled("query canceled")),
            result = self.run(sql) => result,
        }
    }
}

/// Notebook runner that executes a notebook's SQL cells in order.
///
/// Cells are read from the `notebook_cells` table and run inside one
/// transaction per attempt. Run parameters are exposed as transaction-local
/// settings named `pipeline.<name>`, readable with
/// `current_setting('pipeline.<name>')`.
#[derive(Clone)]
pub struct PgNotebookRunner {
    pool: PgPool,
}

impl PgNotebookRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_cells(&self, notebook_id: &str) -> Result<Vec<String>, ExecutionError> {
        let cells: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT content FROM notebook_cells
            WHERE notebook_id = $1 AND cell_type = 'sql'
            ORDER BY position
            "#,
        )
        .bind(notebook_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(&e))?;

        Ok(cells
            .into_iter()
            .map(|(content,)| content)
            .filter(|c| !c.trim().is_empty())
            .collect())
    }

    async fn run(
        &self,
        job: &Job,
        context: &RunContext,
        attempt: u32,
    ) -> Result<(), ExecutionError> {
        let cells = self.load_cells(&job.notebook_id).await?;
        if cells.is_empty() {
            return Err(ExecutionError::terminal(format!(
                "notebook '{}' has no SQL cells",
                job.notebook_id
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error(&e))?;

        let mut settings: Vec<(String, String)> = vec![
            ("run_id".to_string(), context.run_id.to_string()),
            ("job_name".to_string(), job.name.clone()),
            ("attempt".to_string(), attempt.to_string()),
        ];
        settings.extend(
            context
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        for (name, value) in &settings {
            sqlx::query("SELECT set_config($1, $2, true)")
                .bind(format!("{}.{}", PARAMETER_NAMESPACE, name))
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(|e| classify_sqlx_error(&e))?;
        }

        for (idx, cell) in cells.iter().enumerate() {
            debug!(job_name = %job.name, cell = idx, "Executing notebook cell");
            (&mut *tx)
                .execute(cell.as_str())
                .await
                .map_err(|e| {
                    let mut err = classify_sqlx_error(&e);
                    err.message = format!("cell {}: {}", idx, err.message);
                    err
                })?;
        }

        tx.commit().await.map_err(|e| classify_sqlx_error(&e))?;
        Ok(())
    }
}

#[async_trait]
impl NotebookRunner for PgNotebookRunner {
    async fn run_notebook(
        &self,
        job: &Job,
        context: &RunContext,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Result<(), ExecutionError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecutionError::cancelled("notebook execution cancelled")),
            result = self.run(job, context, attempt) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionErrorKind;

    #[test]
    fn test_pool_errors_are_transient() {
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut).kind,
            ExecutionErrorKind::Transient
        );
    }

    #[test]
    fn test_other_driver_errors_fall_back_to_message_hints() {
        let err = classify_sqlx_error(&sqlx::Error::Protocol("unexpected eof".into()));
        assert_eq!(err.kind, ExecutionErrorKind::Transient);

        let err = classify_sqlx_error(&sqlx::Error::ColumnNotFound("x".into()));
        assert_eq!(err.kind, ExecutionErrorKind::Terminal);
    }

    #[test]
    fn test_empty_rows_produce_empty_result() {
        let result = rows_to_result(vec!["a".into()], &[]).unwrap();
        assert_eq!(result.columns, vec!["a".to_string()]);
        assert_eq!(result.row_count, 0);
    }
}
