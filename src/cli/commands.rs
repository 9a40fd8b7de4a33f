//! CLI command definitions for catalog-orchestrator.
//!
//! Every command connects to PostgreSQL, performs one operation against the
//! orchestration core and prints the resulting rows as JSON.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{PgNotebookRunner, PgQueryEngine};
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{
    ConfigError, CoordinatorConfig, CronScheduler, CronSchedulerConfig, Pipeline,
    PipelineService, RunCoordinator, RunFilter, RunStatus, TriggerType,
};
use crate::scheduler::{
    CancelOutcome, QueryJobScheduler, SchedulerConfig, WorkerPool, WorkerPoolConfig,
};
use crate::storage::{Database, Storage};

/// Default number of runs listed by `runs`.
const DEFAULT_LIST_LIMIT: i64 = 20;

/// Pipeline run and query job orchestration for the data catalog.
#[derive(Parser)]
#[command(name = "catalog-orchestrator")]
#[command(about = "Run pipelines and asynchronous query jobs against the catalog database")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply pending schema migrations.
    Migrate,

    /// Run a pool of query job workers until interrupted.
    Worker(WorkerArgs),

    /// Fire cron-scheduled pipeline runs until interrupted.
    Scheduler,

    /// Set or clear a pipeline's cron schedule.
    SetSchedule(SetScheduleArgs),

    /// Start a pipeline run and drive it to completion.
    Trigger(TriggerArgs),

    /// Drive an existing Pending run.
    Drive(RunArgs),

    /// Cancel every Pending run of a pipeline.
    CancelPending(PipelineArgs),

    /// Cancel a single run.
    CancelRun(RunArgs),

    /// Show one run with its job-runs.
    Run(RunArgs),

    /// List runs, newest first.
    Runs(ListRunsArgs),

    /// Submit an asynchronous query job.
    SubmitQuery(SubmitQueryArgs),

    /// Show a query job.
    QueryJob(QueryJobArgs),

    /// Cancel a query job.
    CancelQuery(QueryJobArgs),
}

/// Arguments for `worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers; overrides WORKER_POOL_SIZE.
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,

    /// Do not run the stale job reaper in this process.
    #[arg(long)]
    pub no_reaper: bool,

    /// Print the Prometheus text exposition on shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `set-schedule`.
#[derive(Parser, Debug)]
pub struct SetScheduleArgs {
    /// Pipeline name or id.
    #[arg(short, long)]
    pub pipeline: String,

    /// Cron expression, e.g. "0 3 * * *". Omit to clear the schedule.
    pub cron: Option<String>,
}

/// Arguments for `trigger`.
#[derive(Parser, Debug)]
pub struct TriggerArgs {
    /// Pipeline name or id.
    #[arg(short, long)]
    pub pipeline: String,

    /// Run parameter as KEY=VALUE; repeatable.
    #[arg(long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Principal recorded as the run's trigger.
    #[arg(long, default_value = "cli")]
    pub triggered_by: String,

    /// Record the run as a scheduled trigger instead of a manual one.
    #[arg(long)]
    pub scheduled: bool,

    /// Leave the run Pending instead of driving it here.
    #[arg(long)]
    pub detach: bool,
}

/// Arguments naming a pipeline.
#[derive(Parser, Debug)]
pub struct PipelineArgs {
    /// Pipeline name or id.
    #[arg(short, long)]
    pub pipeline: String,
}

/// Arguments naming a run.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run id.
    pub run_id: Uuid,
}

/// Arguments for `runs`.
#[derive(Parser, Debug)]
pub struct ListRunsArgs {
    /// Restrict to one pipeline (name or id).
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Restrict to one status (pending, running, success, failed, cancelled).
    #[arg(short, long)]
    pub status: Option<RunStatus>,

    /// Maximum number of runs.
    #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
    pub limit: i64,

    /// Number of runs to skip.
    #[arg(long, default_value_t = 0)]
    pub offset: i64,
}

/// Arguments for `submit-query`.
#[derive(Parser, Debug)]
pub struct SubmitQueryArgs {
    /// Principal the query runs as.
    #[arg(long)]
    pub principal: String,

    /// SQL text to execute.
    #[arg(long)]
    pub sql: String,

    /// Client request id; resubmitting with the same id returns the same job.
    #[arg(long)]
    pub request_id: Option<String>,
}

/// Arguments naming a query job.
#[derive(Parser, Debug)]
pub struct QueryJobArgs {
    /// Principal that owns the job.
    #[arg(long)]
    pub principal: String,

    /// Query job id.
    pub job_id: Uuid,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((key.to_string(), value.to_string()))
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = coordinator_config(cli.database_url.as_deref())?;
    let db = Database::connect(&config.database_url, config.max_connections).await?;

    match cli.command {
        Commands::Migrate => run_migrate_command(&db).await,
        Commands::Worker(args) => run_worker_command(db, args).await,
        Commands::Scheduler => run_scheduler_command(db, config).await,
        Commands::SetSchedule(args) => {
            let pipeline = resolve_pipeline(&db, &args.pipeline).await?;
            let service = PipelineService::new(Arc::new(db));
            print_json(&service.set_schedule(pipeline.id, args.cron).await?)
        }
        Commands::Trigger(args) => run_trigger_command(db, config, args).await,
        Commands::Drive(args) => {
            let coordinator = coordinator(db, config);
            print_json(&coordinator.drive(args.run_id).await?)
        }
        Commands::CancelPending(args) => {
            let pipeline = resolve_pipeline(&db, &args.pipeline).await?;
            let cancelled = coordinator(db, config).cancel_pending(pipeline.id).await?;
            print_json(&serde_json::json!({
                "pipeline_id": pipeline.id,
                "cancelled": cancelled,
            }))
        }
        Commands::CancelRun(args) => {
            print_json(&coordinator(db, config).cancel_run(args.run_id).await?)
        }
        Commands::Run(args) => run_show_command(db, config, args).await,
        Commands::Runs(args) => run_list_command(db, config, args).await,
        Commands::SubmitQuery(args) => {
            let job = query_scheduler(db)?
                .submit(&args.principal, &args.sql, args.request_id.as_deref())
                .await?;
            print_json(&job)
        }
        Commands::QueryJob(args) => {
            print_json(&query_scheduler(db)?.get(&args.principal, args.job_id).await?)
        }
        Commands::CancelQuery(args) => run_cancel_query_command(db, args).await,
    }
}

/// Loads coordinator settings from the environment, letting the command
/// line supply the database URL.
fn coordinator_config(database_url: Option<&str>) -> anyhow::Result<CoordinatorConfig> {
    let config = match CoordinatorConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::MissingEnvVar(var)) => match database_url {
            Some(_) => CoordinatorConfig::default(),
            None => {
                return Err(anyhow::anyhow!(
                    "{} is not set and --database-url was not given",
                    var
                ))
            }
        },
        Err(e) => return Err(e.into()),
    };

    let config = match database_url {
        Some(url) => config.with_database_url(url),
        None => config,
    };
    config.validate()?;
    Ok(config)
}

fn coordinator(db: Database, config: CoordinatorConfig) -> Arc<RunCoordinator> {
    let runner = Arc::new(PgNotebookRunner::new(db.pool().clone()));
    let store: Arc<dyn Storage> = Arc::new(db);
    Arc::new(RunCoordinator::new(store, runner, config))
}

fn query_scheduler(db: Database) -> anyhow::Result<Arc<QueryJobScheduler>> {
    let config = SchedulerConfig::from_env()?;
    let mut engine = PgQueryEngine::new(db.pool().clone());
    if let Some(timeout) = config.statement_timeout {
        engine = engine.with_statement_timeout(timeout);
    }
    let engine = Arc::new(engine);
    let store: Arc<dyn Storage> = Arc::new(db);
    Ok(Arc::new(QueryJobScheduler::new(store, engine, config)))
}

/// Accepts a pipeline id or a pipeline name.
async fn resolve_pipeline(db: &Database, pipeline: &str) -> anyhow::Result<Pipeline> {
    let service = PipelineService::new(Arc::new(db.clone()));
    let found = match Uuid::parse_str(pipeline) {
        Ok(id) => service.get_pipeline(id).await?,
        Err(_) => service.get_pipeline_by_name(pipeline).await?,
    };
    Ok(found)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

async fn run_migrate_command(db: &Database) -> anyhow::Result<()> {
    let applied = db.run_migrations().await?;
    info!(applied = applied, "Migrations complete");
    let history: Vec<_> = db
        .applied_migrations()
        .await?
        .into_iter()
        .map(|m| serde_json::json!({ "name": m.name, "applied_at": m.applied_at }))
        .collect();
    print_json(&serde_json::json!({
        "applied": applied,
        "history": history,
    }))
}

async fn run_worker_command(db: Database, args: WorkerArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let mut pool_config = WorkerPoolConfig::from_env()?;
    if let Some(workers) = args.workers {
        pool_config.num_workers = workers;
    }
    if args.no_reaper {
        pool_config.enable_reaper = false;
    }

    let scheduler = query_scheduler(db)?;
    let mut pool = WorkerPool::new(pool_config, scheduler);
    pool.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping workers");

    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Worker pool did not stop cleanly");
    }

    let stats = pool.stats();
    info!(
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        cancelled = stats.jobs_cancelled,
        reaped = stats.jobs_reaped,
        success_rate = format!("{:.1}%", stats.success_rate()),
        "Worker pool stopped"
    );

    if args.print_metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

async fn run_scheduler_command(db: Database, config: CoordinatorConfig) -> anyhow::Result<()> {
    let store: Arc<dyn Storage> = Arc::new(db.clone());
    let scheduler = Arc::new(CronScheduler::new(
        store,
        coordinator(db, config),
        CronSchedulerConfig::from_env()?,
    ));

    let shutdown = CancellationToken::new();
    let mut handle = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    tokio::select! {
        result = &mut handle => return Ok(result??),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupt received, stopping scheduler");
            shutdown.cancel();
        }
    }
    handle.await??;
    Ok(())
}

async fn run_trigger_command(
    db: Database,
    config: CoordinatorConfig,
    args: TriggerArgs,
) -> anyhow::Result<()> {
    let pipeline = resolve_pipeline(&db, &args.pipeline).await?;
    let trigger = if args.scheduled {
        TriggerType::Scheduled
    } else {
        TriggerType::Manual
    };
    let parameters: HashMap<String, String> = args.params.into_iter().collect();

    let coordinator = coordinator(db, config);
    let run = coordinator
        .start_run(pipeline.id, trigger, &args.triggered_by, parameters)
        .await?;

    if args.detach {
        return print_json(&run);
    }

    let finished = coordinator.drive(run.id).await?;
    if finished.status != RunStatus::Success {
        warn!(
            run_id = %finished.id,
            status = %finished.status,
            error = finished.error_message.as_deref().unwrap_or(""),
            "Pipeline run did not succeed"
        );
    }
    print_json(&finished)
}

async fn run_show_command(
    db: Database,
    config: CoordinatorConfig,
    args: RunArgs,
) -> anyhow::Result<()> {
    let coordinator = coordinator(db, config);
    let run = coordinator.get_run(args.run_id).await?;
    let job_runs = coordinator.list_job_runs(args.run_id).await?;
    print_json(&serde_json::json!({
        "run": run,
        "job_runs": job_runs,
    }))
}

async fn run_list_command(
    db: Database,
    config: CoordinatorConfig,
    args: ListRunsArgs,
) -> anyhow::Result<()> {
    let mut filter = RunFilter::new()
        .with_limit(args.limit)
        .with_offset(args.offset);
    if let Some(pipeline) = &args.pipeline {
        filter = filter.with_pipeline(resolve_pipeline(&db, pipeline).await?.id);
    }
    if let Some(status) = args.status {
        filter = filter.with_status(status);
    }

    print_json(&coordinator(db, config).list_runs(&filter).await?)
}

async fn run_cancel_query_command(db: Database, args: QueryJobArgs) -> anyhow::Result<()> {
    let scheduler = query_scheduler(db)?;
    let outcome = scheduler.cancel(&args.principal, args.job_id).await?;
    let outcome = match outcome {
        CancelOutcome::Cancelled => "cancelled".to_string(),
        CancelOutcome::Requested => "requested".to_string(),
        CancelOutcome::AlreadyTerminal(status) => format!("already {}", status),
    };
    let job = scheduler.get(&args.principal, args.job_id).await?;
    print_json(&serde_json::json!({
        "outcome": outcome,
        "job": job,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_trigger_command_with_params() {
        let args = vec![
            "catalog-orchestrator",
            "trigger",
            "-p",
            "nightly",
            "--param",
            "region=eu",
            "--param",
            "day=2024-01-01",
            "--detach",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Trigger(args) => {
                assert_eq!(args.pipeline, "nightly");
                assert_eq!(
                    args.params,
                    vec![
                        ("region".to_string(), "eu".to_string()),
                        ("day".to_string(), "2024-01-01".to_string()),
                    ]
                );
                assert_eq!(args.triggered_by, "cli");
                assert!(!args.scheduled);
                assert!(args.detach);
            }
            _ => panic!("Expected Trigger command"),
        }
    }

    #[test]
    fn test_trigger_rejects_malformed_param() {
        let args = vec!["catalog-orchestrator", "trigger", "-p", "x", "--param", "novalue"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_runs_command_defaults() {
        let cli = Cli::try_parse_from(vec!["catalog-orchestrator", "runs"]).expect("should parse");

        match cli.command {
            Commands::Runs(args) => {
                assert!(args.pipeline.is_none());
                assert!(args.status.is_none());
                assert_eq!(args.limit, DEFAULT_LIST_LIMIT);
                assert_eq!(args.offset, 0);
            }
            _ => panic!("Expected Runs command"),
        }
    }

    #[test]
    fn test_runs_command_parses_status() {
        let cli = Cli::try_parse_from(vec!["catalog-orchestrator", "runs", "-s", "failed"])
            .expect("should parse");

        match cli.command {
            Commands::Runs(args) => assert_eq!(args.status, Some(RunStatus::Failed)),
            _ => panic!("Expected Runs command"),
        }
    }

    #[test]
    fn test_submit_query_command() {
        let args = vec![
            "catalog-orchestrator",
            "submit-query",
            "--principal",
            "alice",
            "--sql",
            "SELECT 1",
            "--request-id",
            "req-1",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::SubmitQuery(args) => {
                assert_eq!(args.principal, "alice");
                assert_eq!(args.sql, "SELECT 1");
                assert_eq!(args.request_id.as_deref(), Some("req-1"));
            }
            _ => panic!("Expected SubmitQuery command"),
        }
    }

    #[test]
    fn test_worker_command_overrides() {
        let cli = Cli::try_parse_from(vec![
            "catalog-orchestrator",
            "worker",
            "-n",
            "8",
            "--no-reaper",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.workers, Some(8));
                assert!(args.no_reaper);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_set_schedule_command() {
        let cli = Cli::try_parse_from(vec![
            "catalog-orchestrator",
            "set-schedule",
            "-p",
            "nightly",
            "0 3 * * *",
        ])
        .expect("should parse");
        match cli.command {
            Commands::SetSchedule(args) => {
                assert_eq!(args.pipeline, "nightly");
                assert_eq!(args.cron.as_deref(), Some("0 3 * * *"));
            }
            _ => panic!("Expected SetSchedule command"),
        }

        let cli = Cli::try_parse_from(vec!["catalog-orchestrator", "set-schedule", "-p", "nightly"])
            .expect("should parse");
        match cli.command {
            Commands::SetSchedule(args) => assert!(args.cron.is_none()),
            _ => panic!("Expected SetSchedule command"),
        }
    }

    #[test]
    fn test_parse_key_val_keeps_later_equals() {
        assert_eq!(
            parse_key_val("filter=a=b").unwrap(),
            ("filter".to_string(), "a=b".to_string())
        );
    }
}
