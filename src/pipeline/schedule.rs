//! Cron-scheduled pipeline triggers.
//!
//! The [`CronScheduler`] keeps one entry per unpaused pipeline that has a
//! `schedule_cron`, fires a Scheduled trigger through the coordinator when an
//! entry comes due, and reloads its entries from storage periodically so that
//! new, changed, paused and deleted schedules are picked up.
//!
//! Expressions use the usual five fields (minute, hour, day of month, month,
//! day of week). A six-field form with a leading seconds field is accepted
//! as well.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, ValidationError};
use crate::storage::Storage;

use super::config::{parse_env_value, ConfigError};
use super::coordinator::RunCoordinator;
use super::types::TriggerType;

/// Principal recorded on runs started by the scheduler.
pub const SCHEDULER_PRINCIPAL: &str = "scheduler";

/// Parses a cron expression, rejecting anything the scheduler could not
/// fire.
pub fn parse_schedule(expression: &str) -> Result<Schedule, ValidationError> {
    let fields = expression.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expression.trim()),
        6 => expression.trim().to_string(),
        _ => {
            return Err(ValidationError::InvalidInput(format!(
                "invalid schedule '{}': expected 5 fields, got {}",
                expression, fields
            )))
        }
    };
    let schedule = Schedule::from_str(&normalized).map_err(|e| {
        ValidationError::InvalidInput(format!("invalid schedule '{}': {}", expression, e))
    })?;
    if schedule.upcoming(Utc).next().is_none() {
        return Err(ValidationError::InvalidInput(format!(
            "schedule '{}' never fires",
            expression
        )));
    }
    Ok(schedule)
}

/// Configuration for the cron scheduler.
#[derive(Debug, Clone)]
pub struct CronSchedulerConfig {
    /// How often due entries are checked.
    pub tick_interval: Duration,
    /// How often entries are reloaded from storage.
    pub reload_interval: Duration,
}

impl Default for CronSchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            reload_interval: Duration::from_secs(60),
        }
    }
}

impl CronSchedulerConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_SCHEDULER_TICK_MS`: Due check interval (default: 1000)
    /// - `PIPELINE_SCHEDULER_RELOAD_SECS`: Reload interval (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PIPELINE_SCHEDULER_TICK_MS") {
            let ms: u64 = parse_env_value(&val, "PIPELINE_SCHEDULER_TICK_MS")?;
            config.tick_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("PIPELINE_SCHEDULER_RELOAD_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_SCHEDULER_RELOAD_SECS")?;
            config.reload_interval = Duration::from_secs(secs);
        }

        if config.tick_interval.is_zero() || config.reload_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "scheduler intervals must be greater than 0".to_string(),
            ));
        }
        Ok(config)
    }
}

#[derive(Debug)]
struct ScheduleEntry {
    pipeline_name: String,
    expression: String,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
}

/// Fires Scheduled triggers for pipelines with a cron schedule.
pub struct CronScheduler {
    store: Arc<dyn Storage>,
    coordinator: Arc<RunCoordinator>,
    config: CronSchedulerConfig,
    entries: RwLock<HashMap<Uuid, ScheduleEntry>>,
}

impl CronScheduler {
    pub fn new(
        store: Arc<dyn Storage>,
        coordinator: Arc<RunCoordinator>,
        config: CronSchedulerConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the entries with the current set of scheduled, unpaused
    /// pipelines and returns how many were loaded. Entries whose expression
    /// did not change keep their next fire time. Invalid expressions are
    /// logged and skipped.
    pub async fn reload(&self) -> Result<usize, OrchestratorError> {
        let pipelines = self.store.list_pipelines().await?;
        let now = Utc::now();

        let mut entries = self.entries.write().await;
        let mut previous = std::mem::take(&mut *entries);

        for pipeline in pipelines.into_iter().filter(|p| !p.is_paused) {
            let Some(expression) = pipeline.schedule_cron else {
                continue;
            };

            if let Some(kept) = previous
                .remove(&pipeline.id)
                .filter(|e| e.expression == expression)
            {
                entries.insert(pipeline.id, kept);
                continue;
            }

            let schedule = match parse_schedule(&expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!(
                        pipeline = %pipeline.name,
                        schedule = %expression,
                        error = %e,
                        "Skipping pipeline with invalid schedule"
                    );
                    continue;
                }
            };
            let Some(next_fire) = schedule.after(&now).next() else {
                continue;
            };
            debug!(pipeline = %pipeline.name, next_fire = %next_fire, "Schedule registered");
            entries.insert(
                pipeline.id,
                ScheduleEntry {
                    pipeline_name: pipeline.name,
                    expression,
                    schedule,
                    next_fire,
                },
            );
        }

        info!(count = entries.len(), "Pipeline schedules loaded");
        Ok(entries.len())
    }

    /// Pipelines currently scheduled, with their next fire time.
    pub async fn scheduled(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        let mut scheduled: Vec<_> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.next_fire))
            .collect();
        scheduled.sort_by_key(|(_, next_fire)| *next_fire);
        scheduled
    }

    /// Triggers every entry due at `now` and moves it to its next fire time.
    /// A missed window fires once, not once per missed occurrence. Returns
    /// the ids of the runs started.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let due: Vec<(Uuid, String)> = {
            let mut entries = self.entries.write().await;
            let mut due = Vec::new();
            let mut exhausted = Vec::new();
            for (id, entry) in entries.iter_mut().filter(|(_, e)| e.next_fire <= now) {
                due.push((*id, entry.pipeline_name.clone()));
                match entry.schedule.after(&now).next() {
                    Some(next_fire) => entry.next_fire = next_fire,
                    None => exhausted.push(*id),
                }
            }
            for id in exhausted {
                entries.remove(&id);
            }
            due
        };

        let mut started = Vec::new();
        for (pipeline_id, name) in due {
            match self
                .coordinator
                .trigger(
                    pipeline_id,
                    TriggerType::Scheduled,
                    SCHEDULER_PRINCIPAL,
                    HashMap::new(),
                )
                .await
            {
                Ok(run) => {
                    info!(pipeline = %name, run_id = %run.id, "Scheduled run triggered");
                    started.push(run.id);
                }
                Err(OrchestratorError::ConcurrencyLimit { active, limit, .. }) => {
                    warn!(
                        pipeline = %name,
                        active = active,
                        limit = limit,
                        "Skipping scheduled run, concurrency limit reached"
                    );
                }
                Err(e) => {
                    warn!(pipeline = %name, error = %e, "Scheduled trigger failed");
                }
            }
        }
        started
    }

    /// Loads the schedules, then fires due entries and reloads periodically
    /// until `shutdown` is cancelled. A failing initial load is returned;
    /// later reload failures are logged and the previous entries kept.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), OrchestratorError> {
        self.reload().await?;

        let mut tick = tokio::time::interval(self.config.tick_interval);
        let mut reload = tokio::time::interval(self.config.reload_interval);
        // The first reload tick completes immediately.
        reload.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.fire_due(Utc::now()).await;
                }
                _ = reload.tick() => {
                    if let Err(e) = self.reload().await {
                        error!(error = %e, "Failed to reload pipeline schedules");
                    }
                }
            }
        }

        info!("Pipeline scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_five_field_schedule() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let base = DateTime::parse_from_rfc3339("2024-01-01T10:02:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.after(&base).next().unwrap();
        assert_eq!(next.to_rfc3339(), "2024-01-01T10:05:00+00:00");
    }

    #[test]
    fn test_parse_six_field_schedule() {
        assert!(parse_schedule("30 0 3 * * *").is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_schedule("not a cron").is_err());
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = CronSchedulerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.reload_interval, Duration::from_secs(60));
    }
}
