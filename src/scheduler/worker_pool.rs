//! Worker pool for executing query jobs.
//!
//! Each worker runs as an independent async task that claims jobs through
//! the [`QueryJobScheduler`] and executes them. A separate reaper task
//! periodically requeues jobs whose workers stopped heartbeating.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Stale job reaping
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::pipeline::config::{parse_env_bool, parse_env_value, ConfigError};

use super::job::QueryJobStatus;
use super::service::QueryJobScheduler;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The pool configuration is unusable.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// Whether this pool runs the stale job reaper.
    pub enable_reaper: bool,
    /// How often the reaper looks for expired heartbeats.
    pub reap_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            poll_interval: Duration::from_millis(500),
            enable_reaper: true,
            reap_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `WORKER_POOL_SIZE`: Number of workers (default: 4)
    /// - `WORKER_POOL_POLL_MS`: Idle poll interval (default: 500)
    /// - `WORKER_POOL_REAPER`: Run the stale job reaper (default: true)
    /// - `WORKER_POOL_REAP_INTERVAL_SECS`: Reaper interval (default: 5)
    /// - `WORKER_POOL_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown limit (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("WORKER_POOL_SIZE") {
            config.num_workers = parse_env_value(&val, "WORKER_POOL_SIZE")?;
        }

        if let Ok(val) = std::env::var("WORKER_POOL_POLL_MS") {
            let ms: u64 = parse_env_value(&val, "WORKER_POOL_POLL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("WORKER_POOL_REAPER") {
            config.enable_reaper = parse_env_bool(&val, "WORKER_POOL_REAPER")?;
        }

        if let Ok(val) = std::env::var("WORKER_POOL_REAP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "WORKER_POOL_REAP_INTERVAL_SECS")?;
            config.reap_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WORKER_POOL_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "WORKER_POOL_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enables or disables the reaper task.
    pub fn with_reaper(mut self, enabled: bool) -> Self {
        self.enable_reaper = enabled;
        self
    }

    /// Sets the reap interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.reap_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "poll and reap intervals must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a job.
    pub active_workers: usize,
    /// Attempts that ended Succeeded.
    pub jobs_succeeded: u64,
    /// Attempts that ended Failed.
    pub jobs_failed: u64,
    /// Attempts that ended Retrying.
    pub jobs_retried: u64,
    /// Attempts that ended Cancelled.
    pub jobs_cancelled: u64,
    /// Jobs taken back from silent workers by the reaper.
    pub jobs_reaped: u64,
    /// Average attempt duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the number of attempts that reached a terminal outcome.
    pub fn total_processed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed + self.jobs_cancelled
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_reaped: AtomicU64,
    attempts: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            jobs_reaped: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_outcome(&self, status: QueryJobStatus, duration: Duration) {
        // Queued or Running means another owner took the job over.
        let counter = match status {
            QueryJobStatus::Succeeded => Some(&self.jobs_succeeded),
            QueryJobStatus::Failed => Some(&self.jobs_failed),
            QueryJobStatus::Retrying => Some(&self.jobs_retried),
            QueryJobStatus::Cancelled => Some(&self.jobs_cancelled),
            QueryJobStatus::Queued | QueryJobStatus::Running => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_reaped(&self, count: u64) {
        self.jobs_reaped.fetch_add(count, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let attempts = self.attempts.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if attempts > 0 {
            Duration::from_millis(total_duration_ms / attempts)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_succeeded: self.jobs_succeeded.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::SeqCst),
            jobs_reaped: self.jobs_reaped.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers executing query jobs.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Prefix of every worker id, unique per pool instance.
    pool_id: String,
    scheduler: Arc<QueryJobScheduler>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a new, stopped worker pool.
    pub fn new(config: WorkerPoolConfig, scheduler: Arc<QueryJobScheduler>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let short_id = Uuid::new_v4().simple().to_string();

        Self {
            config,
            pool_id: format!("pool-{}", &short_id[..8]),
            scheduler,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Starts all workers, and the reaper if enabled.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.config.validate()?;

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("{}-worker-{}", self.pool_id, i),
                Arc::clone(&self.scheduler),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval,
                Arc::clone(&self.stats),
            );

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        if self.config.enable_reaper {
            let reaper = Reaper {
                scheduler: Arc::clone(&self.scheduler),
                shutdown_rx: self.shutdown_tx.subscribe(),
                interval: self.config.reap_interval,
                stats: Arc::clone(&self.stats),
            };
            self.worker_handles.push(tokio::spawn(reaper.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(
            pool_id = %self.pool_id,
            num_workers = self.config.num_workers,
            reaper = self.config.enable_reaper,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal and waits for workers to finish their current
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!(pool_id = %self.pool_id, "Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(()) => {
                info!(pool_id = %self.pool_id, "Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Scales the pool to a new number of workers.
    ///
    /// A running pool is stopped gracefully and restarted with the new size.
    pub async fn scale(&mut self, num_workers: usize) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            self.config.num_workers = num_workers;
            return Ok(());
        }

        if num_workers == self.config.num_workers {
            return Ok(());
        }

        info!(
            current = self.config.num_workers,
            target = num_workers,
            "Scaling worker pool"
        );

        self.shutdown().await?;
        self.config.num_workers = num_workers;
        self.start().await?;

        Ok(())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that claims and executes query jobs.
pub struct Worker {
    id: String,
    scheduler: Arc<QueryJobScheduler>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Wait between polls when nothing is claimable.
    poll_interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    fn new(
        id: String,
        scheduler: Arc<QueryJobScheduler>,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            scheduler,
            shutdown_rx,
            poll_interval,
            stats,
        }
    }

    /// Main worker loop.
    ///
    /// Claims and executes jobs until a shutdown signal is received. An
    /// attempt in progress always runs to completion first.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let claimed = match self.scheduler.claim_next(&self.id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to claim query job");
                    None
                }
            };

            match claimed {
                Some(job) => {
                    let job_id = job.id;
                    let start_time = Instant::now();
                    self.stats.increment_active();
                    let result = self.scheduler.execute_claimed(job, &self.id).await;
                    self.stats.decrement_active();

                    match result {
                        Ok(status) => self.stats.record_outcome(status, start_time.elapsed()),
                        Err(e) => error!(
                            worker_id = %self.id,
                            job_id = %job_id,
                            error = %e,
                            "Failed to record query job outcome"
                        ),
                    }
                }
                None => {
                    debug!(worker_id = %self.id, "No query jobs available");
                    if self.idle().await {
                        info!(worker_id = %self.id, "Worker received shutdown signal");
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Waits one poll interval. Returns true if shutdown was signalled.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            received = self.shutdown_rx.recv() => {
                !matches!(received, Err(broadcast::error::RecvError::Lagged(_)))
            }
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Background task that requeues jobs with expired heartbeats.
struct Reaper {
    scheduler: Arc<QueryJobScheduler>,
    shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Reaper {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            match self.scheduler.reap_stale().await {
                Ok(count) => self.stats.record_reaped(count),
                Err(e) => error!(error = %e, "Failed to reap stale query jobs"),
            }
        }
        debug!("Reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert!(config.enable_reaper);
        assert_eq!(config.reap_interval, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_poll_interval(Duration::from_millis(50))
            .with_reaper(false)
            .with_reap_interval(Duration::from_secs(1))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert!(!config.enable_reaper);
        assert_eq!(config.reap_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_rejects_zero_workers() {
        assert!(matches!(
            WorkerPoolConfig::new(0).validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.num_workers, 0);
        assert_eq!(stats.total_processed(), 0);
        assert_eq!(stats.average_job_duration, Duration::ZERO);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            jobs_succeeded: 75,
            jobs_failed: 20,
            jobs_cancelled: 5,
            jobs_retried: 10,
            ..Default::default()
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_outcome(QueryJobStatus::Succeeded, Duration::from_secs(10));
        stats.record_outcome(QueryJobStatus::Retrying, Duration::from_secs(20));
        stats.record_outcome(QueryJobStatus::Failed, Duration::from_secs(5));
        stats.record_reaped(2);

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_succeeded, 1);
        assert_eq!(pool_stats.jobs_retried, 1);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert_eq!(pool_stats.jobs_reaped, 2);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
