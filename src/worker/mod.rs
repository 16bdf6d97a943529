//! Worker pool executing jobs from a [`Queue`].
//!
//! A [`Worker`] runs `max_concurrent_jobs` independent units, each a tokio
//! task with its own loop:
//!
//! 1. check the stop flag
//! 2. take a job (blocking or polling, see [`WorkerConfig`])
//! 3. run `perform`, then `complete` on success
//!
//! Every failure inside an iteration (decode, perform, complete, even a
//! panic in any of them) is logged and the loop goes on. A failed job is left
//! in processing; the recovery monitor retries it once its lease expires.
//!
//! Since each unit runs at most one job at a time, the number of jobs inside
//! `perform` never exceeds `max_concurrent_jobs`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use rand::RngExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::job::PersistedJob;
use crate::metrics::{JobOutcome, MetricsCollector};
use crate::queue::{Queue, DEFAULT_BLOCK_TIMEOUT};

/// Configuration for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of execution units, i.e. the maximum number of jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// Zero means units block on the queue. Otherwise units use non-blocking
    /// dequeue and sleep a random time in `[0, average_polling_interval]`
    /// after every poll.
    pub average_polling_interval: Duration,
    /// Upper bound of one blocking wait; a stop request is noticed within it.
    pub block_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            average_polling_interval: Duration::ZERO,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration with `max_concurrent_jobs` units (at least one).
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            ..Default::default()
        }
    }

    pub fn with_average_polling_interval(mut self, interval: Duration) -> Self {
        self.average_polling_interval = interval;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn is_polling(&self) -> bool {
        !self.average_polling_interval.is_zero()
    }
}

/// Statistics about a worker pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    /// Number of execution units.
    pub num_units: usize,
    /// Jobs currently inside `perform`.
    pub active_jobs: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_jobs: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_jobs: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_units: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_jobs.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_units,
            active_jobs: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// State shared between the pool handle and its units.
struct Shared {
    stop: watch::Sender<bool>,
    live_units: watch::Sender<usize>,
    stats: SharedPoolStats,
    metrics: MetricsCollector,
}

/// Pool of execution units pulling jobs from a shared queue.
///
/// Once stopped, a worker stays stopped: a later `run` returns immediately.
/// Build a new `Worker` to start again.
pub struct Worker {
    queue: Arc<dyn Queue>,
    config: WorkerConfig,
    shared: Arc<Shared>,
    is_running: AtomicBool,
}

impl Worker {
    pub fn new(queue: Arc<dyn Queue>, config: WorkerConfig) -> Self {
        let config = WorkerConfig {
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            ..config
        };
        let (stop, _) = watch::channel(false);
        let (live_units, _) = watch::channel(0);

        Self {
            queue,
            config,
            shared: Arc::new(Shared {
                stop,
                live_units,
                stats: SharedPoolStats::new(),
                metrics: MetricsCollector::new(),
            }),
            is_running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Spawns the execution units and waits until all of them have exited.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if this worker is already running.
    pub async fn run(&self) -> Result<(), PoolError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        info!(
            units = self.config.max_concurrent_jobs,
            polling = self.config.is_polling(),
            "Worker pool started"
        );

        let handles: Vec<_> = (0..self.config.max_concurrent_jobs)
            .map(|i| {
                let unit = Unit {
                    id: format!("worker-{}", i),
                    queue: Arc::clone(&self.queue),
                    config: self.config.clone(),
                    stop_rx: self.shared.stop.subscribe(),
                    shared: Arc::clone(&self.shared),
                    _live: LiveUnit::enter(&self.shared),
                };
                tokio::spawn(unit.run())
            })
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker unit task failed");
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Worker pool stopped");
        Ok(())
    }

    /// Asks every unit to exit after its current iteration.
    ///
    /// With `wait_until_finished`, also waits until all units have exited.
    /// A job already inside `perform` is never interrupted.
    pub async fn stop(&self, wait_until_finished: bool) {
        info!(wait_until_finished, "Stopping worker pool");
        self.shared.stop.send_replace(true);

        if wait_until_finished {
            let mut live_units = self.shared.live_units.subscribe();
            // The sender lives in `self.shared`, so this cannot fail.
            let _ = live_units.wait_for(|n| *n == 0).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.shared
            .stats
            .to_pool_stats(self.config.max_concurrent_jobs)
    }
}

/// Counts a unit as live from spawn until it is dropped, however it ends.
struct LiveUnit(Arc<Shared>);

impl LiveUnit {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.live_units.send_modify(|n| *n += 1);
        Self(Arc::clone(shared))
    }
}

impl Drop for LiveUnit {
    fn drop(&mut self) {
        self.0.live_units.send_modify(|n| *n -= 1);
    }
}

/// One execution unit.
struct Unit {
    id: String,
    queue: Arc<dyn Queue>,
    config: WorkerConfig,
    stop_rx: watch::Receiver<bool>,
    shared: Arc<Shared>,
    _live: LiveUnit,
}

impl Unit {
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker unit started");

        while !self.stopped() {
            // Host code runs inside dequeue too (job decoders), not only in perform.
            if let Err(panic) = AssertUnwindSafe(self.iterate()).catch_unwind().await {
                error!(
                    worker_id = %self.id,
                    panic = %panic_message(panic.as_ref()),
                    "Worker iteration panicked"
                );
                let backoff = self.config.block_timeout;
                self.pause(backoff).await;
            }
        }

        debug!(worker_id = %self.id, "Worker unit stopped");
    }

    async fn iterate(&mut self) {
        if self.config.is_polling() {
            self.poll_once().await;
            let delay = polling_delay(self.config.average_polling_interval);
            self.pause(delay).await;
        } else {
            self.block_once().await;
        }
    }

    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn poll_once(&self) {
        match self.queue.dequeue().await {
            Ok(Some(job)) => self.execute(job).await,
            Ok(None) => {}
            Err(e) => {
                error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
            }
        }
    }

    async fn block_once(&mut self) {
        match self.queue.bdequeue_timeout(self.config.block_timeout).await {
            Ok(Some(job)) => self.execute(job).await,
            Ok(None) => {}
            Err(e) => {
                error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                // Keep a failing store from turning this loop into a spin.
                let backoff = self.config.block_timeout;
                self.pause(backoff).await;
            }
        }
    }

    /// Sleeps for `duration`, returning early once a stop is requested.
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop_rx.wait_for(|stopped| *stopped) => {}
        }
    }

    async fn execute(&self, persisted: PersistedJob) {
        let PersistedJob {
            identifier,
            envelope,
            job,
        } = persisted;
        let started = Instant::now();

        debug!(
            worker_id = %self.id,
            job_id = %identifier,
            job_type = %envelope.job_type,
            "Performing job"
        );

        self.shared.stats.increment_active();
        self.shared.metrics.inc_active_jobs();
        let result = AssertUnwindSafe(job.perform()).catch_unwind().await;
        self.shared.stats.decrement_active();
        self.shared.metrics.dec_active_jobs();

        let duration = started.elapsed();
        self.shared
            .metrics
            .record_duration(&envelope.job_type, duration);

        match result {
            Ok(Ok(())) => match self.queue.complete(&identifier).await {
                Ok(()) => {
                    self.shared.stats.record_completion(duration);
                    self.shared.metrics.record_outcome(JobOutcome::Completed);
                    info!(
                        worker_id = %self.id,
                        job_id = %identifier,
                        job_type = %envelope.job_type,
                        duration_ms = duration.as_millis() as u64,
                        "Job completed"
                    );
                }
                Err(e) => {
                    self.shared.stats.record_failure(duration);
                    self.shared.metrics.record_outcome(JobOutcome::Failed);
                    error!(
                        worker_id = %self.id,
                        job_id = %identifier,
                        error = %e,
                        "Job performed but could not be marked complete"
                    );
                }
            },
            Ok(Err(e)) => {
                self.shared.stats.record_failure(duration);
                self.shared.metrics.record_outcome(JobOutcome::Failed);
                warn!(
                    worker_id = %self.id,
                    job_id = %identifier,
                    job_type = %envelope.job_type,
                    error = %e,
                    "Job failed, leaving it for recovery"
                );
            }
            Err(panic) => {
                self.shared.stats.record_failure(duration);
                self.shared.metrics.record_outcome(JobOutcome::Failed);
                error!(
                    worker_id = %self.id,
                    job_id = %identifier,
                    job_type = %envelope.job_type,
                    panic = %panic_message(panic.as_ref()),
                    "Job panicked, leaving it for recovery"
                );
            }
        }
    }
}

/// Uniform random delay in `[0, average]`.
fn polling_delay(average: Duration) -> Duration {
    let max_millis = average.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=max_millis))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();

        assert_eq!(config.max_concurrent_jobs, 10);
        assert_eq!(config.average_polling_interval, Duration::ZERO);
        assert_eq!(config.block_timeout, Duration::from_secs(1));
        assert!(!config.is_polling());
    }

    #[test]
    fn test_worker_config_builder_and_floor() {
        let config = WorkerConfig::new(0)
            .with_average_polling_interval(Duration::from_millis(250))
            .with_block_timeout(Duration::from_millis(100));

        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.average_polling_interval, Duration::from_millis(250));
        assert_eq!(config.block_timeout, Duration::from_millis(100));
        assert!(config.is_polling());
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_units: 4,
            active_jobs: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));
        stats.increment_active();
        stats.increment_active();
        stats.decrement_active();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_units, 4);
        assert_eq!(pool_stats.active_jobs, 1);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        // (10000 + 20000 + 5000) / 3 = 11666 ms
        assert_eq!(pool_stats.average_job_duration, Duration::from_millis(11666));
    }

    #[test]
    fn test_live_unit_counts_until_dropped() {
        let (stop, _) = watch::channel(false);
        let (live_units, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            stop,
            live_units,
            stats: SharedPoolStats::new(),
            metrics: MetricsCollector::new(),
        });

        let first = LiveUnit::enter(&shared);
        let second = LiveUnit::enter(&shared);
        assert_eq!(*shared.live_units.borrow(), 2);

        drop(first);
        assert_eq!(*shared.live_units.borrow(), 1);

        // Unwinding drops the guard as well.
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let _held = second;
            panic!("unit died");
        }));
        assert!(result.is_err());
        assert_eq!(*shared.live_units.borrow(), 0);
    }

    #[test]
    fn test_polling_delay_bounds() {
        let average = Duration::from_millis(20);
        for _ in 0..100 {
            assert!(polling_delay(average) <= average);
        }
        assert_eq!(polling_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
