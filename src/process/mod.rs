//! Periodic maintenance processes.
//!
//! A [`Process`] does one unit of maintenance per call; a [`Clock`] calls it
//! on a fixed interval until stopped. Cycles never fail: every process logs
//! its own errors and reports what it managed to do.
//!
//! - [`RecoveryMonitor`]: retries jobs whose lease expired, abandons jobs that
//!   ran out of retries
//! - [`DelayScheduler`]: promotes delayed jobs whose time has come

pub mod monitor;
pub mod scheduler;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub use monitor::{MonitorConfig, RecoveryMonitor, RecoveryReport};
pub use scheduler::{DelayScheduler, SchedulerConfig};

/// Shortest interval a [`Clock`] accepts.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// One periodic unit of work.
#[async_trait]
pub trait Process: Send + Sync {
    /// Summary of one cycle.
    type Report: Debug + Send;

    fn name(&self) -> &str;

    /// Time between the starts of two cycles.
    fn interval(&self) -> Duration;

    /// Runs one cycle. Errors are logged by the process itself.
    async fn process(&self) -> Self::Report;
}

/// Runs a [`Process`] periodically until [`stop`](Clock::stop) is called.
pub struct Clock<P: Process> {
    process: Arc<P>,
    stop: watch::Sender<bool>,
}

impl<P: Process> Clock<P> {
    pub fn new(process: P) -> Self {
        Self::from_arc(Arc::new(process))
    }

    pub fn from_arc(process: Arc<P>) -> Self {
        let (stop, _) = watch::channel(false);
        Self { process, stop }
    }

    pub fn process(&self) -> &Arc<P> {
        &self.process
    }

    /// Runs a first cycle immediately, then one per interval, until stopped.
    ///
    /// A cycle in progress when `stop` is called runs to completion.
    pub async fn run(&self) {
        let name = self.process.name().to_string();
        let period = self.process.interval().max(MIN_INTERVAL);
        let mut stop_rx = self.stop.subscribe();

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(process = %name, interval_ms = period.as_millis() as u64, "Clock started");

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
                _ = ticker.tick() => {}
            }

            let report = self.process.process().await;
            debug!(process = %name, report = ?report, "Cycle finished");
        }

        info!(process = %name, "Clock stopped");
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}
