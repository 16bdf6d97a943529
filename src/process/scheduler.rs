//! Promotion of delayed jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::Process;
use crate::queue::JobQueue;
use crate::store::AtomicStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Periodically moves overdue delayed jobs to their pending lists.
pub struct DelayScheduler<S: AtomicStore> {
    queue: Arc<JobQueue<S>>,
    config: SchedulerConfig,
}

impl<S: AtomicStore> DelayScheduler<S> {
    pub fn new(queue: Arc<JobQueue<S>>, config: SchedulerConfig) -> Self {
        Self { queue, config }
    }

    /// Promotes overdue jobs once; returns how many were promoted.
    ///
    /// A failure is logged and reported as zero promotions; jobs promoted
    /// before it stay promoted and the rest are picked up next cycle.
    pub async fn promote(&self) -> usize {
        match self.queue.enqueue_overdue_jobs().await {
            Ok(0) => {
                debug!("No overdue delayed jobs");
                0
            }
            Ok(promoted) => {
                info!(promoted, "Promoted overdue delayed jobs");
                promoted
            }
            Err(e) => {
                error!(error = %e, "Failed to promote overdue delayed jobs");
                0
            }
        }
    }
}

#[async_trait]
impl<S: AtomicStore> Process for DelayScheduler<S> {
    type Report = usize;

    fn name(&self) -> &str {
        "delay-scheduler"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn process(&self) -> usize {
        self.promote().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config() {
        assert_eq!(SchedulerConfig::default().interval, Duration::from_secs(60));
        assert_eq!(
            SchedulerConfig::new()
                .with_interval(Duration::from_secs(2))
                .interval,
            Duration::from_secs(2)
        );
    }
}
