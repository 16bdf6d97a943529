//! Recovery of jobs whose worker went away.
//!
//! Every cycle scans the processing list. For each identifier:
//!
//! - retry counter at the limit: the job is abandoned (completed without success)
//! - lease expired: the job goes back to pending and its retry counter grows
//! - lease alive: the job is left alone
//!
//! Problems with one identifier are logged and the scan moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::Process;
use crate::error::QueueError;
use crate::metrics::{JobOutcome, MetricsCollector};
use crate::queue::{JobQueue, Queue};
use crate::store::AtomicStore;

/// Configuration for the [`RecoveryMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Retries allowed before a job is abandoned; at least one.
    pub max_retry_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_retry_attempts: 5,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts.max(1);
        self
    }
}

/// Outcome of one recovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Identifiers found in the processing list.
    pub scanned: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Identifiers that could not be handled, plus one if the processing
    /// list itself could not be read.
    pub errors: usize,
}

enum Recovery {
    Retried,
    Abandoned { attempts: i64 },
    /// Lease alive, or the job left processing meanwhile.
    Untouched,
}

/// Periodically retries expired jobs and abandons exhausted ones.
pub struct RecoveryMonitor<S: AtomicStore> {
    queue: Arc<JobQueue<S>>,
    config: MonitorConfig,
    metrics: MetricsCollector,
}

impl<S: AtomicStore> RecoveryMonitor<S> {
    pub fn new(queue: Arc<JobQueue<S>>, config: MonitorConfig) -> Self {
        let config = MonitorConfig {
            max_retry_attempts: config.max_retry_attempts.max(1),
            ..config
        };
        Self {
            queue,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Scans the processing list once.
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        let processing = match self.queue.processing_jobs().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list processing jobs, skipping cycle");
                report.errors = 1;
                return report;
            }
        };

        report.scanned = processing.len();
        debug!(count = report.scanned, "Scanning processing jobs");

        for identifier in &processing {
            match self.recover_job(identifier).await {
                Ok(Recovery::Retried) => {
                    report.retried += 1;
                    self.metrics.record_outcome(JobOutcome::Retried);
                    info!(job_id = %identifier, "Expired job re-enqueued");
                }
                Ok(Recovery::Abandoned { attempts }) => {
                    report.abandoned += 1;
                    self.metrics.record_outcome(JobOutcome::Abandoned);
                    warn!(
                        job_id = %identifier,
                        attempts,
                        max_attempts = self.config.max_retry_attempts,
                        "Job abandoned after too many retries"
                    );
                }
                Ok(Recovery::Untouched) => {
                    debug!(job_id = %identifier, "Job still leased or already gone");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(job_id = %identifier, error = %e, "Failed to recover job");
                }
            }
        }

        if report.retried > 0 || report.abandoned > 0 {
            info!(
                scanned = report.scanned,
                retried = report.retried,
                abandoned = report.abandoned,
                "Recovery cycle finished"
            );
        }

        report
    }

    async fn recover_job(&self, identifier: &str) -> Result<Recovery, QueueError> {
        let attempts = self.queue.retry_attempts(identifier).await?;
        if attempts >= i64::from(self.config.max_retry_attempts) {
            self.queue.complete(identifier).await?;
            return Ok(Recovery::Abandoned { attempts });
        }

        if self.queue.retry_job_if_expired(identifier).await? {
            Ok(Recovery::Retried)
        } else {
            Ok(Recovery::Untouched)
        }
    }
}

#[async_trait]
impl<S: AtomicStore> Process for RecoveryMonitor<S> {
    type Report = RecoveryReport;

    fn name(&self) -> &str {
        "recovery-monitor"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn process(&self) -> RecoveryReport {
        self.recover().await
    }
}
