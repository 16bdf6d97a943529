//! Queue contract and its implementations.
//!
//! - **JobQueue**: reliable queue over an [`AtomicStore`](crate::store::AtomicStore)
//!   (pending/processing/delayed lists, leases, retry counters)
//! - **MemoryQueue**: self-contained in-process queue with strict priority
//!   ordering, for tests and standalone use
//!
//! # Job lifecycle
//!
//! ```text
//!   enqueue ──► pending ──dequeue──► processing ──complete──► (deleted)
//!                 ▲                      │
//!   delayed ──────┤ promote              │ lock expired
//!                 └───────── retry ◄─────┘  (abandoned after max attempts)
//! ```

pub mod engine;
pub mod keys;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::job::{Job, JobId, PersistedJob, Priority};

pub use engine::JobQueue;
pub use keys::QueueKey;
pub use memory::MemoryQueue;

/// Default time a job may stay in processing before it is considered expired.
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(3600);

/// Default upper bound of a single blocking wait on the store.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Operations every queue offers to producers and workers.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Encodes `job` and makes it available for dequeue.
    ///
    /// Jobs with a `schedule_at` go to the delayed list and become pending
    /// once the scheduled time has passed.
    async fn enqueue(
        &self,
        job: &dyn Job,
        priority: Priority,
        schedule_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, QueueError>;

    /// Takes one job if any is available, without waiting.
    async fn dequeue(&self) -> Result<Option<PersistedJob>, QueueError>;

    /// Waits at most `timeout` for a job.
    async fn bdequeue_timeout(&self, timeout: Duration)
        -> Result<Option<PersistedJob>, QueueError>;

    /// Waits until a job is available.
    async fn bdequeue(&self) -> Result<PersistedJob, QueueError> {
        loop {
            if let Some(job) = self.bdequeue_timeout(DEFAULT_BLOCK_TIMEOUT).await? {
                return Ok(job);
            }
        }
    }

    /// Marks the job as done and removes every trace of it.
    async fn complete(&self, identifier: &str) -> Result<(), QueueError>;
}

/// Configuration shared by queue implementations.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Time-to-live for jobs that do not declare their own.
    pub default_time_to_live: Duration,
    /// Upper bound of one blocking wait on the store; lower tiers are
    /// re-checked at least this often while blocked.
    pub block_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_time_to_live: DEFAULT_TIME_TO_LIVE,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_time_to_live(mut self, ttl: Duration) -> Self {
        self.default_time_to_live = ttl;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending_high: usize,
    pub pending_medium: usize,
    pub pending_low: usize,
    pub processing: usize,
    pub delayed: usize,
}

impl QueueStats {
    pub fn pending(&self) -> usize {
        self.pending_high + self.pending_medium + self.pending_low
    }

    /// Returns the total number of jobs in all lists.
    pub fn total_jobs(&self) -> usize {
        self.pending() + self.processing + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::new()
            .with_default_time_to_live(Duration::from_secs(30))
            .with_block_timeout(Duration::from_millis(200));

        assert_eq!(config.default_time_to_live, Duration::from_secs(30));
        assert_eq!(config.block_timeout, Duration::from_millis(200));
        assert_eq!(QueueConfig::default().default_time_to_live, Duration::from_secs(3600));
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            pending_high: 1,
            pending_medium: 2,
            pending_low: 3,
            processing: 4,
            delayed: 5,
        };

        assert_eq!(stats.pending(), 6);
        assert_eq!(stats.total_jobs(), 15);
    }
}
