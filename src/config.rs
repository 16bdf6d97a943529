//! File-based configuration.
//!
//! A single YAML document configures the store connection, queue defaults
//! and the periodic processes. Every field has a default, so partial files
//! (or no file at all) are valid:
//!
//! ```yaml
//! redis_url: redis://localhost:6379
//! default_time_to_live_secs: 3600
//! block_timeout_secs: 1
//! worker:
//!   max_concurrent_jobs: 10
//!   average_polling_interval_ms: 0
//! monitor:
//!   interval_secs: 300
//!   max_retry_attempts: 5
//! scheduler:
//!   interval_secs: 60
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::process::{MonitorConfig, SchedulerConfig};
use crate::queue::QueueConfig;
use crate::worker::WorkerConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelqConfig {
    pub redis_url: String,
    pub default_time_to_live_secs: u64,
    pub block_timeout_secs: u64,
    pub worker: WorkerSection,
    pub monitor: MonitorSection,
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub max_concurrent_jobs: usize,
    /// 0 selects blocking dequeue.
    pub average_polling_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_secs: u64,
    pub max_retry_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub interval_secs: u64,
}

impl Default for RelqConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            default_time_to_live_secs: 3600,
            block_timeout_secs: 1,
            worker: WorkerSection::default(),
            monitor: MonitorSection::default(),
            scheduler: SchedulerSection::default(),
        }
    }
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            average_polling_interval_ms: 0,
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_retry_attempts: 5,
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl RelqConfig {
    /// Loads and validates a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, is not valid YAML,
    /// or fails [`validate`](Self::validate).
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that cannot work at all.
    ///
    /// Zero workers or zero retry attempts are not errors; they are raised
    /// to one when the runtime configs are built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::Invalid("redis_url cannot be empty".to_string()));
        }

        if self.block_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "block_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.monitor.interval_secs == 0 || self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "process intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new()
            .with_default_time_to_live(Duration::from_secs(self.default_time_to_live_secs))
            .with_block_timeout(Duration::from_secs(self.block_timeout_secs))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.worker.max_concurrent_jobs)
            .with_average_polling_interval(Duration::from_millis(
                self.worker.average_polling_interval_ms,
            ))
            .with_block_timeout(Duration::from_secs(self.block_timeout_secs))
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig::new()
            .with_interval(Duration::from_secs(self.monitor.interval_secs))
            .with_max_retry_attempts(self.monitor.max_retry_attempts)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new().with_interval(Duration::from_secs(self.scheduler.interval_secs))
    }
}
