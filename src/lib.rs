//! relq: reliable, priority-aware job queue on an atomic list store.
//!
//! This library provides a Redis-backed (or in-process) job queue with
//! leases and retries, a worker pool, and the periodic processes that keep
//! the queue healthy.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod process;
pub mod queue;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use config::RelqConfig;
pub use error::{ConfigError, PoolError, QueueError, StoreError};
pub use job::{Job, JobEnvelope, JobId, JobRegistry, PersistedJob, Priority};
pub use process::{Clock, DelayScheduler, MonitorConfig, Process, RecoveryMonitor, SchedulerConfig};
pub use queue::{JobQueue, MemoryQueue, Queue, QueueConfig, QueueStats};
pub use store::{AtomicStore, MemoryStore, RedisStore, Transaction};
pub use worker::{PoolStats, Worker, WorkerConfig};
