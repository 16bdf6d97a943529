//! Error types for relq operations.
//!
//! Two layers are distinguished:
//! - `StoreError`: the atomic store could not execute a command or batch
//! - `QueueError`: everything the queue engine surfaces to its callers
//!
//! Job-level failures (from `Job::perform`, `Job::encode` or a registered
//! decoder) are plain `anyhow::Error` values owned by the host application.

use thiserror::Error;

/// Errors raised by an [`AtomicStore`](crate::store::AtomicStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store connection failed: {0}")]
    Connection(String),

    /// A multi-command batch was rejected; none of its commands took effect.
    #[error("Transaction aborted, no command was applied")]
    TransactionAborted,

    #[error("Key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    #[error("Value stored at '{key}' is not an integer")]
    NotAnInteger { key: String },
}

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Failed to encode job: {0}")]
    Encoding(String),

    #[error("Failed to decode job: {0}")]
    Decoding(String),

    #[error("Unknown job type '{0}'")]
    UnknownJobType(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    /// The store rejected an atomic batch; the caller may assume no partial effect.
    #[error("Transaction aborted, no command was applied")]
    TransactionAborted,

    #[error("Job {0} not found")]
    JobNotFound(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TransactionAborted => QueueError::TransactionAborted,
            other => QueueError::Store(other),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Decoding(err.to_string())
    }
}

/// Errors raised by the worker pool lifecycle.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker is already running")]
    AlreadyRunning,
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
