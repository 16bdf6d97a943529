//! Prometheus metrics for queues, workers and the recovery monitor.
//!
//! # Example
//!
//! ```ignore
//! use relq::metrics::{export_metrics, init_metrics, JobOutcome, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_outcome(JobOutcome::Completed);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{JobOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};
