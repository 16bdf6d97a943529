//! Job definitions.
//!
//! - `Job`: a unit of work supplied by the host application
//! - `Priority`: advisory ordering tier
//! - `JobEnvelope`: serializable wrapper stored in the queue
//! - `JobRegistry`: type tag to decoder mapping used on dequeue
//! - `PersistedJob`: a dequeued job together with its identifier

pub mod envelope;
pub mod registry;

use std::fmt::{self, Debug};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use envelope::JobEnvelope;
pub use registry::JobRegistry;

/// Identifier of a job, also used as suffix for its lock and retry keys.
pub type JobId = String;

/// A unit of work executed by a worker.
///
/// Jobs are encoded into an opaque payload on enqueue and rebuilt on dequeue
/// by the decoder registered for their [`job_type`](Job::job_type) in a
/// [`JobRegistry`].
#[async_trait]
pub trait Job: Send + Sync + Debug {
    /// Tag identifying the decoder to use for this job's payload.
    fn job_type(&self) -> &str;

    /// How long the job may stay in processing before it is considered
    /// expired. `None` falls back to the queue-wide default.
    fn time_to_live(&self) -> Option<Duration> {
        None
    }

    /// Serializes the job's own state.
    fn encode(&self) -> anyhow::Result<Vec<u8>>;

    /// Executes the job. An error leaves the job in processing, where the
    /// recovery monitor reclaims it once its lock expires.
    async fn perform(&self) -> anyhow::Result<()>;
}

/// Priority tier of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// A job taken from the queue, ready to be performed.
pub struct PersistedJob {
    /// Token present in the processing list; pass it to `complete`.
    pub identifier: JobId,
    pub envelope: JobEnvelope,
    pub job: Box<dyn Job>,
}

impl Debug for PersistedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedJob")
            .field("identifier", &self.identifier)
            .field("job_type", &self.envelope.job_type)
            .field("priority", &self.envelope.priority)
            .finish()
    }
}
