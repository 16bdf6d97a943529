//! Job envelope: the record actually stored in the queue.
//!
//! Wire format (JSON object):
//!
//! | field         | type                       |
//! |---------------|----------------------------|
//! | `identifier`  | string                     |
//! | `createdAt`   | number, epoch seconds      |
//! | `type`        | string                     |
//! | `timeToLive`  | number, seconds            |
//! | `priority`    | `"high"`/`"medium"`/`"low"`|
//! | `job`         | string, encoded payload    |
//! | `scheduledAt` | number, epoch seconds; only present for delayed jobs |

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Job, JobId, Priority};
use crate::error::QueueError;

/// Immutable wrapper around an encoded job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub identifier: JobId,
    #[serde(with = "epoch_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(with = "duration_seconds")]
    pub time_to_live: Duration,
    pub priority: Priority,
    #[serde(rename = "job")]
    pub payload: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_epoch_seconds"
    )]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl JobEnvelope {
    /// Wraps `job`, generating a fresh identifier.
    ///
    /// `default_ttl` applies when the job does not declare its own
    /// time-to-live. Timestamps are kept at microsecond precision so they
    /// survive the numeric wire format unchanged.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Encoding` if the job cannot be serialized or its
    /// payload is not valid UTF-8.
    pub fn new(
        job: &dyn Job,
        priority: Priority,
        default_ttl: Duration,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Self, QueueError> {
        let bytes = job
            .encode()
            .map_err(|e| QueueError::Encoding(e.to_string()))?;
        let payload = String::from_utf8(bytes)
            .map_err(|_| QueueError::Encoding("payload is not valid UTF-8".to_string()))?;

        Ok(Self {
            identifier: Uuid::new_v4().to_string(),
            created_at: Utc::now().trunc_subsecs(6),
            job_type: job.job_type().to_string(),
            time_to_live: job.time_to_live().unwrap_or(default_ttl),
            priority,
            payload,
            scheduled_at: scheduled_at.map(|at| at.trunc_subsecs(6)),
        })
    }

    /// Payload bytes as handed to the job's decoder.
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Whether the job may run at `now` (always true for immediate jobs).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Encoding(e.to_string()))
    }

    pub fn decode(data: &str) -> Result<Self, QueueError> {
        serde_json::from_str(data).map_err(|e| QueueError::Decoding(e.to_string()))
    }
}

fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

fn to_epoch_seconds(at: &DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

mod epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(super::to_epoch_seconds(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        super::from_epoch_seconds(secs)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp {}", secs)))
    }
}

mod optional_epoch_seconds {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        at: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match at {
            Some(at) => serializer.serialize_some(&super::to_epoch_seconds(at)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => super::from_epoch_seconds(secs)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp {}", secs))),
            None => Ok(None),
        }
    }
}

mod duration_seconds {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(ttl.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(de::Error::custom(format!("invalid time-to-live {}", secs)));
        }
        Ok(Duration::from_millis((secs * 1000.0).round() as u64))
    }
}
