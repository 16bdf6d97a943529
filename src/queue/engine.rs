//! Reliable job queue over an atomic store.
//!
//! # Store layout
//!
//! - `queue:pending:{high,medium,low}`: identifiers waiting to run, one list per tier
//! - `queue:processing`: identifiers leased to a worker
//! - `queue:delayed`: identifiers scheduled for later
//! - `job:<id>`: encoded envelope
//! - `lock:<id>`: lease with TTL = the job's time-to-live
//! - `retry:<id>`: number of expiry-triggered retries
//!
//! # Reliability
//!
//! Jobs are atomically moved from a pending list to the processing list when
//! dequeued (RPOPLPUSH). If a worker crashes, the identifier stays in
//! processing; once its lease expires the recovery monitor moves it back.
//! An identifier is only ever moved between lists by single atomic commands
//! or transactions, so it is never in two lists at once. Moves out of
//! processing and delayed only happen while the identifier is still there,
//! so a job completed or promoted concurrently is never pushed back.
//!
//! # Priority
//!
//! Each tier has its own pending list and dequeue checks high, medium, low in
//! that order. A blocking dequeue parks on the high list and re-checks the
//! lower tiers every `block_timeout`, so a medium or low job that arrives
//! while all workers are blocked waits at most that long.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Queue, QueueConfig, QueueKey, QueueStats};
use crate::error::QueueError;
use crate::job::{Job, JobEnvelope, JobId, JobRegistry, PersistedJob, Priority};
use crate::store::{AtomicStore, RedisStore, Transaction};

/// Store-backed reliable queue.
pub struct JobQueue<S: AtomicStore> {
    store: Arc<S>,
    registry: Arc<JobRegistry>,
    config: QueueConfig,
}

impl JobQueue<RedisStore> {
    /// Connects to Redis and creates a queue on top of it.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Store` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        registry: Arc<JobRegistry>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let store = RedisStore::connect(redis_url).await?;
        Ok(Self::new(Arc::new(store), registry, config))
    }
}

impl<S: AtomicStore> JobQueue<S> {
    pub fn new(store: Arc<S>, registry: Arc<JobRegistry>, config: QueueConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Identifiers waiting in the pending lists, highest tier first.
    pub async fn pending_jobs(&self) -> Result<Vec<JobId>, QueueError> {
        let mut jobs = Vec::new();
        for priority in Priority::ALL {
            jobs.extend(self.pending_jobs_with_priority(priority).await?);
        }
        Ok(jobs)
    }

    pub async fn pending_jobs_with_priority(
        &self,
        priority: Priority,
    ) -> Result<Vec<JobId>, QueueError> {
        self.list(QueueKey::Pending(priority)).await
    }

    pub async fn processing_jobs(&self) -> Result<Vec<JobId>, QueueError> {
        self.list(QueueKey::Processing).await
    }

    pub async fn delayed_jobs(&self) -> Result<Vec<JobId>, QueueError> {
        self.list(QueueKey::Delayed).await
    }

    /// Envelope stored for `identifier`, if the record still exists.
    pub async fn job_envelope(&self, identifier: &str) -> Result<Option<JobEnvelope>, QueueError> {
        match self.store.get(&QueueKey::Job(identifier).to_string()).await? {
            Some(encoded) => JobEnvelope::decode(&encoded).map(Some),
            None => Ok(None),
        }
    }

    /// True iff the lease for `identifier` is absent (never set or elapsed).
    pub async fn is_job_expired(&self, identifier: &str) -> Result<bool, QueueError> {
        let lock = self
            .store
            .get(&QueueKey::Lock(identifier).to_string())
            .await?;
        Ok(lock.is_none())
    }

    /// Number of expiry-triggered retries so far, 0 if none.
    pub async fn retry_attempts(&self, identifier: &str) -> Result<i64, QueueError> {
        let key = QueueKey::Retry(identifier).to_string();
        match self.store.get(&key).await? {
            Some(value) => value.parse::<i64>().map_err(|_| {
                QueueError::Decoding(format!("retry counter '{}' is not an integer", key))
            }),
            None => Ok(0),
        }
    }

    /// Moves an expired job back to pending and bumps its retry counter.
    ///
    /// Returns `false` without touching anything while the lease is alive,
    /// or when the identifier has already left processing (completed, or
    /// retried by someone else).
    pub async fn retry_job_if_expired(&self, identifier: &str) -> Result<bool, QueueError> {
        if !self.is_job_expired(identifier).await? {
            return Ok(false);
        }

        let priority = self.priority_of(identifier).await;
        let tx = Transaction::new()
            .lpush(QueueKey::Pending(priority), identifier)
            .incr(QueueKey::Retry(identifier));
        let moved = self
            .store
            .exec_if_removed(&QueueKey::Processing.to_string(), identifier, -1, tx)
            .await?;
        if !moved {
            debug!(job_id = %identifier, "Expired job no longer in processing");
            return Ok(false);
        }

        debug!(job_id = %identifier, priority = %priority, "Expired job moved back to pending");
        Ok(true)
    }

    /// Delayed jobs whose scheduled time has passed.
    pub async fn overdue_jobs(&self) -> Result<Vec<JobId>, QueueError> {
        Ok(self
            .overdue_entries(Utc::now())
            .await?
            .into_iter()
            .map(|(identifier, _)| identifier)
            .collect())
    }

    /// Promotes every overdue delayed job to its pending list.
    ///
    /// Returns the number of jobs promoted.
    pub async fn enqueue_overdue_jobs(&self) -> Result<usize, QueueError> {
        let overdue = self.overdue_entries(Utc::now()).await?;
        let mut promoted = 0;

        for (identifier, priority) in overdue {
            let tx = Transaction::new().lpush(QueueKey::Pending(priority), identifier.as_str());
            let moved = self
                .store
                .exec_if_removed(&QueueKey::Delayed.to_string(), &identifier, 1, tx)
                .await?;
            if !moved {
                continue;
            }
            promoted += 1;

            debug!(job_id = %identifier, priority = %priority, "Delayed job promoted to pending");
        }

        Ok(promoted)
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending_high, pending_medium, pending_low, processing, delayed) = tokio::try_join!(
            self.len(QueueKey::Pending(Priority::High)),
            self.len(QueueKey::Pending(Priority::Medium)),
            self.len(QueueKey::Pending(Priority::Low)),
            self.len(QueueKey::Processing),
            self.len(QueueKey::Delayed),
        )?;

        Ok(QueueStats {
            pending_high,
            pending_medium,
            pending_low,
            processing,
            delayed,
        })
    }

    async fn list(&self, key: QueueKey<'_>) -> Result<Vec<JobId>, QueueError> {
        Ok(self.store.lrange(&key.to_string(), 0, -1).await?)
    }

    async fn len(&self, key: QueueKey<'_>) -> Result<usize, QueueError> {
        Ok(self.store.llen(&key.to_string()).await?)
    }

    /// Priority recorded in the envelope; medium when the record is unusable.
    async fn priority_of(&self, identifier: &str) -> Priority {
        match self.job_envelope(identifier).await {
            Ok(Some(envelope)) => envelope.priority,
            Ok(None) => Priority::default(),
            Err(e) => {
                warn!(job_id = %identifier, error = %e, "Unreadable job record, using default priority");
                Priority::default()
            }
        }
    }

    async fn overdue_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, Priority)>, QueueError> {
        let mut overdue = Vec::new();

        for identifier in self.delayed_jobs().await? {
            match self.job_envelope(&identifier).await {
                Ok(Some(envelope)) => {
                    if envelope.is_due(now) {
                        overdue.push((identifier, envelope.priority));
                    }
                }
                // Without a record the schedule is unknown; promote it so the
                // dequeue error and the recovery monitor dispose of it.
                Ok(None) | Err(QueueError::Decoding(_)) => {
                    warn!(job_id = %identifier, "Delayed job has no readable record");
                    overdue.push((identifier, Priority::default()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(overdue)
    }

    /// Loads, decodes and leases a job that was just moved to processing.
    ///
    /// On failure the identifier stays in processing without a lease, so the
    /// recovery monitor treats it as expired.
    async fn persisted_job(&self, identifier: JobId) -> Result<PersistedJob, QueueError> {
        let envelope = self
            .job_envelope(&identifier)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(identifier.clone()))?;

        let job = self.registry.decode(&envelope)?;

        self.store
            .set_ex(
                &QueueKey::Lock(&identifier).to_string(),
                &Utc::now().to_rfc3339(),
                envelope.time_to_live,
            )
            .await?;

        Ok(PersistedJob {
            identifier,
            envelope,
            job,
        })
    }
}

#[async_trait]
impl<S: AtomicStore> Queue for JobQueue<S> {
    async fn enqueue(
        &self,
        job: &dyn Job,
        priority: Priority,
        schedule_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, QueueError> {
        let envelope = JobEnvelope::new(job, priority, self.config.default_time_to_live, schedule_at)?;
        let encoded = envelope.encode()?;
        let identifier = envelope.identifier;

        let list = match schedule_at {
            Some(_) => QueueKey::Delayed,
            None => QueueKey::Pending(priority),
        };
        let tx = Transaction::new()
            .set(QueueKey::Job(&identifier), encoded)
            .lpush(list, identifier.as_str());
        self.store.exec(tx).await?;

        debug!(
            job_id = %identifier,
            job_type = %envelope.job_type,
            priority = %priority,
            delayed = schedule_at.is_some(),
            "Job enqueued"
        );
        Ok(identifier)
    }

    async fn dequeue(&self) -> Result<Option<PersistedJob>, QueueError> {
        let processing = QueueKey::Processing.to_string();

        for priority in Priority::ALL {
            let pending = QueueKey::Pending(priority).to_string();
            if let Some(identifier) = self.store.rpoplpush(&pending, &processing).await? {
                return self.persisted_job(identifier).await.map(Some);
            }
        }

        Ok(None)
    }

    async fn bdequeue_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<PersistedJob>, QueueError> {
        let deadline = Instant::now() + timeout;
        let high = QueueKey::Pending(Priority::High).to_string();
        let processing = QueueKey::Processing.to_string();

        loop {
            if let Some(job) = self.dequeue().await? {
                return Ok(Some(job));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let wait = remaining.min(self.config.block_timeout);
            if let Some(identifier) = self.store.brpoplpush(&high, &processing, wait).await? {
                return self.persisted_job(identifier).await.map(Some);
            }
        }
    }

    async fn complete(&self, identifier: &str) -> Result<(), QueueError> {
        let tx = Transaction::new()
            .lrem(QueueKey::Processing, identifier, -1)
            .del(QueueKey::Lock(identifier))
            .del(QueueKey::Retry(identifier))
            .del(QueueKey::Job(identifier));
        self.store.exec(tx).await?;

        debug!(job_id = %identifier, "Job completed");
        Ok(())
    }
}
