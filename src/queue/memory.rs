//! In-memory queue with strict priority ordering.
//!
//! All lists live behind one mutex. Dequeue order is:
//!
//! 1. any delayed job whose time has come, highest priority first
//! 2. pending jobs, high then medium then low, FIFO within a tier
//!
//! Unlike [`JobQueue`](super::JobQueue) there are no leases or retry
//! counters: a job that is never completed simply stays in processing.
//! Blocking dequeue parks on a [`Notify`] instead of polling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Queue, QueueConfig, QueueStats};
use crate::error::QueueError;
use crate::job::{Job, JobEnvelope, JobId, JobRegistry, PersistedJob, Priority};

#[derive(Debug, Default)]
struct State {
    records: HashMap<JobId, JobEnvelope>,
    pending: HashMap<Priority, VecDeque<JobId>>,
    delayed: Vec<JobId>,
    processing: Vec<JobId>,
}

impl State {
    fn next_due_delayed(&self, now: DateTime<Utc>) -> Option<usize> {
        self.delayed
            .iter()
            .enumerate()
            .filter_map(|(index, id)| {
                let envelope = self.records.get(id)?;
                envelope.is_due(now).then_some((index, envelope.priority))
            })
            .min_by_key(|(_, priority)| *priority)
            .map(|(index, _)| index)
    }

    fn take_next(&mut self, now: DateTime<Utc>) -> Option<JobId> {
        if let Some(index) = self.next_due_delayed(now) {
            return Some(self.delayed.remove(index));
        }
        Priority::ALL
            .iter()
            .find_map(|priority| self.pending.get_mut(priority)?.pop_front())
    }

    /// Time until the earliest delayed job becomes due.
    fn next_wakeup(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.delayed
            .iter()
            .filter_map(|id| self.records.get(id)?.scheduled_at)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Thread-safe, priority and delay aware in-process queue.
pub struct MemoryQueue {
    state: Mutex<State>,
    available: Notify,
    registry: Arc<JobRegistry>,
    config: QueueConfig,
}

impl MemoryQueue {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self::with_config(registry, QueueConfig::default())
    }

    pub fn with_config(registry: Arc<JobRegistry>, config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Notify::new(),
            registry,
            config,
        }
    }

    /// True when no job is waiting (pending or delayed).
    pub fn is_empty(&self) -> bool {
        let state = self.state();
        state.delayed.is_empty() && state.pending.values().all(VecDeque::is_empty)
    }

    pub fn processing_jobs(&self) -> Vec<JobId> {
        self.state().processing.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state();
        let pending = |priority: Priority| state.pending.get(&priority).map_or(0, VecDeque::len);
        QueueStats {
            pending_high: pending(Priority::High),
            pending_medium: pending(Priority::Medium),
            pending_low: pending(Priority::Low),
            processing: state.processing.len(),
            delayed: state.delayed.len(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves the next job to processing and returns its envelope.
    fn take(&self) -> Option<JobEnvelope> {
        let mut state = self.state();
        let identifier = state.take_next(Utc::now())?;
        let envelope = state.records.get(&identifier).cloned();
        state.processing.push(identifier);
        envelope
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(
        &self,
        job: &dyn Job,
        priority: Priority,
        schedule_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, QueueError> {
        let envelope =
            JobEnvelope::new(job, priority, self.config.default_time_to_live, schedule_at)?;
        let identifier = envelope.identifier.clone();

        {
            let mut state = self.state();
            if schedule_at.is_some() {
                state.delayed.push(identifier.clone());
            } else {
                state
                    .pending
                    .entry(priority)
                    .or_default()
                    .push_back(identifier.clone());
            }
            state.records.insert(identifier.clone(), envelope);
        }

        self.available.notify_waiters();
        Ok(identifier)
    }

    async fn dequeue(&self) -> Result<Option<PersistedJob>, QueueError> {
        let Some(envelope) = self.take() else {
            return Ok(None);
        };

        let job = self.registry.decode(&envelope)?;
        Ok(Some(PersistedJob {
            identifier: envelope.identifier.clone(),
            envelope,
            job,
        }))
    }

    async fn bdequeue_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<PersistedJob>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.dequeue().await? {
                return Ok(Some(job));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let next_due = self.state().next_wakeup(Utc::now());
            let wait = next_due.map_or(remaining, |due| remaining.min(due));

            // Either a push or a delayed job coming due ends the wait. Both
            // are re-checked at the top of the loop, so elapsing is expected.
            tokio::time::timeout(wait, notified).await.ok();
        }
    }

    async fn complete(&self, identifier: &str) -> Result<(), QueueError> {
        let mut state = self.state();
        state.processing.retain(|id| id != identifier);
        state.records.remove(identifier);
        Ok(())
    }
}
