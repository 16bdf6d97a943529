//! High-level interface for recording queue metrics.

use std::time::Duration;

use super::prometheus::{ACTIVE_JOBS, JOBS_TOTAL, JOB_DURATION, QUEUE_DEPTH};
use crate::queue::{QueueKey, QueueStats};
use crate::job::Priority;

/// How a job left the processing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Retried,
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::Retried => "retried",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

/// Records relq metrics; every method is a no-op until
/// [`init_metrics`](super::init_metrics) has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn record_outcome(&self, outcome: JobOutcome) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome.as_str()]).inc();
        }
        tracing::trace!(outcome = outcome.as_str(), "Recorded job outcome metric");
    }

    pub fn record_duration(&self, job_type: &str, duration: Duration) {
        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration
                .with_label_values(&[job_type])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn inc_active_jobs(&self) {
        if let Some(active_jobs) = ACTIVE_JOBS.get() {
            active_jobs.inc();
        }
    }

    pub fn dec_active_jobs(&self) {
        if let Some(active_jobs) = ACTIVE_JOBS.get() {
            active_jobs.dec();
        }
    }

    /// Publishes one gauge per store list.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        let Some(queue_depth) = QUEUE_DEPTH.get() else {
            return;
        };
        let lists = [
            (QueueKey::Pending(Priority::High), stats.pending_high),
            (QueueKey::Pending(Priority::Medium), stats.pending_medium),
            (QueueKey::Pending(Priority::Low), stats.pending_low),
            (QueueKey::Processing, stats.processing),
            (QueueKey::Delayed, stats.delayed),
        ];
        for (key, depth) in lists {
            queue_depth
                .with_label_values(&[key.to_string().as_str()])
                .set(depth as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_record_before_init_does_not_panic() {
        let collector = MetricsCollector::new();
        collector.record_outcome(JobOutcome::Failed);
        collector.dec_active_jobs();
    }

    #[test]
    fn test_recorded_values_are_exported() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();

        collector.record_outcome(JobOutcome::Abandoned);
        collector.record_duration("Resize", Duration::from_millis(20));
        collector.update_queue_depth(&QueueStats {
            pending_medium: 3,
            ..QueueStats::default()
        });

        let exported = export_metrics();
        assert!(exported.contains("relq_jobs_total"));
        assert!(exported.contains("outcome=\"abandoned\""));
        assert!(exported.contains("list=\"queue:pending:medium\""));
    }
}
