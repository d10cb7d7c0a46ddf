//! Job metrics
//!
//! Counters per job type, recorded by the job store (enqueue, dequeue) and
//! by scheduler workers (outcome, execution time).

use crate::state::JobOutcome;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Metrics for a single job type
#[derive(Debug)]
pub struct JobTypeMetrics {
    /// Job type tag
    pub job_type: String,

    /// Number of jobs enqueued
    pub enqueued: AtomicU64,

    /// Number of jobs whose body returned `Ok`
    pub succeeded: AtomicU64,

    /// Number of jobs whose body failed or panicked
    pub failed: AtomicU64,

    /// Number of jobs that found their stage already done
    pub state_not_changed: AtomicU64,

    /// Number of jobs removed before they ran
    pub dequeued: AtomicU64,

    /// Total time spent in job bodies (nanoseconds)
    pub total_run_time_ns: AtomicU64,
}

impl JobTypeMetrics {
    /// Create new metrics for a job type
    pub fn new(job_type: impl Into<String>) -> Self {
        JobTypeMetrics {
            job_type: job_type.into(),
            enqueued: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            state_not_changed: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            total_run_time_ns: AtomicU64::new(0),
        }
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one execution and its duration
    pub fn record_execution(&self, outcome: &JobOutcome, duration: Duration) {
        let counter = match outcome {
            JobOutcome::Succeeded => &self.succeeded,
            JobOutcome::StateNotChanged => &self.state_not_changed,
            JobOutcome::Failed(_) => &self.failed,
            JobOutcome::Dequeued => &self.dequeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_run_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            job_type: self.job_type.clone(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            state_not_changed: self.state_not_changed.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            total_time_ns: self.total_run_time_ns.load(Ordering::Relaxed),
        }
    }
}

/// Metrics for every job type seen by a job store
#[derive(Debug, Default)]
pub struct JobMetrics {
    by_type: DashMap<String, Arc<JobTypeMetrics>>,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for `job_type`, created on first use
    pub fn for_type(&self, job_type: &str) -> Arc<JobTypeMetrics> {
        if let Some(metrics) = self.by_type.get(job_type) {
            return metrics.clone();
        }
        self.by_type
            .entry(job_type.to_string())
            .or_insert_with(|| Arc::new(JobTypeMetrics::new(job_type)))
            .clone()
    }

    /// Snapshots of every job type, sorted by type
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let mut snapshots: Vec<_> = self
            .by_type
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        snapshots
    }

    pub fn reset(&self) {
        self.by_type.clear();
    }
}

/// A point-in-time snapshot of job metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub job_type: String,
    pub enqueued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub state_not_changed: u64,
    pub dequeued: u64,
    pub total_time_ns: u64,
}

impl MetricsSnapshot {
    /// Number of executed job bodies
    pub fn executions(&self) -> u64 {
        self.succeeded + self.failed + self.state_not_changed
    }

    /// Share of executions that found nothing to do
    pub fn skip_rate(&self) -> f64 {
        let executions = self.executions();
        if executions == 0 {
            0.0
        } else {
            self.state_not_changed as f64 / executions as f64
        }
    }

    pub fn avg_execution_time(&self) -> Duration {
        let executions = self.executions();
        if executions == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_time_ns / executions)
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Job: {}", self.job_type)?;
        writeln!(
            f,
            "  Enqueued: {} | Dequeued: {}",
            self.enqueued, self.dequeued
        )?;
        writeln!(
            f,
            "  Succeeded: {} | Failed: {} | Unchanged: {} ({:.1}%)",
            self.succeeded,
            self.failed,
            self.state_not_changed,
            self.skip_rate() * 100.0
        )?;
        writeln!(
            f,
            "  Avg Time: {:.2}ms | Total Time: {:.2}ms",
            self.avg_execution_time().as_secs_f64() * 1000.0,
            Duration::from_nanos(self.total_time_ns).as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}
