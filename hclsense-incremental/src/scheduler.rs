//! Scheduler
//!
//! A fixed pool of tokio tasks pulling runnable jobs from a [`JobStore`].
//! Each worker runs the job body, then its continuation, then reports the
//! outcome back to the store.

use crate::job::{JobError, JobPriority};
use crate::state::{JobOutcome, JobStore};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Worker pool executing jobs from a job store
pub struct Scheduler {
    jobs: Arc<JobStore>,
    parallelism: usize,
    priority: Option<JobPriority>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler running up to `parallelism` jobs at once
    pub fn new(jobs: Arc<JobStore>, parallelism: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Scheduler {
            jobs,
            parallelism: parallelism.max(1),
            priority: None,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Only pick up jobs of the given priority
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Spawn the workers on the current tokio runtime
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        tracing::info!(
            parallelism = self.parallelism,
            priority = ?self.priority,
            "starting scheduler"
        );
        for worker in 0..self.parallelism {
            let jobs = self.jobs.clone();
            let shutdown = self.shutdown.subscribe();
            let priority = self.priority;
            workers.push(tokio::spawn(eval(jobs, priority, shutdown, worker)));
        }
    }

    /// Signal every worker to exit once its current job is done
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop and wait for the workers to exit
    pub async fn shutdown(&self) {
        self.stop();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "scheduler worker terminated abnormally");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("parallelism", &self.parallelism)
            .field("priority", &self.priority)
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

async fn eval(
    jobs: Arc<JobStore>,
    priority: Option<JobPriority>,
    mut shutdown: watch::Receiver<bool>,
    worker: usize,
) {
    while let Some(next) = jobs.await_next_job(priority, &mut shutdown).await {
        let started = Instant::now();
        let result = match AssertUnwindSafe((next.func)(next.context.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(JobError::Panicked(panic_message(payload))),
        };
        let outcome = JobOutcome::from_result(&result, &next.dir);

        match &result {
            Ok(()) => {}
            Err(err) if err.is_state_not_changed_for(&next.dir) => {
                tracing::debug!(job = %next.id, dir = %next.dir, job_type = %next.job_type, "state not changed");
            }
            Err(err) => {
                tracing::warn!(
                    job = %next.id,
                    dir = %next.dir,
                    job_type = %next.job_type,
                    error = %err,
                    "job failed"
                );
            }
        }
        jobs.metrics()
            .for_type(&next.job_type)
            .record_execution(&outcome, started.elapsed());

        let mut deferred = Vec::new();
        if let Some(defer) = jobs.take_defer(next.id) {
            let context = &next.context;
            let err = result.as_ref().err();
            match std::panic::catch_unwind(AssertUnwindSafe(|| defer(context, err))) {
                Ok(Ok(ids)) => deferred = ids,
                Ok(Err(err)) => {
                    tracing::warn!(job = %next.id, dir = %next.dir, error = %err, "deferred func failed");
                }
                Err(payload) => {
                    tracing::error!(
                        job = %next.id,
                        dir = %next.dir,
                        panic = %panic_message(payload),
                        "deferred func panicked"
                    );
                }
            }
        }

        if let Err(err) = jobs.finish_job(next.id, outcome, deferred) {
            tracing::error!(worker, job = %next.id, error = %err, "failed to finish job");
        }
    }
    tracing::debug!(worker, "scheduler worker stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
