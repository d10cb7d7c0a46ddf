//! Job store
//!
//! Holds every job that has not yet been garbage-collected. A job is handed
//! out to a worker only once every job it depends on is terminal; finished
//! jobs that spawned deferred children stay around as `Done` until those
//! children finish, so that [`JobStore::wait_for_jobs`] can follow the whole
//! subtree.

use super::documents::DocumentStore;
use super::errors::{Result, StoreError};
use crate::context::RequestContext;
use crate::job::{DeferFunc, Job, JobError, JobFunc, JobId, JobIds, JobPriority};
use crate::metrics::JobMetrics;
use hclsense_types::DirHandle;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};

/// Default number of finished job outcomes remembered for lookup
pub const DEFAULT_OUTCOME_CAPACITY: usize = 1024;

/// Scheduling state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
}

/// Terminal result of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    StateNotChanged,
    Failed(String),
    Dequeued,
}

impl JobOutcome {
    /// Classify the result of a job body run for `dir`
    pub fn from_result(result: &std::result::Result<(), JobError>, dir: &DirHandle) -> Self {
        match result {
            Ok(()) => JobOutcome::Succeeded,
            Err(err) if err.is_state_not_changed_for(dir) => JobOutcome::StateNotChanged,
            Err(err) => JobOutcome::Failed(err.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

/// Read-only view of a job
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: JobId,
    pub dir: DirHandle,
    pub job_type: String,
    pub state: JobState,
    pub depends_on: JobIds,
    pub deferred_job_ids: JobIds,
}

/// A job handed out to a worker
pub struct NextJob {
    pub id: JobId,
    pub dir: DirHandle,
    pub job_type: String,
    /// Request context with the job's ignore-state flag applied
    pub context: RequestContext,
    pub func: JobFunc,
}

impl fmt::Debug for NextJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextJob")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("job_type", &self.job_type)
            .finish()
    }
}

struct ScheduledJob {
    id: JobId,
    dir: DirHandle,
    job_type: String,
    priority: Option<JobPriority>,
    ignore_state: bool,
    context: RequestContext,
    state: JobState,
    depends_on: JobIds,
    func: Option<JobFunc>,
    defer: Option<DeferFunc>,
    deferred_job_ids: JobIds,
    dequeued: bool,
    enqueued_at: Instant,
}

impl ScheduledJob {
    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            dir: self.dir.clone(),
            job_type: self.job_type.clone(),
            state: self.state,
            depends_on: self.depends_on.clone(),
            deferred_job_ids: self.deferred_job_ids.clone(),
        }
    }
}

struct JobTable {
    last_id: u64,
    jobs: BTreeMap<JobId, ScheduledJob>,
    outcomes: LruCache<JobId, JobOutcome>,
}

impl JobTable {
    fn remove_dependency(&mut self, id: JobId) {
        for job in self.jobs.values_mut() {
            job.depends_on.retain(|dep| *dep != id);
        }
    }

    /// Drop `child` from every finished parent, removing parents left with
    /// no live children
    fn cleanup_parent_done_jobs(&mut self, child: JobId) {
        let mut pending = vec![child];
        while let Some(child) = pending.pop() {
            let parents: Vec<JobId> = self
                .jobs
                .values()
                .filter(|job| job.state == JobState::Done && job.deferred_job_ids.contains(&child))
                .map(|job| job.id)
                .collect();

            for parent in parents {
                let finished = match self.jobs.get_mut(&parent) {
                    Some(job) => {
                        job.deferred_job_ids.retain(|id| *id != child);
                        job.deferred_job_ids.is_empty()
                    }
                    None => false,
                };
                if finished {
                    self.jobs.remove(&parent);
                    pending.push(parent);
                }
            }
        }
    }
}

/// Store of queued, running and recently finished jobs
pub struct JobStore {
    table: Mutex<JobTable>,
    documents: Arc<DocumentStore>,
    queue_changed: Notify,
    job_finished: Notify,
    metrics: JobMetrics,
}

impl JobStore {
    /// Create a new job store
    pub fn new(documents: Arc<DocumentStore>) -> Self {
        Self::with_outcome_capacity(documents, DEFAULT_OUTCOME_CAPACITY)
    }

    /// Create a job store remembering up to `capacity` finished outcomes
    pub fn with_outcome_capacity(documents: Arc<DocumentStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        JobStore {
            table: Mutex::new(JobTable {
                last_id: 0,
                jobs: BTreeMap::new(),
                outcomes: LruCache::new(capacity),
            }),
            documents,
            queue_changed: Notify::new(),
            job_finished: Notify::new(),
            metrics: JobMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    /// Register a job as queued
    ///
    /// Every ID in `depends_on` must have been issued by this store.
    /// Dependencies that are already finished are dropped.
    pub fn enqueue_job(&self, ctx: &RequestContext, job: Job) -> Result<JobId> {
        let mut table = self.table.lock();

        let mut depends_on = JobIds::with_capacity(job.depends_on.len());
        for dep in job.depends_on {
            if dep.0 == 0 || dep.0 > table.last_id {
                return Err(StoreError::UnknownDependency(dep));
            }
            let pending = table
                .jobs
                .get(&dep)
                .is_some_and(|queued| queued.state != JobState::Done);
            if pending && !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }

        table.last_id += 1;
        let id = JobId(table.last_id);
        tracing::debug!(
            job = %id,
            dir = %job.dir,
            job_type = %job.job_type,
            depends_on = ?depends_on,
            "job enqueued"
        );
        self.metrics.for_type(&job.job_type).record_enqueued();

        table.jobs.insert(
            id,
            ScheduledJob {
                id,
                dir: job.dir,
                job_type: job.job_type,
                priority: job.priority,
                ignore_state: job.ignore_state,
                context: ctx.clone(),
                state: JobState::Queued,
                depends_on,
                func: Some(job.func),
                defer: job.defer,
                deferred_job_ids: JobIds::new(),
                dequeued: false,
                enqueued_at: Instant::now(),
            },
        );
        drop(table);

        self.queue_changed.notify_waiters();
        Ok(id)
    }

    /// Remove every queued job for `dir`
    ///
    /// Running jobs for `dir` are left to finish, but their continuations are
    /// suppressed.
    pub fn dequeue_jobs_for_dir(&self, dir: &DirHandle) -> Result<()> {
        let mut table = self.table.lock();

        let queued: Vec<JobId> = table
            .jobs
            .values()
            .filter(|job| &job.dir == dir && job.state == JobState::Queued)
            .map(|job| job.id)
            .collect();

        for job in table.jobs.values_mut() {
            if &job.dir == dir && job.state == JobState::Running {
                job.dequeued = true;
            }
        }

        for id in &queued {
            if let Some(job) = table.jobs.remove(id) {
                self.metrics.for_type(&job.job_type).record_dequeued();
            }
            table.outcomes.put(*id, JobOutcome::Dequeued);
            table.remove_dependency(*id);
            table.cleanup_parent_done_jobs(*id);
        }
        drop(table);

        tracing::debug!(%dir, dequeued = queued.len(), "jobs dequeued for dir");
        self.queue_changed.notify_waiters();
        self.job_finished.notify_waiters();
        Ok(())
    }

    /// Wait for the next runnable job
    ///
    /// With `priority` set, only jobs of that priority are handed out. A job
    /// without an explicit priority is high priority while its directory has
    /// open documents. Returns `None` once `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn await_next_job(
        &self,
        priority: Option<JobPriority>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<NextJob> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let notified = self.queue_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.take_next_job(priority) {
                return Some(next);
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn take_next_job(&self, priority: Option<JobPriority>) -> Option<NextJob> {
        let mut table = self.table.lock();
        let documents = &self.documents;

        let job = table.jobs.values_mut().find(|job| {
            if job.state != JobState::Queued || !job.depends_on.is_empty() {
                return false;
            }
            match priority {
                None => true,
                Some(wanted) => {
                    let effective = job.priority.unwrap_or_else(|| {
                        if documents.has_open_documents(&job.dir) {
                            JobPriority::High
                        } else {
                            JobPriority::Low
                        }
                    });
                    effective == wanted
                }
            }
        })?;

        let func = job.func.take()?;
        job.state = JobState::Running;
        tracing::debug!(
            job = %job.id,
            dir = %job.dir,
            job_type = %job.job_type,
            waited_ms = job.enqueued_at.elapsed().as_millis() as u64,
            "job dispatched"
        );

        Some(NextJob {
            id: job.id,
            dir: job.dir.clone(),
            job_type: job.job_type.clone(),
            context: job.context.with_ignore_state(job.ignore_state),
            func,
        })
    }

    /// Take the continuation of a running job
    ///
    /// Returns `None` if the job has none, or if its directory was dequeued
    /// while it was running.
    pub fn take_defer(&self, id: JobId) -> Option<DeferFunc> {
        let mut table = self.table.lock();
        let job = table.jobs.get_mut(&id)?;
        if job.dequeued {
            if job.defer.take().is_some() {
                tracing::debug!(job = %id, dir = %job.dir, "suppressing continuation of dequeued job");
            }
            return None;
        }
        job.defer.take()
    }

    /// Mark a job as finished
    ///
    /// `deferred` are the jobs enqueued by its continuation; while any of
    /// them is still known, the job is kept as `Done`.
    pub fn finish_job(&self, id: JobId, outcome: JobOutcome, deferred: JobIds) -> Result<()> {
        let mut table = self.table.lock();
        if !table.jobs.contains_key(&id) {
            return Err(StoreError::JobNotFound(id));
        }

        table.remove_dependency(id);

        let live: JobIds = deferred
            .into_iter()
            .filter(|child| table.jobs.contains_key(child))
            .collect();

        if live.is_empty() {
            table.jobs.remove(&id);
            table.cleanup_parent_done_jobs(id);
        } else if let Some(job) = table.jobs.get_mut(&id) {
            job.state = JobState::Done;
            job.deferred_job_ids = live;
            job.func = None;
            job.defer = None;
        }
        tracing::debug!(job = %id, ?outcome, "job finished");
        table.outcomes.put(id, outcome);
        drop(table);

        self.queue_changed.notify_waiters();
        self.job_finished.notify_waiters();
        Ok(())
    }

    /// Wait until every job in `ids` and every job they deferred is finished
    pub async fn wait_for_jobs(&self, ids: &[JobId]) {
        let mut pending: JobIds = ids.to_vec();
        while let Some(id) = pending.pop() {
            let deferred = self.wait_for_job(id).await;
            pending.extend(deferred);
        }
    }

    async fn wait_for_job(&self, id: JobId) -> JobIds {
        loop {
            let notified = self.job_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let table = self.table.lock();
                match table.jobs.get(&id) {
                    None => return JobIds::new(),
                    Some(job) if job.state == JobState::Done => {
                        return job.deferred_job_ids.clone();
                    }
                    Some(_) => {}
                }
            }

            notified.await;
        }
    }

    /// Wait until the store holds no jobs at all
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.job_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.table.lock().jobs.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Future resolving the next time any job finishes or is dequeued
    pub fn job_finished(&self) -> Notified<'_> {
        self.job_finished.notified()
    }

    pub fn job_outcome(&self, id: JobId) -> Option<JobOutcome> {
        self.table.lock().outcomes.peek(&id).cloned()
    }

    pub fn job(&self, id: JobId) -> Result<JobInfo> {
        self.table
            .lock()
            .jobs
            .get(&id)
            .map(ScheduledJob::info)
            .ok_or(StoreError::JobNotFound(id))
    }

    pub fn list_queued_jobs(&self) -> Vec<JobInfo> {
        self.table
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .map(ScheduledJob::info)
            .collect()
    }

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        self.table.lock().jobs.values().map(ScheduledJob::info).collect()
    }

    /// Whether any job for `dir` is queued or running
    pub fn jobs_exist_for_dir(&self, dir: &DirHandle) -> bool {
        self.table
            .lock()
            .jobs
            .values()
            .any(|job| &job.dir == dir && job.state != JobState::Done)
    }
}

impl fmt::Debug for JobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("JobStore")
            .field("last_id", &table.last_id)
            .field("jobs", &table.jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> JobStore {
        JobStore::new(Arc::new(DocumentStore::new()))
    }

    fn noop(dir: &str, job_type: &str) -> Job {
        Job::new(DirHandle::from_path(dir), job_type, |_ctx| async { Ok(()) })
    }

    fn next_now(store: &JobStore, priority: Option<JobPriority>) -> Option<NextJob> {
        store.take_next_job(priority)
    }

    #[test]
    fn test_enqueue_assigns_increasing_ids() {
        let store = store();
        let ctx = RequestContext::new();

        let first = store.enqueue_job(&ctx, noop("/a", "parse")).unwrap();
        let second = store.enqueue_job(&ctx, noop("/a", "parse")).unwrap();

        assert!(second > first);
        assert_eq!(store.list_queued_jobs().len(), 2);
    }

    #[test]
    fn test_enqueue_rejects_unknown_dependency() {
        let store = store();
        let ctx = RequestContext::new();

        let err = store
            .enqueue_job(&ctx, noop("/a", "metadata").depends_on([JobId(42)]))
            .unwrap_err();

        assert_eq!(err, StoreError::UnknownDependency(JobId(42)));
        assert!(store.list_jobs().is_empty());
    }

    #[test]
    fn test_dependent_is_not_dispatched_before_dependency_finishes() {
        let store = store();
        let ctx = RequestContext::new();

        let parse = store.enqueue_job(&ctx, noop("/a", "parse")).unwrap();
        let meta = store
            .enqueue_job(&ctx, noop("/a", "metadata").depends_on([parse]))
            .unwrap();

        let first = next_now(&store, None).unwrap();
        assert_eq!(first.id, parse);
        assert!(next_now(&store, None).is_none());

        store.finish_job(parse, JobOutcome::Failed("boom".into()), vec![]).unwrap();

        let second = next_now(&store, None).unwrap();
        assert_eq!(second.id, meta);
    }

    #[test]
    fn test_finished_dependency_is_dropped_at_enqueue() {
        let store = store();
        let ctx = RequestContext::new();

        let parse = store.enqueue_job(&ctx, noop("/a", "parse")).unwrap();
        let job = next_now(&store, None).unwrap();
        store.finish_job(job.id, JobOutcome::Succeeded, vec![]).unwrap();

        let meta = store
            .enqueue_job(&ctx, noop("/a", "metadata").depends_on([parse]))
            .unwrap();
        assert!(store.job(meta).unwrap().depends_on.is_empty());
        assert_eq!(store.job_outcome(parse), Some(JobOutcome::Succeeded));
    }

    #[test]
    fn test_dequeue_removes_only_queued_jobs_for_dir() {
        let store = store();
        let ctx = RequestContext::new();

        let running = store.enqueue_job(&ctx, noop("/a", "parse")).unwrap();
        let _ = next_now(&store, None).unwrap();
        let queued = store.enqueue_job(&ctx, noop("/a", "metadata")).unwrap();
        let other = store.enqueue_job(&ctx, noop("/b", "parse")).unwrap();

        store.dequeue_jobs_for_dir(&DirHandle::from_path("/a")).unwrap();

        assert_eq!(store.job(running).unwrap().state, JobState::Running);
        assert!(store.job(queued).is_err());
        assert_eq!(store.job_outcome(queued), Some(JobOutcome::Dequeued));
        assert!(store.job(other).is_ok());
    }

    #[test]
    fn test_defer_is_suppressed_after_dequeue() {
        let store = store();
        let ctx = RequestContext::new();

        let id = store
            .enqueue_job(&ctx, noop("/a", "metadata").defer(|_ctx, _err| Ok(vec![])))
            .unwrap();
        let _ = next_now(&store, None).unwrap();

        store.dequeue_jobs_for_dir(&DirHandle::from_path("/a")).unwrap();
        assert!(store.take_defer(id).is_none());
    }

    #[test]
    fn test_defer_is_available_for_running_job() {
        let store = store();
        let ctx = RequestContext::new();

        let id = store
            .enqueue_job(&ctx, noop("/a", "metadata").defer(|_ctx, _err| Ok(vec![])))
            .unwrap();
        let _ = next_now(&store, None).unwrap();
        assert!(store.take_defer(id).is_some());
    }

    #[test]
    fn test_job_with_live_children_is_kept_done() {
        let store = store();
        let ctx = RequestContext::new();

        let parent = store.enqueue_job(&ctx, noop("/a", "metadata")).unwrap();
        let _ = next_now(&store, None).unwrap();
        let child = store.enqueue_job(&ctx, noop("/a", "schema")).unwrap();

        store.finish_job(parent, JobOutcome::Succeeded, vec![child]).unwrap();
        let info = store.job(parent).unwrap();
        assert_eq!(info.state, JobState::Done);
        assert_eq!(info.deferred_job_ids, vec![child]);

        let _ = next_now(&store, None).unwrap();
        store.finish_job(child, JobOutcome::Succeeded, vec![]).unwrap();
        assert!(store.job(parent).is_err());
        assert!(store.list_jobs().is_empty());
    }

    #[test]
    fn test_priority_follows_open_documents() {
        let documents = Arc::new(DocumentStore::new());
        let store = JobStore::new(documents.clone());
        let ctx = RequestContext::new();

        documents.open_document(
            hclsense_types::DocumentHandle::from_path("/open/main.tf"),
            "terraform",
            1,
            "",
        );
        let closed = store.enqueue_job(&ctx, noop("/closed", "parse")).unwrap();
        let open = store.enqueue_job(&ctx, noop("/open", "parse")).unwrap();

        assert_eq!(next_now(&store, Some(JobPriority::High)).map(|j| j.id), Some(open));
        assert!(next_now(&store, Some(JobPriority::High)).is_none());
        assert_eq!(next_now(&store, Some(JobPriority::Low)).map(|j| j.id), Some(closed));
    }

    #[test]
    fn test_finish_unknown_job() {
        let store = store();
        assert_eq!(
            store.finish_job(JobId(7), JobOutcome::Succeeded, vec![]),
            Err(StoreError::JobNotFound(JobId(7)))
        );
    }

    #[tokio::test]
    async fn test_await_next_job_wakes_on_enqueue() {
        let store = Arc::new(store());
        let (_tx, mut rx) = watch::channel(false);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.await_next_job(None, &mut rx).await.map(|j| j.id) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = store.enqueue_job(&RequestContext::new(), noop("/a", "parse")).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_await_next_job_returns_none_on_shutdown() {
        let store = Arc::new(store());
        let (tx, mut rx) = watch::channel(false);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.await_next_job(None, &mut rx).await.is_none() })
        };
        tx.send(true).unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_jobs_follows_deferred_children() {
        let store = Arc::new(store());
        let ctx = RequestContext::new();

        let parent = store.enqueue_job(&ctx, noop("/a", "metadata")).unwrap();
        let _ = next_now(&store, None).unwrap();
        let child = store.enqueue_job(&ctx, noop("/a", "schema")).unwrap();
        store.finish_job(parent, JobOutcome::Succeeded, vec![child]).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_jobs(&[parent]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        let _ = next_now(&store, None).unwrap();
        store.finish_job(child, JobOutcome::Succeeded, vec![]).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
