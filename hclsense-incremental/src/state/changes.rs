//! Change queue
//!
//! Store transactions that alter user-visible output queue a change for the
//! affected directory. Changes are coalesced per directory into batches that
//! are either drained at once or awaited one by one.

use super::documents::DocumentStore;
use super::errors::Result;
use super::jobs::JobStore;
use hclsense_types::DirHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Default age after which a batch is released even if jobs are still running
pub const DEFAULT_MAX_TIMESPAN: Duration = Duration::from_secs(1);

/// What changed for a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChangeFlags {
    pub is_removal: bool,
    pub diagnostics: bool,
    pub metadata: bool,
    pub reference_origins: bool,
    pub reference_targets: bool,
}

impl ChangeFlags {
    pub fn diagnostics() -> Self {
        ChangeFlags {
            diagnostics: true,
            ..Default::default()
        }
    }

    pub fn removal() -> Self {
        ChangeFlags {
            is_removal: true,
            ..Default::default()
        }
    }

    /// Flags set in either `self` or `other`
    pub fn union(self, other: ChangeFlags) -> ChangeFlags {
        ChangeFlags {
            is_removal: self.is_removal || other.is_removal,
            diagnostics: self.diagnostics || other.diagnostics,
            metadata: self.metadata || other.metadata,
            reference_origins: self.reference_origins || other.reference_origins,
            reference_targets: self.reference_targets || other.reference_targets,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == ChangeFlags::default()
    }
}

/// Coalesced changes for one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub dir: DirHandle,
    pub first_change_time: Instant,
    pub is_dir_open: bool,
    pub changes: ChangeFlags,
}

/// Queue of pending change batches
pub struct ChangeStore {
    batches: Mutex<HashMap<DirHandle, ChangeBatch>>,
    queued: Notify,
    jobs: Arc<JobStore>,
    documents: Arc<DocumentStore>,
    max_timespan: Duration,
}

impl ChangeStore {
    /// Create a change store releasing batches after [`DEFAULT_MAX_TIMESPAN`]
    pub fn new(jobs: Arc<JobStore>, documents: Arc<DocumentStore>) -> Self {
        Self::with_max_timespan(jobs, documents, DEFAULT_MAX_TIMESPAN)
    }

    pub fn with_max_timespan(
        jobs: Arc<JobStore>,
        documents: Arc<DocumentStore>,
        max_timespan: Duration,
    ) -> Self {
        ChangeStore {
            batches: Mutex::new(HashMap::new()),
            queued: Notify::new(),
            jobs,
            documents,
            max_timespan,
        }
    }

    /// Merge `changes` into the pending batch for `dir`, ignoring empty flags
    pub fn queue_change(&self, dir: DirHandle, changes: ChangeFlags) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut batches = self.batches.lock();
        match batches.get_mut(&dir) {
            Some(batch) => {
                batch.changes = batch.changes.union(changes);
            }
            None => {
                tracing::trace!(%dir, ?changes, "change queued");
                let is_dir_open = self.documents.has_open_documents(&dir);
                batches.insert(
                    dir.clone(),
                    ChangeBatch {
                        dir,
                        first_change_time: Instant::now(),
                        is_dir_open,
                        changes,
                    },
                );
            }
        }
        drop(batches);

        self.queued.notify_waiters();
        Ok(())
    }

    /// Take every pending batch, oldest first
    pub fn drain(&self) -> Vec<ChangeBatch> {
        let mut batches: Vec<ChangeBatch> = self.batches.lock().drain().map(|(_, b)| b).collect();
        batches.sort_by_key(|batch| batch.first_change_time);
        for batch in &mut batches {
            batch.is_dir_open = self.documents.has_open_documents(&batch.dir);
        }
        batches
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }

    /// Wait for the next batch that is ready to publish
    ///
    /// The oldest batch is released once it is older than the configured
    /// maximum timespan, or as soon as no job for its directory is queued or
    /// running.
    pub async fn await_next_change_batch(&self) -> ChangeBatch {
        loop {
            let queued = self.queued.notified();
            tokio::pin!(queued);
            queued.as_mut().enable();
            let job_finished = self.jobs.job_finished();
            tokio::pin!(job_finished);
            job_finished.as_mut().enable();

            let oldest = self
                .batches
                .lock()
                .values()
                .min_by_key(|batch| batch.first_change_time)
                .map(|batch| (batch.dir.clone(), batch.first_change_time));

            let Some((dir, first_change_time)) = oldest else {
                queued.await;
                continue;
            };

            let age = first_change_time.elapsed();
            if age >= self.max_timespan || !self.jobs.jobs_exist_for_dir(&dir) {
                if let Some(mut batch) = self.batches.lock().remove(&dir) {
                    batch.is_dir_open = self.documents.has_open_documents(&dir);
                    return batch;
                }
                continue;
            }

            tokio::select! {
                _ = &mut job_finished => {}
                _ = &mut queued => {}
                _ = tokio::time::sleep(self.max_timespan - age) => {}
            }
        }
    }
}

impl std::fmt::Debug for ChangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeStore")
            .field("pending", &self.len())
            .field("max_timespan", &self.max_timespan)
            .finish()
    }
}
