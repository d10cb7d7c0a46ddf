//! Shared state: open documents, jobs, the change queue and the versioned
//! table that feature stores are built on.

pub mod changes;
pub mod documents;
pub mod errors;
pub mod jobs;
pub mod table;

pub use changes::{ChangeBatch, ChangeFlags, ChangeStore, DEFAULT_MAX_TIMESPAN};
pub use documents::{Document, DocumentStore};
pub use errors::{Result, StoreError};
pub use jobs::{JobInfo, JobOutcome, JobState, JobStore, NextJob, DEFAULT_OUTCOME_CAPACITY};
pub use table::{Revision, Snapshot, VersionedTable, WriteTxn};

use std::sync::Arc;
use std::time::Duration;

/// The stores shared by every feature
#[derive(Debug, Clone)]
pub struct StateStore {
    pub documents: Arc<DocumentStore>,
    pub jobs: Arc<JobStore>,
    pub changes: Arc<ChangeStore>,
}

impl StateStore {
    /// Create a new set of empty stores with default limits
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_OUTCOME_CAPACITY, DEFAULT_MAX_TIMESPAN)
    }

    pub fn with_limits(outcome_capacity: usize, max_change_timespan: Duration) -> Self {
        let documents = Arc::new(DocumentStore::new());
        let jobs = Arc::new(JobStore::with_outcome_capacity(
            documents.clone(),
            outcome_capacity,
        ));
        let changes = Arc::new(ChangeStore::with_max_timespan(
            jobs.clone(),
            documents.clone(),
            max_change_timespan,
        ));
        StateStore {
            documents,
            jobs,
            changes,
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
