//! hclsense incremental analysis engine
//!
//! This crate provides the job scheduler and versioned state store that
//! keep a changing set of configuration directories analyzed without
//! redundant work.
//!
//! # Architecture
//!
//! Work is expressed as **jobs**: opaque async closures scoped to one
//! directory, with an optional continuation (`defer`) that may enqueue
//! further jobs once the body's result is known.
//!
//! ```text
//! event bus → feature controller → JobStore::enqueue_job
//!          → Scheduler workers → job bodies → VersionedTable transactions
//!          → ChangeStore → Notifier hooks
//! ```
//!
//! ## Key Features
//!
//! - **Dependency gating**: a job is handed to a worker only once every job
//!   it depends on is terminal
//! - **Deferred fan-out**: continuation jobs are tracked as children so
//!   callers can wait on a whole subtree
//! - **Cancellation**: all queued work for a directory can be dropped at once
//! - **Snapshot reads**: readers see immutable table snapshots while writers
//!   commit copy-on-write transactions
//!
//! # Example
//!
//! ```rust,ignore
//! use hclsense_incremental::prelude::*;
//! use std::sync::Arc;
//!
//! let state = StateStore::new();
//! let scheduler = Scheduler::new(state.jobs.clone(), 4);
//! scheduler.start();
//!
//! let dir = DirHandle::from_path("/work/mod");
//! let id = state.jobs.enqueue_job(
//!     &RequestContext::new(),
//!     Job::new(dir, "parse", |_ctx| async { Ok(()) }),
//! )?;
//! state.jobs.wait_for_jobs(&[id]).await;
//! ```

#![warn(missing_debug_implementations)]

pub mod context;
pub mod eventbus;
pub mod job;
pub mod metrics;
pub mod notifier;
pub mod scheduler;
pub mod state;

pub use context::{RequestContext, ValidationOptions};
pub use eventbus::{
    DidChangeEvent, DidChangeWatchedEvent, DidOpenEvent, DiscoverEvent, EventBus, Topic,
};
pub use job::{
    ignore_state, with_ignore_state, DeferFunc, Job, JobError, JobFunc, JobId, JobIds,
    JobPriority, StateNotChangedErr,
};
pub use metrics::{JobMetrics, JobTypeMetrics, MetricsSnapshot};
pub use notifier::{Hook, Notifier};
pub use scheduler::Scheduler;
pub use state::{
    ChangeBatch, ChangeFlags, ChangeStore, DocumentStore, JobOutcome, JobStore, Revision,
    Snapshot, StateStore, StoreError, VersionedTable, WriteTxn,
};

pub use hclsense_types::{DirHandle, DocumentHandle, OpState};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::RequestContext;
    pub use crate::eventbus::EventBus;
    pub use crate::job::{Job, JobError, JobId, JobIds};
    pub use crate::scheduler::Scheduler;
    pub use crate::state::{ChangeFlags, JobStore, StateStore, StoreError, VersionedTable};
    pub use hclsense_types::{DirHandle, DocumentHandle, OpState};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_usage() {
        let state = StateStore::new();
        assert!(state.jobs.list_jobs().is_empty());
        assert!(state.changes.is_empty());
    }
}
