//! Job descriptions
//!
//! A [`Job`] is an opaque unit of work scoped to one directory. The job
//! store hands it to a scheduler worker once every job it depends on has
//! reached a terminal state.

use crate::context::RequestContext;
use crate::state::StoreError;
use futures::future::BoxFuture;
use futures::FutureExt;
use hclsense_types::DirHandle;
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// Scheduler-assigned job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of job identifiers
pub type JobIds = Vec<JobId>;

/// Future returned by a job body
pub type JobFuture = BoxFuture<'static, Result<(), JobError>>;

/// The body of a job
pub type JobFunc = Box<dyn FnOnce(RequestContext) -> JobFuture + Send>;

/// Continuation run after the body, returning the IDs of any jobs it enqueued
pub type DeferFunc =
    Box<dyn FnOnce(&RequestContext, Option<&JobError>) -> Result<JobIds, JobError> + Send>;

/// Which worker set a job should run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPriority {
    Low,
    High,
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Low => f.write_str("low"),
            JobPriority::High => f.write_str("high"),
        }
    }
}

/// Returned by a job body when its stage is already done for `dir`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("{dir}: state not changed")]
pub struct StateNotChangedErr {
    pub dir: DirHandle,
}

/// Errors produced by job bodies and continuations
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    StateNotChanged(#[from] StateNotChangedErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn state_not_changed(dir: DirHandle) -> Self {
        JobError::StateNotChanged(StateNotChangedErr { dir })
    }

    pub fn failed(message: impl fmt::Display) -> Self {
        JobError::Failed(message.to_string())
    }

    pub fn is_state_not_changed(&self) -> bool {
        matches!(self, JobError::StateNotChanged(_))
    }

    /// Identity check keyed on the directory
    pub fn is_state_not_changed_for(&self, dir: &DirHandle) -> bool {
        matches!(self, JobError::StateNotChanged(err) if &err.dir == dir)
    }
}

impl PartialEq<StateNotChangedErr> for JobError {
    fn eq(&self, other: &StateNotChangedErr) -> bool {
        self.is_state_not_changed_for(&other.dir)
    }
}

/// A unit of work scoped to one directory
pub struct Job {
    pub dir: DirHandle,
    pub job_type: String,
    pub func: JobFunc,
    pub depends_on: JobIds,
    pub ignore_state: bool,
    pub priority: Option<JobPriority>,
    pub defer: Option<DeferFunc>,
}

impl Job {
    /// Create a new job running `func` for `dir`
    pub fn new<F, Fut>(dir: DirHandle, job_type: impl Into<String>, func: F) -> Self
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Job {
            dir,
            job_type: job_type.into(),
            func: Box::new(move |ctx| func(ctx).boxed()),
            depends_on: Vec::new(),
            ignore_state: false,
            priority: None,
            defer: None,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    pub fn ignore_state(mut self, ignore: bool) -> Self {
        self.ignore_state = ignore;
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Attach a continuation run after the body completes
    pub fn defer<D>(mut self, defer: D) -> Self
    where
        D: FnOnce(&RequestContext, Option<&JobError>) -> Result<JobIds, JobError> + Send + 'static,
    {
        self.defer = Some(Box::new(defer));
        self
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("dir", &self.dir)
            .field("job_type", &self.job_type)
            .field("depends_on", &self.depends_on)
            .field("ignore_state", &self.ignore_state)
            .field("priority", &self.priority)
            .field("has_defer", &self.defer.is_some())
            .finish()
    }
}

/// Whether cached stage state should be ignored for this request
pub fn ignore_state(ctx: &RequestContext) -> bool {
    ctx.ignore_state()
}

/// Copy of `ctx` with the ignore-state flag set
pub fn with_ignore_state(ctx: &RequestContext, ignore: bool) -> RequestContext {
    ctx.with_ignore_state(ignore)
}
