//! Feature controller
//!
//! A [`Feature`] owns one [`FeatureStore`], subscribes to the event bus and
//! turns each event into a dependency chain of jobs:
//!
//! ```text
//! parse → metadata ─defer→ preload schema → reference targets ─┐
//!                                         → reference origins ─┴→ validate
//! ```
//!
//! Directories the metadata points at (local module sources) are decoded
//! from the same continuation, one level deep and without validation; the
//! reference stages wait for them.

use crate::dialect::{is_ignored_file, Dialect};
use crate::filesystem::ReadOnlyFs;
use crate::jobs::{self, op};
use crate::record::FeatureStore;
use crate::schemas::SchemaStore;
use hclsense_incremental::{
    ChangeStore, DidChangeEvent, DidChangeWatchedEvent, DidOpenEvent, DiscoverEvent, EventBus,
    Job, JobId, JobIds, JobStore, RequestContext, StoreError,
};
use hclsense_types::{DirHandle, FileChangeType, OpState};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

fn job_type<D: Dialect>(op: &str) -> String {
    format!("{}.{}", D::NAME, op)
}

/// Everything a feature's job bodies need, cheap to clone into closures
pub struct Pipeline<D: Dialect> {
    pub store: Arc<FeatureStore<D::Meta>>,
    pub dialect: Arc<D>,
    fs: Arc<dyn ReadOnlyFs>,
    schemas: Arc<SchemaStore>,
    jobs: Arc<JobStore>,
}

impl<D: Dialect> Clone for Pipeline<D> {
    fn clone(&self) -> Self {
        Pipeline {
            store: self.store.clone(),
            dialect: self.dialect.clone(),
            fs: self.fs.clone(),
            schemas: self.schemas.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl<D: Dialect> Pipeline<D> {
    pub fn new(
        dialect: D,
        changes: Arc<ChangeStore>,
        fs: Arc<dyn ReadOnlyFs>,
        schemas: Arc<SchemaStore>,
        jobs: Arc<JobStore>,
    ) -> Self {
        Pipeline {
            store: Arc::new(FeatureStore::new(D::NAME, changes)),
            dialect: Arc::new(dialect),
            fs,
            schemas,
            jobs,
        }
    }

    /// Enqueue the parse and metadata jobs for `dir`
    ///
    /// The remaining stages are enqueued by the metadata job's continuation
    /// and show up as its deferred children.
    pub fn decode(
        &self,
        ctx: &RequestContext,
        dir: &DirHandle,
        ignore_state: bool,
    ) -> Result<JobIds, StoreError> {
        self.decode_at(ctx, dir, ignore_state, true)
    }

    /// `first_level` is unset for directories decoded on behalf of another
    /// one; those neither validate nor follow their own nested directories
    fn decode_at(
        &self,
        ctx: &RequestContext,
        dir: &DirHandle,
        ignore_state: bool,
        first_level: bool,
    ) -> Result<JobIds, StoreError> {
        let mut ids = JobIds::new();

        let p = self.clone();
        let d = dir.clone();
        let parse_id = self.jobs.enqueue_job(
            ctx,
            Job::new(dir.clone(), job_type::<D>(op::PARSE_CONFIGURATION), move |ctx| async move {
                jobs::parse_configuration(&ctx, &*p.fs, &*p.store, &*p.dialect, &d)
            })
            .ignore_state(ignore_state),
        )?;
        ids.push(parse_id);

        let validation = ctx.validation();

        let p = self.clone();
        let d = dir.clone();
        let deferred = self.clone();
        let deferred_dir = dir.clone();
        let meta_id = self.jobs.enqueue_job(
            ctx,
            Job::new(dir.clone(), job_type::<D>(op::LOAD_METADATA), move |ctx| async move {
                jobs::load_metadata(&ctx, &*p.store, &*p.dialect, &d)
            })
            .depends_on([parse_id])
            .ignore_state(ignore_state)
            .defer(move |ctx, err| {
                if let Some(err) = err {
                    tracing::debug!(dir = %deferred_dir, error = %err, "loading metadata returned error");
                    if err.is_state_not_changed() && !deferred.metadata_loaded(&deferred_dir) {
                        // the job that owns the metadata stage enqueues the rest
                        return Ok(JobIds::new());
                    }
                }
                let nested = if first_level {
                    deferred.decode_nested_dirs(ctx, &deferred_dir, ignore_state)?
                } else {
                    JobIds::new()
                };
                let validate = first_level && validation.enable_enhanced_validation;
                let mut ids = deferred.enqueue_after_metadata(
                    ctx,
                    &deferred_dir,
                    ignore_state,
                    validate,
                    &nested,
                )?;
                ids.extend(nested);
                Ok(ids)
            }),
        )?;
        ids.push(meta_id);

        Ok(ids)
    }

    fn metadata_loaded(&self, dir: &DirHandle) -> bool {
        self.store
            .record_by_path(dir.as_str())
            .is_ok_and(|record| record.meta_state == OpState::Loaded)
    }

    /// Index and decode the directories the metadata of `dir` points at
    ///
    /// A directory that is already indexed is decoded without forcing its
    /// stages.
    fn decode_nested_dirs(
        &self,
        ctx: &RequestContext,
        dir: &DirHandle,
        ignore_state: bool,
    ) -> Result<JobIds, StoreError> {
        let record = match self.store.record_by_path(dir.as_str()) {
            Ok(record) => record,
            Err(err) if err.is_record_not_found() => return Ok(JobIds::new()),
            Err(err) => return Err(err),
        };

        let mut ids = JobIds::new();
        for path in self.dialect.nested_dirs(dir, &record.meta) {
            let nested = DirHandle::from_path(&path);
            if nested == *dir || !path.is_dir() {
                continue;
            }
            let nested_ignore_state = match self.store.add(nested.as_str()) {
                Ok(()) => ignore_state,
                Err(err) if err.is_already_exists() => false,
                Err(err) => return Err(err),
            };
            tracing::debug!(feature = D::NAME, %dir, %nested, "decoding nested directory");
            ids.extend(self.decode_at(ctx, &nested, nested_ignore_state, false)?);
        }
        Ok(ids)
    }

    fn enqueue_after_metadata(
        &self,
        ctx: &RequestContext,
        dir: &DirHandle,
        ignore_state: bool,
        enhanced_validation: bool,
        nested: &[JobId],
    ) -> Result<JobIds, StoreError> {
        let mut ids = JobIds::new();

        let p = self.clone();
        let d = dir.clone();
        let schema_id = self.jobs.enqueue_job(
            ctx,
            Job::new(dir.clone(), job_type::<D>(op::PRELOAD_EMBEDDED_SCHEMA), move |ctx| async move {
                jobs::preload_embedded_schema(&ctx, &*p.store, &*p.dialect, &p.schemas, &d)
            })
            .ignore_state(ignore_state),
        )?;
        ids.push(schema_id);

        let mut reference_deps = vec![schema_id];
        reference_deps.extend_from_slice(nested);

        let p = self.clone();
        let d = dir.clone();
        let targets_id = self.jobs.enqueue_job(
            ctx,
            Job::new(dir.clone(), job_type::<D>(op::DECODE_REFERENCE_TARGETS), move |ctx| async move {
                jobs::wait_for_upstream(&*p.dialect, &d, jobs::UPSTREAM_TIMEOUT).await;
                jobs::decode_reference_targets(&ctx, &*p.store, &*p.dialect, &d)
            })
            .depends_on(reference_deps.clone())
            .ignore_state(ignore_state),
        )?;
        ids.push(targets_id);

        let p = self.clone();
        let d = dir.clone();
        let origins_id = self.jobs.enqueue_job(
            ctx,
            Job::new(dir.clone(), job_type::<D>(op::DECODE_REFERENCE_ORIGINS), move |ctx| async move {
                jobs::decode_reference_origins(&ctx, &*p.store, &*p.dialect, &d)
            })
            .depends_on(reference_deps)
            .ignore_state(ignore_state),
        )?;
        ids.push(origins_id);

        if enhanced_validation {
            let p = self.clone();
            let d = dir.clone();
            let validate_id = self.jobs.enqueue_job(
                ctx,
                Job::new(dir.clone(), job_type::<D>(op::VALIDATE), move |ctx| async move {
                    jobs::wait_for_upstream(&*p.dialect, &d, jobs::UPSTREAM_TIMEOUT).await;
                    jobs::validate(&ctx, &*p.store, &*p.dialect, &p.schemas, &d)
                })
                .depends_on([targets_id, origins_id])
                .ignore_state(ignore_state),
            )?;
            ids.push(validate_id);
        }

        Ok(ids)
    }
}

/// A feature: one record store plus the event handlers feeding it
pub struct Feature<D: Dialect> {
    pipeline: Pipeline<D>,
    bus: Arc<EventBus>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialect> Feature<D> {
    /// Create a new feature; call [`Feature::start`] to subscribe it
    pub fn new(
        dialect: D,
        bus: Arc<EventBus>,
        changes: Arc<ChangeStore>,
        fs: Arc<dyn ReadOnlyFs>,
        schemas: Arc<SchemaStore>,
        jobs: Arc<JobStore>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Feature {
            pipeline: Pipeline::new(dialect, changes, fs, schemas, jobs),
            bus,
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<FeatureStore<D::Meta>> {
        &self.pipeline.store
    }

    pub fn dialect(&self) -> &D {
        &self.pipeline.dialect
    }

    pub fn pipeline(&self) -> &Pipeline<D> {
        &self.pipeline
    }

    /// Subscribe to the event bus and spawn the dispatch loop
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let topic = format!("feature.{}", D::NAME);
        let (open_done_tx, open_done_rx) = mpsc::channel(1);
        let (change_done_tx, change_done_rx) = mpsc::channel(1);
        let (watched_done_tx, watched_done_rx) = mpsc::channel(1);

        let mut discover = self.bus.on_discover(&topic, None);
        let mut did_open = self.bus.on_did_open(&topic, Some(open_done_rx));
        let mut did_change = self.bus.on_did_change(&topic, Some(change_done_rx));
        let mut did_change_watched = self
            .bus
            .on_did_change_watched(&topic, Some(watched_done_rx));

        let feature = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(feature = D::NAME, "feature started");

        *task = Some(tokio::spawn(async move {
            loop {
                // every arm must answer on its done channel, even with no
                // jobs, or the publisher waits forever
                tokio::select! {
                    Some(event) = discover.recv() => {
                        if let Err(err) = feature.discover(&event) {
                            tracing::warn!(feature = D::NAME, error = %err, "discover failed");
                        }
                    }
                    Some(event) = did_open.recv() => {
                        let ids = feature.did_open(&event).unwrap_or_else(|err| {
                            tracing::warn!(feature = D::NAME, error = %err, "did open failed");
                            JobIds::new()
                        });
                        if open_done_tx.send(ids).await.is_err() {
                            break;
                        }
                    }
                    Some(event) = did_change.recv() => {
                        let ids = feature.did_change(&event).unwrap_or_else(|err| {
                            tracing::warn!(feature = D::NAME, error = %err, "did change failed");
                            JobIds::new()
                        });
                        if change_done_tx.send(ids).await.is_err() {
                            break;
                        }
                    }
                    Some(event) = did_change_watched.recv() => {
                        let ids = feature.did_change_watched(&event).unwrap_or_else(|err| {
                            tracing::warn!(feature = D::NAME, error = %err, "did change watched failed");
                            JobIds::new()
                        });
                        if watched_done_tx.send(ids).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                    else => break,
                }
            }
            tracing::debug!(feature = D::NAME, "feature stopped");
        }));
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop and wait for the dispatch loop to exit
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(feature = D::NAME, error = %err, "feature terminated abnormally");
            }
        }
    }

    /// Index `event.path` if any of its files belong to this feature
    pub fn discover(&self, event: &DiscoverEvent) -> Result<(), StoreError> {
        let relevant = event
            .files
            .iter()
            .any(|file| !is_ignored_file(file) && self.dialect().is_relevant_file(file));
        if !relevant {
            return Ok(());
        }
        let dir = DirHandle::from_path(&event.path);
        tracing::debug!(feature = D::NAME, %dir, "discovered configuration");
        self.store().add_if_not_exists(dir.as_str())
    }

    pub fn did_open(&self, event: &DidOpenEvent) -> Result<JobIds, StoreError> {
        if !self.dialect().is_relevant_language(&event.language_id) {
            return Ok(JobIds::new());
        }
        tracing::debug!(feature = D::NAME, dir = %event.dir, "did open");
        self.store().add_if_not_exists(event.dir.as_str())?;
        self.pipeline.decode(&event.context, &event.dir, false)
    }

    pub fn did_change(&self, event: &DidChangeEvent) -> Result<JobIds, StoreError> {
        if !self.store().exists(event.dir.as_str()) {
            return Ok(JobIds::new());
        }
        self.pipeline.decode(&event.context, &event.dir, true)
    }

    pub fn did_change_watched(&self, event: &DidChangeWatchedEvent) -> Result<JobIds, StoreError> {
        let raw = event.raw_path.as_path();
        match event.change_type {
            FileChangeType::Deleted => {
                // the path may have been a directory or a file; try both
                let as_dir = DirHandle::from_path(raw);
                if self.store().exists(as_dir.as_str()) {
                    self.remove_indexed(&as_dir)?;
                    return Ok(JobIds::new());
                }

                let Some(parent) = raw.parent().map(DirHandle::from_path) else {
                    return Ok(JobIds::new());
                };
                if !self.store().exists(parent.as_str()) {
                    return Ok(JobIds::new());
                }

                match std::fs::metadata(parent.path()) {
                    Ok(meta) if meta.is_dir() => {
                        self.pipeline.decode(&event.context, &parent, true)
                    }
                    Ok(_) => {
                        tracing::warn!(feature = D::NAME, dir = %parent, "deleted path's parent is not a directory");
                        Ok(JobIds::new())
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        self.remove_indexed(&parent)?;
                        Ok(JobIds::new())
                    }
                    Err(err) => {
                        tracing::warn!(feature = D::NAME, dir = %parent, error = %err, "failed to check directory");
                        Ok(JobIds::new())
                    }
                }
            }
            FileChangeType::Created | FileChangeType::Changed => {
                let dir = if event.is_dir {
                    DirHandle::from_path(raw)
                } else {
                    match raw.parent() {
                        Some(parent) => DirHandle::from_path(parent),
                        None => return Ok(JobIds::new()),
                    }
                };
                if !self.store().exists(dir.as_str()) {
                    return Ok(JobIds::new());
                }
                self.pipeline.decode(&event.context, &dir, true)
            }
        }
    }

    /// Drop queued work for `dir`, then its record
    pub fn remove_indexed(&self, dir: &DirHandle) -> Result<(), StoreError> {
        tracing::debug!(feature = D::NAME, %dir, "removing indexed directory");
        self.pipeline.jobs.dequeue_jobs_for_dir(dir)?;
        self.store().remove(dir.as_str())
    }
}

impl<D: Dialect> Drop for Feature<D> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<D: Dialect> std::fmt::Debug for Feature<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature")
            .field("name", &D::NAME)
            .field("store", &self.pipeline.store)
            .finish()
    }
}

impl<D: Dialect> std::fmt::Debug for Pipeline<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &D::NAME)
            .field("store", &self.store)
            .finish()
    }
}
