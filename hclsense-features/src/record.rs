//! Per-feature record store
//!
//! One [`Record`] per indexed directory, kept in a [`VersionedTable`].
//! Writers copy the current record, mutate the copy and install it in a
//! single transaction; readers only ever see complete records.

use crate::ast::{Diagnostics, Files, SourceDiagnostics};
use crate::references::{RefOrigin, RefTarget};
use hclsense_incremental::state::{Result, Snapshot};
use hclsense_incremental::{ChangeFlags, ChangeStore, Revision, StoreError, VersionedTable, WriteTxn};
use hclsense_types::{DiagnosticSource, DirHandle, OpState};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

/// Feature-specific metadata decoded from parsed files
pub trait Metadata: Clone + Default + Debug + Send + Sync + 'static {
    /// Provider source addresses this directory requires
    fn provider_requirements(&self) -> &BTreeSet<String>;
}

/// A pipeline stage tracked by its own [`OpState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Metadata,
    PreloadSchema,
    ReferenceTargets,
    ReferenceOrigins,
    Diagnostics(DiagnosticSource),
}

impl Stage {
    /// Parsing is tracked through its diagnostics source
    pub const PARSE: Stage = Stage::Diagnostics(DiagnosticSource::HclParsing);
    pub const SCHEMA_VALIDATION: Stage = Stage::Diagnostics(DiagnosticSource::SchemaValidation);
    pub const REFERENCE_VALIDATION: Stage =
        Stage::Diagnostics(DiagnosticSource::ReferenceValidation);
}

/// Accumulated analysis results of one directory
#[derive(Debug, Clone)]
pub struct Record<M> {
    pub path: String,

    pub parsed_files: Files,
    pub parsing_err: Option<String>,
    /// Parser output alone; `diagnostics` adds metadata findings on top
    pub parse_diagnostics: Diagnostics,

    pub meta: M,
    pub meta_err: Option<String>,
    pub meta_state: OpState,

    pub preload_embedded_schema_state: OpState,

    pub ref_targets: Vec<RefTarget>,
    pub ref_targets_err: Option<String>,
    pub ref_targets_state: OpState,

    pub ref_origins: Vec<RefOrigin>,
    pub ref_origins_err: Option<String>,
    pub ref_origins_state: OpState,

    pub diagnostics: SourceDiagnostics,
    pub diagnostics_state: BTreeMap<DiagnosticSource, OpState>,
}

impl<M: Default> Record<M> {
    pub fn new(path: impl Into<String>) -> Self {
        Record {
            path: path.into(),
            parsed_files: Files::new(),
            parsing_err: None,
            parse_diagnostics: Diagnostics::new(),
            meta: M::default(),
            meta_err: None,
            meta_state: OpState::Unknown,
            preload_embedded_schema_state: OpState::Unknown,
            ref_targets: Vec::new(),
            ref_targets_err: None,
            ref_targets_state: OpState::Unknown,
            ref_origins: Vec::new(),
            ref_origins_err: None,
            ref_origins_state: OpState::Unknown,
            diagnostics: SourceDiagnostics::new(),
            diagnostics_state: DiagnosticSource::ALL
                .into_iter()
                .map(|source| (source, OpState::Unknown))
                .collect(),
        }
    }
}

impl<M> Record<M> {
    pub fn state(&self, stage: Stage) -> OpState {
        match stage {
            Stage::Metadata => self.meta_state,
            Stage::PreloadSchema => self.preload_embedded_schema_state,
            Stage::ReferenceTargets => self.ref_targets_state,
            Stage::ReferenceOrigins => self.ref_origins_state,
            Stage::Diagnostics(source) => self
                .diagnostics_state
                .get(&source)
                .copied()
                .unwrap_or_default(),
        }
    }

    pub fn set_state(&mut self, stage: Stage, state: OpState) {
        match stage {
            Stage::Metadata => self.meta_state = state,
            Stage::PreloadSchema => self.preload_embedded_schema_state = state,
            Stage::ReferenceTargets => self.ref_targets_state = state,
            Stage::ReferenceOrigins => self.ref_origins_state = state,
            Stage::Diagnostics(source) => {
                self.diagnostics_state.insert(source, state);
            }
        }
    }

    pub fn dir(&self) -> DirHandle {
        DirHandle::from_path(&self.path)
    }
}

fn key(path: &str) -> String {
    DirHandle::from_path(path).as_str().to_string()
}

/// Versioned store of one feature's records
pub struct FeatureStore<M> {
    table: VersionedTable<Record<M>>,
    changes: Arc<ChangeStore>,
}

impl<M: Metadata> FeatureStore<M> {
    /// Create a new empty store; `name` labels the table in logs
    pub fn new(name: &'static str, changes: Arc<ChangeStore>) -> Self {
        FeatureStore {
            table: VersionedTable::new(name),
            changes,
        }
    }

    pub fn name(&self) -> &'static str {
        self.table.name()
    }

    pub fn revision(&self) -> Revision {
        self.table.revision()
    }

    pub fn snapshot(&self) -> Arc<Snapshot<Record<M>>> {
        self.table.snapshot()
    }

    fn queue_on_commit(&self, txn: &mut WriteTxn<Record<M>>, path: &str, flags: ChangeFlags) {
        if flags.is_empty() {
            return;
        }
        let changes = self.changes.clone();
        let dir = DirHandle::from_path(path);
        txn.on_commit(move || {
            if let Err(err) = changes.queue_change(dir.clone(), flags) {
                tracing::warn!(%dir, error = %err, "failed to queue change");
            }
        });
    }

    /// Index a new directory
    pub fn add(&self, path: &str) -> Result<()> {
        let key = key(path);
        self.table.write(|txn| {
            if txn.contains(&key) {
                return Err(StoreError::already_exists(key.clone()));
            }
            tracing::debug!(store = self.name(), path = %key, "record added");
            txn.insert(key.clone(), Record::new(key.clone()));
            Ok(())
        })
    }

    pub fn add_if_not_exists(&self, path: &str) -> Result<()> {
        match self.add(path) {
            Err(err) if err.is_already_exists() => Ok(()),
            other => other,
        }
    }

    /// Drop a directory's record; removing a missing path is a no-op
    pub fn remove(&self, path: &str) -> Result<()> {
        let key = key(path);
        self.table.write(|txn| {
            if let Some(old) = txn.remove(&key) {
                tracing::debug!(store = self.name(), path = %key, "record removed");
                let mut flags = ChangeFlags::removal();
                flags.diagnostics = old.diagnostics.count() > 0;
                self.queue_on_commit(txn, &key, flags);
            }
            Ok(())
        })
    }

    pub fn record_by_path(&self, path: &str) -> Result<Arc<Record<M>>> {
        let key = key(path);
        self.table
            .snapshot()
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::record_not_found(key))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.table.snapshot().contains(&key(path))
    }

    /// Every record, in path order
    pub fn list(&self) -> Result<Vec<Arc<Record<M>>>> {
        Ok(self.table.snapshot().values().cloned().collect())
    }

    /// Copy, mutate and reinstall the record at `path`
    fn update(
        &self,
        path: &str,
        flags: ChangeFlags,
        mutate: impl FnOnce(&mut Record<M>),
    ) -> Result<()> {
        let key = key(path);
        self.table.write(|txn| {
            let mut record = txn
                .get_copy(&key)
                .ok_or_else(|| StoreError::record_not_found(key.clone()))?;
            let before = record.diagnostics.count();
            mutate(&mut record);
            let after = record.diagnostics.count();
            txn.insert(key.clone(), record);

            let mut flags = flags;
            if flags.diagnostics {
                flags.diagnostics = before > 0 || after > 0;
            }
            self.queue_on_commit(txn, &key, flags);
            Ok(())
        })
    }

    pub fn set_state(&self, path: &str, stage: Stage, state: OpState) -> Result<()> {
        self.update(path, ChangeFlags::default(), |record| {
            record.set_state(stage, state)
        })
    }

    pub fn set_meta_state(&self, path: &str, state: OpState) -> Result<()> {
        self.set_state(path, Stage::Metadata, state)
    }

    pub fn set_preload_embedded_schema_state(&self, path: &str, state: OpState) -> Result<()> {
        self.set_state(path, Stage::PreloadSchema, state)
    }

    pub fn set_reference_targets_state(&self, path: &str, state: OpState) -> Result<()> {
        self.set_state(path, Stage::ReferenceTargets, state)
    }

    pub fn set_reference_origins_state(&self, path: &str, state: OpState) -> Result<()> {
        self.set_state(path, Stage::ReferenceOrigins, state)
    }

    pub fn set_diagnostics_state(
        &self,
        path: &str,
        source: DiagnosticSource,
        state: OpState,
    ) -> Result<()> {
        self.set_state(path, Stage::Diagnostics(source), state)
    }

    /// Claim `stage` for the caller
    ///
    /// In one transaction: if the stage is not `Unknown` and `ignore_state`
    /// is unset, nothing is written and `None` is returned. Otherwise the
    /// stage is set to `Loading` and its previous state returned. Concurrent
    /// callers therefore see at most one `Some` per stage run.
    pub fn begin_stage(
        &self,
        path: &str,
        stage: Stage,
        ignore_state: bool,
    ) -> Result<Option<OpState>> {
        let key = key(path);
        self.table.write(|txn| {
            let current = txn
                .get(&key)
                .ok_or_else(|| StoreError::record_not_found(key.clone()))?;
            let previous = current.state(stage);
            if previous != OpState::Unknown && !ignore_state {
                return Ok(None);
            }
            let mut record = Record::clone(&current);
            record.set_state(stage, OpState::Loading);
            txn.insert(key.clone(), record);
            Ok(Some(previous))
        })
    }

    pub fn update_parsed_files(&self, path: &str, files: Files, err: Option<String>) -> Result<()> {
        self.update(path, ChangeFlags::default(), |record| {
            record.parsed_files = files;
            record.parsing_err = err;
        })
    }

    /// Record parser diagnostics and publish them as the parsing source
    pub fn update_parse_diagnostics(&self, path: &str, diags: Diagnostics) -> Result<()> {
        self.update(path, ChangeFlags::diagnostics(), |record| {
            record.parse_diagnostics = diags.clone();
            record.diagnostics.insert(DiagnosticSource::HclParsing, diags);
            record.set_state(Stage::PARSE, OpState::Loaded);
        })
    }

    /// Publish the parser diagnostics plus `meta_diags` as the parsing source
    ///
    /// Rebuilt from `parse_diagnostics` each time, so findings of an earlier
    /// metadata run never linger. The parse stage state is left alone.
    pub fn update_metadata_diagnostics(&self, path: &str, meta_diags: Diagnostics) -> Result<()> {
        self.update(path, ChangeFlags::diagnostics(), |record| {
            let mut diags = record.parse_diagnostics.clone();
            for (file, file_diags) in meta_diags {
                diags.entry(file).or_default().extend(file_diags);
            }
            record.diagnostics.insert(DiagnosticSource::HclParsing, diags);
        })
    }

    /// Replace the diagnostics of one source and mark it `Loaded`
    pub fn update_diagnostics(
        &self,
        path: &str,
        source: DiagnosticSource,
        diags: Diagnostics,
    ) -> Result<()> {
        self.update(path, ChangeFlags::diagnostics(), |record| {
            record.diagnostics.insert(source, diags);
            record.set_state(Stage::Diagnostics(source), OpState::Loaded);
        })
    }

    pub fn update_metadata(&self, path: &str, meta: M, err: Option<String>) -> Result<()> {
        let flags = ChangeFlags {
            metadata: true,
            ..Default::default()
        };
        self.update(path, flags, |record| {
            record.meta = meta;
            record.meta_err = err;
            record.meta_state = OpState::Loaded;
        })
    }

    pub fn update_reference_targets(
        &self,
        path: &str,
        targets: Vec<RefTarget>,
        err: Option<String>,
    ) -> Result<()> {
        let flags = ChangeFlags {
            reference_targets: true,
            ..Default::default()
        };
        self.update(path, flags, |record| {
            record.ref_targets = targets;
            record.ref_targets_err = err;
            record.ref_targets_state = OpState::Loaded;
        })
    }

    pub fn update_reference_origins(
        &self,
        path: &str,
        origins: Vec<RefOrigin>,
        err: Option<String>,
    ) -> Result<()> {
        let flags = ChangeFlags {
            reference_origins: true,
            ..Default::default()
        };
        self.update(path, flags, |record| {
            record.ref_origins = origins;
            record.ref_origins_err = err;
            record.ref_origins_state = OpState::Loaded;
        })
    }

    /// Provider requirements recorded in the metadata of `path`
    pub fn provider_requirements(&self, path: &str) -> Result<BTreeSet<String>> {
        Ok(self.record_by_path(path)?.meta.provider_requirements().clone())
    }
}

impl<M> Debug for FeatureStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore")
            .field("table", &self.table)
            .finish()
    }
}
