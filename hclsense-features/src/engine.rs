//! Engine assembly
//!
//! Wires the shared stores, the event bus, the enabled features, two
//! scheduler pools (open-document work and background work) and the change
//! notifier into one handle.

use crate::config::Settings;
use crate::dialect::is_ignored_file;
use crate::feature::Feature;
use crate::filesystem::{DocumentOverlayFs, ReadOnlyFs};
use crate::modules::ModulesDialect;
use crate::record::FeatureStore;
use crate::schemas::SchemaStore;
use crate::search::{is_search_file, SearchDialect};
use crate::stacks::{is_deploy_file, is_stack_file, StacksDialect};
use crate::variables::{is_vars_file, VariablesDialect};
use hclsense_incremental::{
    DidChangeEvent, DidChangeWatchedEvent, DidOpenEvent, DiscoverEvent, EventBus, Hook, JobId, JobIds,
    JobPriority, Notifier, RequestContext, Scheduler, StateStore,
};
use hclsense_types::{
    language, Diagnostic, DiagnosticSource, DirHandle, DocumentContext, DocumentHandle,
    FileChangeType, RequestMethod,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Document is not open: {0}")]
    DocumentNotOpen(DocumentHandle),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// One diagnostic together with where it came from
#[derive(Debug, Clone, Serialize)]
pub struct DirDiagnostic {
    pub feature: &'static str,
    pub dir: String,
    pub source: DiagnosticSource,
    #[serde(flatten)]
    pub diagnostic: Diagnostic,
}

/// Language id of a file name, if any feature handles it
pub fn language_for_file(name: &str) -> Option<&'static str> {
    if is_ignored_file(name) {
        None
    } else if is_search_file(name) {
        Some(language::SEARCH)
    } else if is_deploy_file(name) {
        Some(language::DEPLOY)
    } else if is_stack_file(name) {
        Some(language::STACK)
    } else if name.ends_with(".tf") {
        Some(language::TERRAFORM)
    } else if is_vars_file(name) {
        Some(language::VARS)
    } else {
        None
    }
}

/// Which feature handles a language
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FeatureKind {
    Modules,
    Stacks,
    Search,
    Variables,
}

fn feature_for_language(language_id: &str) -> Option<FeatureKind> {
    match language_id {
        language::TERRAFORM => Some(FeatureKind::Modules),
        language::STACK | language::DEPLOY => Some(FeatureKind::Stacks),
        language::SEARCH => Some(FeatureKind::Search),
        language::VARS => Some(FeatureKind::Variables),
        _ => None,
    }
}

/// The analysis engine
pub struct Engine {
    settings: Settings,
    state: StateStore,
    bus: Arc<EventBus>,
    schemas: Arc<SchemaStore>,
    modules: Option<Arc<Feature<ModulesDialect>>>,
    stacks: Option<Arc<Feature<StacksDialect>>>,
    search: Option<Arc<Feature<SearchDialect>>>,
    variables: Option<Arc<Feature<VariablesDialect>>>,
    high: Scheduler,
    low: Scheduler,
    notifier: Notifier,
    has_hooks: bool,
}

impl Engine {
    /// Create a new engine; nothing runs until [`Engine::start`]
    pub fn new(settings: Settings, hooks: Vec<Hook>) -> Self {
        let state = StateStore::with_limits(
            settings.jobs.outcome_cache_size,
            settings.max_change_timespan(),
        );
        let bus = Arc::new(EventBus::new());
        let schemas = Arc::new(SchemaStore::new());
        let fs: Arc<dyn ReadOnlyFs> = Arc::new(DocumentOverlayFs::new(state.documents.clone()));

        let modules = settings.features.modules.then(|| {
            Feature::new(
                ModulesDialect,
                bus.clone(),
                state.changes.clone(),
                fs.clone(),
                schemas.clone(),
                state.jobs.clone(),
            )
        });
        let stacks = settings.features.stacks.then(|| {
            Feature::new(
                StacksDialect,
                bus.clone(),
                state.changes.clone(),
                fs.clone(),
                schemas.clone(),
                state.jobs.clone(),
            )
        });
        let search = settings.features.search.then(|| {
            let module_store = modules.as_ref().map(|m| m.store().clone());
            Feature::new(
                SearchDialect::new(module_store),
                bus.clone(),
                state.changes.clone(),
                fs.clone(),
                schemas.clone(),
                state.jobs.clone(),
            )
        });
        let variables = settings.features.variables.then(|| {
            let module_store = modules.as_ref().map(|m| m.store().clone());
            Feature::new(
                VariablesDialect::new(module_store),
                bus.clone(),
                state.changes.clone(),
                fs.clone(),
                schemas.clone(),
                state.jobs.clone(),
            )
        });

        let parallelism = settings.indexing.parallelism;
        let high = Scheduler::new(state.jobs.clone(), parallelism).with_priority(JobPriority::High);
        let low = Scheduler::new(state.jobs.clone(), parallelism).with_priority(JobPriority::Low);
        let has_hooks = !hooks.is_empty();
        let notifier = Notifier::new(state.changes.clone(), hooks);

        Engine {
            settings,
            state,
            bus,
            schemas,
            modules,
            stacks,
            search,
            variables,
            high,
            low,
            notifier,
            has_hooks,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn schemas(&self) -> &Arc<SchemaStore> {
        &self.schemas
    }

    pub fn modules(&self) -> Option<&Arc<Feature<ModulesDialect>>> {
        self.modules.as_ref()
    }

    pub fn stacks(&self) -> Option<&Arc<Feature<StacksDialect>>> {
        self.stacks.as_ref()
    }

    pub fn search(&self) -> Option<&Arc<Feature<SearchDialect>>> {
        self.search.as_ref()
    }

    pub fn variables(&self) -> Option<&Arc<Feature<VariablesDialect>>> {
        self.variables.as_ref()
    }

    /// `None` when the feature is disabled
    fn holds(&self, kind: FeatureKind, dir: &DirHandle) -> Option<bool> {
        let path = dir.as_str();
        match kind {
            FeatureKind::Modules => self.modules.as_ref().map(|f| f.store().exists(path)),
            FeatureKind::Stacks => self.stacks.as_ref().map(|f| f.store().exists(path)),
            FeatureKind::Search => self.search.as_ref().map(|f| f.store().exists(path)),
            FeatureKind::Variables => self.variables.as_ref().map(|f| f.store().exists(path)),
        }
    }

    /// Whether any feature holds a record for `dir`
    pub fn is_indexed(&self, dir: &DirHandle) -> bool {
        [
            FeatureKind::Modules,
            FeatureKind::Stacks,
            FeatureKind::Search,
            FeatureKind::Variables,
        ]
        .into_iter()
        .any(|kind| self.holds(kind, dir) == Some(true))
    }

    /// Whether the feature handling `language_id` holds a record for `dir`
    ///
    /// Also true when no enabled feature handles the language, since there
    /// is nothing left to index.
    pub fn is_indexed_for(&self, dir: &DirHandle, language_id: &str) -> bool {
        feature_for_language(language_id)
            .and_then(|kind| self.holds(kind, dir))
            .unwrap_or(true)
    }

    /// The directory a watched change should index, if any
    ///
    /// A new directory is indexed when no feature knows it yet. A new or
    /// changed file is indexed when the feature handling its language has
    /// no record for the file's directory, even if other features do.
    pub fn dir_to_index(
        &self,
        path: &Path,
        change_type: FileChangeType,
        is_dir: bool,
    ) -> Option<PathBuf> {
        if change_type == FileChangeType::Deleted {
            return None;
        }
        if is_dir {
            let indexed = self.is_indexed(&DirHandle::from_path(path));
            return (!indexed).then(|| path.to_path_buf());
        }
        let language_id = path.file_name()?.to_str().and_then(language_for_file)?;
        let dir = path.parent()?;
        let indexed = self.is_indexed_for(&DirHandle::from_path(dir), language_id);
        (!indexed).then(|| dir.to_path_buf())
    }

    /// Base request context carrying the configured validation options
    pub fn context(&self) -> RequestContext {
        RequestContext::new().with_validation(self.settings.validation_options())
    }

    /// Subscribe features and spawn workers and the notifier
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if let Some(feature) = &self.modules {
            feature.start();
        }
        if let Some(feature) = &self.stacks {
            feature.start();
        }
        if let Some(feature) = &self.search {
            feature.start();
        }
        if let Some(feature) = &self.variables {
            feature.start();
        }
        self.high.start();
        self.low.start();
        // without hooks the change queue is left for the caller to drain
        if self.has_hooks {
            self.notifier.start();
        }
        tracing::info!(
            modules = self.modules.is_some(),
            stacks = self.stacks.is_some(),
            search = self.search.is_some(),
            variables = self.variables.is_some(),
            "engine started"
        );
    }

    pub async fn shutdown(&self) {
        self.notifier.shutdown().await;
        self.high.shutdown().await;
        self.low.shutdown().await;
        if let Some(feature) = &self.modules {
            feature.shutdown().await;
        }
        if let Some(feature) = &self.stacks {
            feature.shutdown().await;
        }
        if let Some(feature) = &self.search {
            feature.shutdown().await;
        }
        if let Some(feature) = &self.variables {
            feature.shutdown().await;
        }
        tracing::info!("engine stopped");
    }

    /// Discover and decode one directory given the names of its files
    ///
    /// Each feature is opened once, however many of its languages the
    /// directory holds, and modules before the features reading them.
    pub async fn index_dir(&self, dir: &Path, files: Vec<String>) -> JobIds {
        let mut owners = BTreeMap::new();
        for language_id in files.iter().filter_map(|f| language_for_file(f)) {
            if let Some(kind) = feature_for_language(language_id) {
                owners.entry(kind).or_insert(language_id);
            }
        }
        if owners.is_empty() {
            return JobIds::new();
        }

        self.bus
            .discover(DiscoverEvent {
                path: dir.to_path_buf(),
                files,
            })
            .await;

        let handle = DirHandle::from_path(dir);
        let mut ids = JobIds::new();
        for language_id in owners.into_values() {
            ids.extend(
                self.bus
                    .did_open(DidOpenEvent {
                        context: self.context(),
                        dir: handle.clone(),
                        language_id: language_id.to_string(),
                    })
                    .await,
            );
        }
        ids
    }

    /// Walk `root` and index every directory holding relevant files
    pub async fn index_tree(&self, root: &Path) -> Result<JobIds> {
        let mut ids = JobIds::new();
        for (dir, files) in self.walk(root)? {
            ids.extend(self.index_dir(&dir, files).await);
        }
        Ok(ids)
    }

    fn walk(&self, root: &Path) -> Result<Vec<(PathBuf, Vec<String>)>> {
        let mut dirs = Vec::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| self.settings.is_ignored_dir_name(name))
            });

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let mut files = Vec::new();
            for child in std::fs::read_dir(entry.path())? {
                let child = child?;
                if child.file_type()?.is_file() {
                    if let Some(name) = child.file_name().to_str() {
                        files.push(name.to_string());
                    }
                }
            }
            if files.iter().any(|f| language_for_file(f).is_some()) {
                files.sort();
                dirs.push((entry.path().to_path_buf(), files));
            }
        }
        Ok(dirs)
    }

    /// Track an editor-opened document and decode its directory
    pub async fn open_document(
        &self,
        path: &Path,
        language_id: &str,
        version: i32,
        text: impl Into<Arc<str>>,
    ) -> JobIds {
        let handle = DocumentHandle::from_path(path);
        self.state
            .documents
            .open_document(handle.clone(), language_id, version, text);

        let dir = handle.dir.clone();
        let context = self.context().with_document(DocumentContext::new(
            RequestMethod::DidOpen,
            handle,
            language_id,
        ));
        self.bus
            .did_open(DidOpenEvent {
                context,
                dir,
                language_id: language_id.to_string(),
            })
            .await
    }

    /// Apply new text to an open document and re-decode its directory
    pub async fn change_document(
        &self,
        path: &Path,
        version: i32,
        text: impl Into<Arc<str>>,
    ) -> Result<JobIds> {
        let handle = DocumentHandle::from_path(path);
        let document = self
            .state
            .documents
            .get_document(&handle)
            .ok_or_else(|| EngineError::DocumentNotOpen(handle.clone()))?;
        self.state.documents.update_document(&handle, text, version);

        let dir = handle.dir.clone();
        let context = self.context().with_document(DocumentContext::new(
            RequestMethod::DidChange,
            handle,
            document.language_id.clone(),
        ));
        Ok(self
            .bus
            .did_change(DidChangeEvent {
                context,
                dir,
                language_id: document.language_id,
            })
            .await)
    }

    pub fn close_document(&self, path: &Path) {
        self.state
            .documents
            .close_document(&DocumentHandle::from_path(path));
    }

    /// Forward a file system notification to the features
    pub async fn did_change_watched(
        &self,
        path: PathBuf,
        change_type: FileChangeType,
        is_dir: bool,
    ) -> JobIds {
        tracing::debug!(path = %path.display(), %change_type, "watched file changed");
        self.bus
            .did_change_watched(DidChangeWatchedEvent {
                context: self.context(),
                raw_path: path,
                change_type,
                is_dir,
            })
            .await
    }

    /// Wait until `ids` and everything they deferred are done, then until
    /// no job is left at all
    pub async fn wait(&self, ids: &[JobId]) {
        self.state.jobs.wait_for_jobs(ids).await;
        self.state.jobs.wait_until_idle().await;
    }

    /// All diagnostics held by every feature, ordered by directory
    pub fn diagnostics(&self) -> Vec<DirDiagnostic> {
        let mut out = Vec::new();
        if let Some(feature) = &self.modules {
            collect_diagnostics(feature.store(), &mut out);
        }
        if let Some(feature) = &self.stacks {
            collect_diagnostics(feature.store(), &mut out);
        }
        if let Some(feature) = &self.search {
            collect_diagnostics(feature.store(), &mut out);
        }
        if let Some(feature) = &self.variables {
            collect_diagnostics(feature.store(), &mut out);
        }
        out.sort_by(|a, b| {
            (&a.dir, &a.diagnostic.range.filename, a.diagnostic.range.start.line)
                .cmp(&(&b.dir, &b.diagnostic.range.filename, b.diagnostic.range.start.line))
        });
        out
    }
}

fn collect_diagnostics<M: crate::record::Metadata>(
    store: &FeatureStore<M>,
    out: &mut Vec<DirDiagnostic>,
) {
    for record in store.snapshot().values() {
        for (source, diagnostic) in record.diagnostics.all() {
            out.push(DirDiagnostic {
                feature: store.name(),
                dir: record.path.clone(),
                source,
                diagnostic: diagnostic.clone(),
            });
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("modules", &self.modules)
            .field("stacks", &self.stacks)
            .field("search", &self.search)
            .field("variables", &self.variables)
            .field("high", &self.high)
            .field("low", &self.low)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_for_file() {
        assert_eq!(language_for_file("main.tf"), Some(language::TERRAFORM));
        assert_eq!(language_for_file("a.tfcomponent.hcl"), Some(language::STACK));
        assert_eq!(language_for_file("a.tfstack.hcl"), Some(language::STACK));
        assert_eq!(language_for_file("prod.tfdeploy.hcl"), Some(language::DEPLOY));
        assert_eq!(language_for_file("q.tfquery.hcl"), Some(language::SEARCH));
        assert_eq!(language_for_file("prod.auto.tfvars"), Some(language::VARS));
        assert_eq!(language_for_file(".main.tf"), None);
        assert_eq!(language_for_file("README.md"), None);
    }

    #[test]
    fn test_features_follow_toggles() {
        let mut settings = Settings::default();
        settings.features.stacks = false;
        let engine = Engine::new(settings, Vec::new());

        assert!(engine.modules().is_some());
        assert!(engine.stacks().is_none());
        assert!(engine.search().is_some());
        assert!(engine.variables().is_some());
    }

    #[test]
    fn test_languages_map_to_one_feature() {
        assert_eq!(feature_for_language(language::STACK), Some(FeatureKind::Stacks));
        assert_eq!(feature_for_language(language::DEPLOY), Some(FeatureKind::Stacks));
        assert_eq!(feature_for_language(language::VARS), Some(FeatureKind::Variables));
        assert_eq!(feature_for_language("markdown"), None);
    }

    #[test]
    fn test_dir_to_index_checks_the_owning_feature() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("mod");
        std::fs::create_dir(&dir).unwrap();
        let engine = Engine::new(Settings::default(), Vec::new());
        let modules = engine.modules().unwrap().store();
        modules.add(DirHandle::from_path(&dir).as_str()).unwrap();

        let created = FileChangeType::Created;
        assert_eq!(engine.dir_to_index(&dir.join("outputs.tf"), created, false), None);
        assert_eq!(
            engine.dir_to_index(&dir.join("all.tfquery.hcl"), created, false),
            Some(dir.clone())
        );
        assert_eq!(
            engine.dir_to_index(&dir.join("prod.tfvars"), FileChangeType::Changed, false),
            Some(dir.clone())
        );
        assert_eq!(engine.dir_to_index(&dir.join("README.md"), created, false), None);
        assert_eq!(
            engine.dir_to_index(&dir.join("all.tfquery.hcl"), FileChangeType::Deleted, false),
            None
        );
        assert_eq!(engine.dir_to_index(&dir, created, true), None);

        let fresh = root.path().join("fresh");
        assert_eq!(engine.dir_to_index(&fresh, created, true), Some(fresh.clone()));

        let mut settings = Settings::default();
        settings.features.search = false;
        let engine = Engine::new(settings, Vec::new());
        engine.modules().unwrap().store().add(DirHandle::from_path(&dir).as_str()).unwrap();
        assert_eq!(engine.dir_to_index(&dir.join("all.tfquery.hcl"), created, false), None);
    }
}
