//! Job bodies shared by every feature pipeline
//!
//! Each body first claims its stage with [`FeatureStore::begin_stage`];
//! a stage that is already in progress or done yields `StateNotChanged`
//! unless the request ignores state.

use crate::ast::{Diagnostics, Files};
use crate::dialect::{is_ignored_file, Dialect};
use crate::filesystem::ReadOnlyFs;
use crate::parser;
use crate::record::{FeatureStore, Stage};
use crate::schemas::SchemaStore;
use crate::validation;
use hclsense_incremental::{JobError, RequestContext};
use hclsense_types::{DiagnosticSource, DirHandle, OpState};
use std::sync::Arc;
use std::time::Duration;

/// Job type names, prefixed with the feature name when enqueued
pub mod op {
    pub const PARSE_CONFIGURATION: &str = "parse_configuration";
    pub const LOAD_METADATA: &str = "load_metadata";
    pub const PRELOAD_EMBEDDED_SCHEMA: &str = "preload_embedded_schema";
    pub const DECODE_REFERENCE_TARGETS: &str = "decode_reference_targets";
    pub const DECODE_REFERENCE_ORIGINS: &str = "decode_reference_origins";
    pub const VALIDATE: &str = "validate";
}

/// How long a job waits on another feature's data before going ahead
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);

const UPSTREAM_POLL: Duration = Duration::from_millis(25);

/// Wait until the dialect reports the data it borrows for `dir` as ready
pub async fn wait_for_upstream<D: Dialect>(dialect: &D, dir: &DirHandle, timeout: Duration) {
    let ready = tokio::time::timeout(timeout, async {
        while !dialect.upstream_ready(dir.as_str()) {
            tokio::time::sleep(UPSTREAM_POLL).await;
        }
    })
    .await;
    if ready.is_err() {
        tracing::debug!(%dir, feature = D::NAME, "upstream data not ready, continuing without it");
    }
}

fn claim<M: crate::record::Metadata>(
    ctx: &RequestContext,
    store: &FeatureStore<M>,
    dir: &DirHandle,
    stage: Stage,
) -> Result<OpState, JobError> {
    store
        .begin_stage(dir.as_str(), stage, ctx.ignore_state())?
        .ok_or_else(|| JobError::state_not_changed(dir.clone()))
}

/// Parse every relevant file in `dir`
pub fn parse_files<D: Dialect>(
    fs: &dyn ReadOnlyFs,
    dialect: &D,
    dir: &DirHandle,
) -> std::io::Result<(Files, Diagnostics)> {
    let mut files = Files::new();
    let mut diags = Diagnostics::new();

    for name in fs.read_dir(dir.path())? {
        if is_ignored_file(&name) || !dialect.is_relevant_file(&name) {
            continue;
        }
        let text = fs.read_file(&dir.join(&name))?;
        let (file, file_diags) = parser::parse_file(&name, &text);
        files.insert(name.clone(), Arc::new(file));
        diags.insert(name, file_diags);
    }
    Ok((files, diags))
}

/// Turn the bytes of the directory's files into parsed files
///
/// When the directory has been parsed before and the request is a change
/// to one of this feature's documents, only that document is reparsed and
/// merged into the existing file set.
pub fn parse_configuration<D: Dialect>(
    ctx: &RequestContext,
    fs: &dyn ReadOnlyFs,
    store: &FeatureStore<D::Meta>,
    dialect: &D,
    dir: &DirHandle,
) -> Result<(), JobError> {
    let path = dir.as_str();
    let previous = claim(ctx, store, dir, Stage::PARSE)?;
    let record = store.record_by_path(path)?;

    let changed_doc = ctx.document().filter(|doc| {
        previous == OpState::Loaded
            && ctx.is_did_change_request()
            && doc.document.dir == *dir
            && dialect.is_relevant_language(&doc.language_id)
            && dialect.is_relevant_file(&doc.document.filename)
    });

    if let Some(doc) = changed_doc {
        let name = doc.document.filename.clone();
        let text = match fs.read_file(&dir.join(&name)) {
            Ok(text) => text,
            Err(err) => {
                store.update_parsed_files(path, record.parsed_files.clone(), Some(err.to_string()))?;
                store.set_diagnostics_state(path, DiagnosticSource::HclParsing, OpState::Loaded)?;
                return Err(err.into());
            }
        };

        let unchanged = record
            .parsed_files
            .get(&name)
            .is_some_and(|file| file.digest == parser::digest(&text));
        if unchanged {
            tracing::debug!(%dir, file = %name, "content unchanged, skipping reparse");
            store.set_diagnostics_state(path, DiagnosticSource::HclParsing, OpState::Loaded)?;
            return Ok(());
        }

        let (file, file_diags) = parser::parse_file(&name, &text);
        let mut files = record.parsed_files.clone();
        files.insert(name.clone(), Arc::new(file));
        let mut diags = record.parse_diagnostics.clone();
        diags.insert(name, file_diags);

        store.update_parsed_files(path, files, None)?;
        store.update_parse_diagnostics(path, diags)?;
        return Ok(());
    }

    match parse_files(fs, dialect, dir) {
        Ok((files, diags)) => {
            tracing::debug!(%dir, feature = D::NAME, files = files.len(), "parsed configuration");
            store.update_parsed_files(path, files, None)?;
            store.update_parse_diagnostics(path, diags)?;
            Ok(())
        }
        Err(err) => {
            store.update_parsed_files(path, Files::new(), Some(err.to_string()))?;
            store.update_parse_diagnostics(path, Diagnostics::new())?;
            Err(err.into())
        }
    }
}

/// Decode feature metadata from the parsed files
///
/// While another job is still parsing the directory the stage is left
/// untouched; the metadata job queued behind that parse decodes it.
pub fn load_metadata<D: Dialect>(
    ctx: &RequestContext,
    store: &FeatureStore<D::Meta>,
    dialect: &D,
    dir: &DirHandle,
) -> Result<(), JobError> {
    let path = dir.as_str();
    if store.record_by_path(path)?.state(Stage::PARSE) == OpState::Loading {
        tracing::debug!(%dir, feature = D::NAME, "parse in progress, skipping metadata");
        return Err(JobError::state_not_changed(dir.clone()));
    }
    claim(ctx, store, dir, Stage::Metadata)?;
    let record = store.record_by_path(path)?;

    let (meta, meta_diags) = dialect.load_metadata(&record.parsed_files);
    store.update_metadata(path, meta, None)?;
    store.update_metadata_diagnostics(path, meta_diags)?;
    Ok(())
}

/// Load embedded schemas for every required provider not yet loaded
///
/// The stage is marked `Loaded` even when loading fails so that dependent
/// stages do not wait on it forever.
pub fn preload_embedded_schema<D: Dialect>(
    ctx: &RequestContext,
    store: &FeatureStore<D::Meta>,
    dialect: &D,
    schemas: &SchemaStore,
    dir: &DirHandle,
) -> Result<(), JobError> {
    let path = dir.as_str();
    claim(ctx, store, dir, Stage::PreloadSchema)?;

    let result = (|| -> Result<(), JobError> {
        let record = store.record_by_path(path)?;
        let requirements = dialect.provider_requirements(path, &record.meta);
        for addr in schemas.missing_schemas(&requirements) {
            schemas.preload(&addr).map_err(JobError::failed)?;
        }
        Ok(())
    })();

    store.set_preload_embedded_schema_state(path, OpState::Loaded)?;
    result
}

pub fn decode_reference_targets<D: Dialect>(
    ctx: &RequestContext,
    store: &FeatureStore<D::Meta>,
    dialect: &D,
    dir: &DirHandle,
) -> Result<(), JobError> {
    let path = dir.as_str();
    claim(ctx, store, dir, Stage::ReferenceTargets)?;
    if !dialect.upstream_ready(path) {
        tracing::debug!(%dir, feature = D::NAME, "upstream data missing, postponing reference targets");
        store.set_reference_targets_state(path, OpState::Unknown)?;
        return Ok(());
    }
    let record = store.record_by_path(path)?;

    let targets = dialect.reference_targets(path, &record.parsed_files, &record.meta);
    store.update_reference_targets(path, targets, None)?;
    Ok(())
}

pub fn decode_reference_origins<D: Dialect>(
    ctx: &RequestContext,
    store: &FeatureStore<D::Meta>,
    dialect: &D,
    dir: &DirHandle,
) -> Result<(), JobError> {
    let path = dir.as_str();
    claim(ctx, store, dir, Stage::ReferenceOrigins)?;
    let record = store.record_by_path(path)?;

    let origins = dialect.reference_origins(&record.parsed_files, &record.meta);
    store.update_reference_origins(path, origins, None)?;
    Ok(())
}

/// Run schema validation and reference validation
///
/// Each has its own stage; the job only reports `StateNotChanged` when
/// both were skipped. Reference validation is postponed, its stage reset
/// to `Unknown`, while data the dialect borrows is missing.
pub fn validate<D: Dialect>(
    ctx: &RequestContext,
    store: &FeatureStore<D::Meta>,
    dialect: &D,
    schemas: &SchemaStore,
    dir: &DirHandle,
) -> Result<(), JobError> {
    let path = dir.as_str();
    let mut ran = false;

    if store
        .begin_stage(path, Stage::SCHEMA_VALIDATION, ctx.ignore_state())?
        .is_some()
    {
        let record = store.record_by_path(path)?;
        let providers = dialect.provider_requirements(path, &record.meta);
        let diags = validation::schema_validation(
            &record.parsed_files,
            &dialect.block_rules(),
            schemas,
            &providers,
        );
        store.update_diagnostics(path, DiagnosticSource::SchemaValidation, diags)?;
        ran = true;
    }

    if store
        .begin_stage(path, Stage::REFERENCE_VALIDATION, ctx.ignore_state())?
        .is_some()
    {
        if dialect.upstream_ready(path) {
            let record = store.record_by_path(path)?;
            let diags = dialect.validate_references(path, &record.ref_origins, &record.ref_targets);
            store.update_diagnostics(path, DiagnosticSource::ReferenceValidation, diags)?;
        } else {
            tracing::debug!(%dir, feature = D::NAME, "upstream data missing, postponing reference validation");
            store.set_diagnostics_state(path, DiagnosticSource::ReferenceValidation, OpState::Unknown)?;
        }
        ran = true;
    }

    if ran {
        Ok(())
    } else {
        Err(JobError::state_not_changed(dir.clone()))
    }
}
