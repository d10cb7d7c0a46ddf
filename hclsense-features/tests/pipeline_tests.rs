//! Integration tests for the feature pipelines

use hclsense_features::jobs;
use hclsense_features::prelude::*;
use hclsense_incremental::{
    DidChangeWatchedEvent, EventBus, JobId, JobOutcome, RequestContext, Scheduler, StateStore,
    ValidationOptions,
};
use hclsense_types::{DiagnosticSource, DirHandle, FileChangeType, OpState};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    state: StateStore,
    schemas: Arc<SchemaStore>,
    feature: Arc<Feature<ModulesDialect>>,
    scheduler: Scheduler,
}

impl Fixture {
    fn new() -> Self {
        let state = StateStore::new();
        let schemas = Arc::new(SchemaStore::new());
        let feature = Feature::new(
            ModulesDialect,
            Arc::new(EventBus::new()),
            state.changes.clone(),
            Arc::new(OsFs),
            schemas.clone(),
            state.jobs.clone(),
        );
        let scheduler = Scheduler::new(state.jobs.clone(), 2);
        Fixture {
            state,
            schemas,
            feature,
            scheduler,
        }
    }

    fn store(&self) -> &FeatureStore<ModuleMeta> {
        self.feature.store()
    }

    fn decode(&self, ctx: &RequestContext, dir: &DirHandle, ignore_state: bool) -> Vec<JobId> {
        self.feature
            .pipeline()
            .decode(ctx, dir, ignore_state)
            .unwrap()
    }

    async fn settle(&self, ids: &[JobId]) {
        tokio::time::timeout(Duration::from_secs(5), async {
            self.state.jobs.wait_for_jobs(ids).await;
            self.state.jobs.wait_until_idle().await;
        })
        .await
        .expect("jobs did not settle");
    }

    fn count(&self, op: &str) -> hclsense_incremental::MetricsSnapshot {
        self.state
            .jobs
            .metrics()
            .for_type(&format!("modules.{op}"))
            .snapshot()
    }
}

fn module_dir(root: &TempDir, name: &str, main_tf: &str) -> DirHandle {
    let dir = root.path().join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("main.tf"), main_tf).unwrap();
    DirHandle::from_path(dir)
}

const MAIN_TF: &str = r#"
variable "region" {}

resource "aws_instance" "web" {
  region = var.region
}
"#;

#[tokio::test]
async fn test_decode_module_directory() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", MAIN_TF);
    let fixture = Fixture::new();
    fixture.scheduler.start();

    fixture.store().add(dir.as_str()).unwrap();
    let ids = fixture.decode(&RequestContext::new(), &dir, false);
    assert_eq!(ids.len(), 2);
    fixture.settle(&ids).await;

    let records = fixture.store().list().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.state(Stage::PARSE), OpState::Loaded);
    assert_eq!(record.meta_state, OpState::Loaded);
    assert_eq!(record.preload_embedded_schema_state, OpState::Loaded);
    assert_eq!(record.ref_targets_state, OpState::Loaded);
    assert_eq!(record.ref_origins_state, OpState::Loaded);
    assert!(record.diagnostics.contains_source(DiagnosticSource::HclParsing));

    assert!(record.meta.variables.contains_key("region"));
    assert!(record.meta.provider_requirements.contains("hashicorp/aws"));
    assert!(fixture.schemas.provider_schema("hashicorp/aws").is_some());
    assert!(record.ref_targets.iter().any(|t| t.addr == "var.region"));
    assert!(record.ref_origins.iter().any(|o| o.addr == "var.region"));
    assert_eq!(record.diagnostics.count(), 0);

    fixture.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unchanged_stages_are_skipped() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", MAIN_TF);
    let fixture = Fixture::new();
    fixture.scheduler.start();

    fixture.store().add(dir.as_str()).unwrap();
    let ids = fixture.decode(&RequestContext::new(), &dir, false);
    fixture.settle(&ids).await;
    let revision = fixture.store().revision();

    let ids = fixture.decode(&RequestContext::new(), &dir, false);
    fixture.settle(&ids).await;

    assert_eq!(fixture.store().revision(), revision);
    assert_eq!(fixture.state.jobs.job_outcome(ids[0]), Some(JobOutcome::StateNotChanged));
    assert_eq!(fixture.state.jobs.job_outcome(ids[1]), Some(JobOutcome::StateNotChanged));
    assert_eq!(fixture.count(jobs::op::PARSE_CONFIGURATION).state_not_changed, 1);
    assert_eq!(fixture.count(jobs::op::VALIDATE).state_not_changed, 1);

    fixture.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_ignore_state_reruns_stages() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", MAIN_TF);
    let fixture = Fixture::new();
    fixture.scheduler.start();

    fixture.store().add(dir.as_str()).unwrap();
    let ids = fixture.decode(&RequestContext::new(), &dir, false);
    fixture.settle(&ids).await;
    let revision = fixture.store().revision();

    fs::write(dir.join("main.tf"), "variable \"zone\" {}\n").unwrap();
    let ids = fixture.decode(&RequestContext::new(), &dir, true);
    fixture.settle(&ids).await;

    assert!(fixture.store().revision() > revision);
    assert_eq!(fixture.state.jobs.job_outcome(ids[0]), Some(JobOutcome::Succeeded));
    let record = fixture.store().record_by_path(dir.as_str()).unwrap();
    assert!(record.meta.variables.contains_key("zone"));
    assert!(!record.meta.variables.contains_key("region"));
    assert!(record.ref_targets.iter().any(|t| t.addr == "var.zone"));

    fixture.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_metadata_defers_reference_and_validation_jobs() {
    let root = TempDir::new().unwrap();
    let with = module_dir(&root, "with", MAIN_TF);
    let without = module_dir(&root, "without", MAIN_TF);
    let fixture = Fixture::new();

    fixture.store().add(with.as_str()).unwrap();
    fixture.store().add(without.as_str()).unwrap();

    let ids = fixture.decode(&RequestContext::new(), &with, false);
    let no_validation = RequestContext::new().with_validation(ValidationOptions {
        enable_enhanced_validation: false,
    });
    let ids_without = fixture.decode(&no_validation, &without, false);

    fixture.scheduler.start();
    fixture.settle(&ids).await;
    fixture.settle(&ids_without).await;

    assert_eq!(fixture.count(jobs::op::PRELOAD_EMBEDDED_SCHEMA).enqueued, 2);
    assert_eq!(fixture.count(jobs::op::DECODE_REFERENCE_TARGETS).enqueued, 2);
    assert_eq!(fixture.count(jobs::op::DECODE_REFERENCE_ORIGINS).enqueued, 2);
    assert_eq!(fixture.count(jobs::op::VALIDATE).enqueued, 1);

    let with = fixture.store().record_by_path(with.as_str()).unwrap();
    let without = fixture.store().record_by_path(without.as_str()).unwrap();
    assert_eq!(with.state(Stage::SCHEMA_VALIDATION), OpState::Loaded);
    assert_eq!(with.state(Stage::REFERENCE_VALIDATION), OpState::Loaded);
    assert_eq!(without.state(Stage::SCHEMA_VALIDATION), OpState::Unknown);

    fixture.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_removed_directory_runs_no_jobs() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", MAIN_TF);
    let fixture = Fixture::new();

    fixture.store().add(dir.as_str()).unwrap();
    let ids = fixture.decode(&RequestContext::new(), &dir, false);
    assert!(fixture.state.jobs.jobs_exist_for_dir(&dir));

    fixture.feature.remove_indexed(&dir).unwrap();
    assert!(!fixture.store().exists(dir.as_str()));
    assert!(!fixture.state.jobs.jobs_exist_for_dir(&dir));
    for id in &ids {
        assert_eq!(fixture.state.jobs.job_outcome(*id), Some(JobOutcome::Dequeued));
    }

    fixture.scheduler.start();
    fixture.settle(&ids).await;
    assert_eq!(fixture.count(jobs::op::PARSE_CONFIGURATION).executions(), 0);
    assert!(!fixture.store().exists(dir.as_str()));

    fixture.scheduler.shutdown().await;
}

#[test]
fn test_remove_missing_path_is_ok() {
    let fixture = Fixture::new();
    assert!(fixture.store().remove("/mod").is_ok());
    assert!(fixture.state.changes.is_empty());
}

#[test]
fn test_concurrent_preload_runs_once() {
    let fixture = Fixture::new();
    let dir = DirHandle::from_path("/mod");
    fixture.store().add(dir.as_str()).unwrap();

    let mut meta = ModuleMeta::default();
    meta.provider_requirements.insert("hashicorp/aws".to_string());
    fixture.store().update_metadata(dir.as_str(), meta, None).unwrap();

    let barrier = Barrier::new(2);
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    jobs::preload_embedded_schema(
                        &RequestContext::new(),
                        fixture.store(),
                        &ModulesDialect,
                        &fixture.schemas,
                        &dir,
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let skipped = results
        .iter()
        .filter(|r| matches!(r, Err(err) if err.is_state_not_changed_for(&dir)))
        .count();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(skipped, 1);
    assert_eq!(fixture.schemas.load_count(), 1);
}

fn watched(path: &Path, change_type: FileChangeType, is_dir: bool) -> DidChangeWatchedEvent {
    DidChangeWatchedEvent {
        context: RequestContext::new(),
        raw_path: path.to_path_buf(),
        change_type,
        is_dir,
    }
}

#[tokio::test]
async fn test_watched_file_changes() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", MAIN_TF);
    let fixture = Fixture::new();
    fixture.scheduler.start();

    fixture.store().add(dir.as_str()).unwrap();
    let ids = fixture.decode(&RequestContext::new(), &dir, false);
    fixture.settle(&ids).await;

    // a new file in an indexed directory triggers a forced reparse
    let outputs = dir.join("outputs.tf");
    fs::write(&outputs, "output \"id\" {\n  value = var.region\n}\n").unwrap();
    let ids = fixture
        .feature
        .did_change_watched(&watched(&outputs, FileChangeType::Created, false))
        .unwrap();
    assert_eq!(ids.len(), 2);
    fixture.settle(&ids).await;
    let record = fixture.store().record_by_path(dir.as_str()).unwrap();
    assert!(record.parsed_files.contains_key("outputs.tf"));
    assert!(record.meta.outputs.contains("id"));

    // deleting a file reparses what is left
    fs::remove_file(&outputs).unwrap();
    let ids = fixture
        .feature
        .did_change_watched(&watched(&outputs, FileChangeType::Deleted, false))
        .unwrap();
    fixture.settle(&ids).await;
    let record = fixture.store().record_by_path(dir.as_str()).unwrap();
    assert!(!record.parsed_files.contains_key("outputs.tf"));
    assert!(record.meta.outputs.is_empty());

    // changes outside indexed directories are ignored
    let elsewhere = root.path().join("elsewhere");
    fs::create_dir_all(&elsewhere).unwrap();
    let ids = fixture
        .feature
        .did_change_watched(&watched(&elsewhere.join("main.tf"), FileChangeType::Created, false))
        .unwrap();
    assert!(ids.is_empty());

    // deleting the directory drops its record
    fs::remove_dir_all(dir.path()).unwrap();
    let ids = fixture
        .feature
        .did_change_watched(&watched(dir.path(), FileChangeType::Deleted, true))
        .unwrap();
    assert!(ids.is_empty());
    assert!(!fixture.store().exists(dir.as_str()));

    fixture.scheduler.shutdown().await;
}

#[test]
fn test_deleted_file_in_missing_directory_drops_record() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", MAIN_TF);
    let fixture = Fixture::new();
    fixture.store().add(dir.as_str()).unwrap();

    fs::remove_dir_all(dir.path()).unwrap();
    let ids = fixture
        .feature
        .did_change_watched(&watched(&dir.join("main.tf"), FileChangeType::Deleted, false))
        .unwrap();

    assert!(ids.is_empty());
    assert!(!fixture.store().exists(dir.as_str()));
}

#[tokio::test]
async fn test_engine_indexes_tree() {
    let root = TempDir::new().unwrap();
    module_dir(
        &root,
        "network",
        "variable \"cidr\" {}\n\nwidget \"x\" {}\n\noutput \"bad\" {\n  value = local.missing\n}\n",
    );
    let search = root.path().join("network");
    fs::write(
        search.join("all.tfquery.hcl"),
        "list \"aws_instance\" \"all\" {\n  provider = aws\n}\n",
    )
    .unwrap();
    let ignored = root.path().join(".terraform").join("modules");
    fs::create_dir_all(&ignored).unwrap();
    fs::write(ignored.join("main.tf"), "resource {\n").unwrap();

    let engine = Engine::new(Settings::default(), Vec::new());
    engine.start();

    let ids = engine.index_tree(root.path()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), engine.wait(&ids))
        .await
        .expect("jobs did not settle");

    let dir = DirHandle::from_path(&search);
    let modules = engine.modules().unwrap().store();
    assert_eq!(modules.list().unwrap().len(), 1);
    assert!(modules.exists(dir.as_str()));
    let search_record = engine.search().unwrap().store().record_by_path(dir.as_str()).unwrap();
    assert_eq!(search_record.meta.lists["all"], "aws_instance");
    assert!(engine.schemas().provider_schema("hashicorp/aws").is_some());

    let summaries: Vec<String> = engine
        .diagnostics()
        .into_iter()
        .map(|d| d.diagnostic.summary)
        .collect();
    assert!(summaries.contains(&"Unsupported block type \"widget\"".to_string()));
    assert!(summaries.contains(&"No declaration found for \"local.missing\"".to_string()));
    assert!(!engine.state().changes.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_engine_open_documents_shadow_disk() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", "variable \"on_disk\" {}\n");
    let path = dir.join("main.tf");

    let engine = Engine::new(Settings::default(), Vec::new());
    engine.start();

    let ids = engine
        .open_document(&path, "terraform", 1, "variable \"in_editor\" {}\n")
        .await;
    assert!(!ids.is_empty());
    tokio::time::timeout(Duration::from_secs(5), engine.wait(&ids))
        .await
        .expect("jobs did not settle");

    let modules = engine.modules().unwrap().store();
    let record = modules.record_by_path(dir.as_str()).unwrap();
    assert!(record.meta.variables.contains_key("in_editor"));
    assert!(!record.meta.variables.contains_key("on_disk"));

    let ids = engine
        .change_document(&path, 2, "variable \"edited\" {}\n")
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), engine.wait(&ids))
        .await
        .expect("jobs did not settle");
    let record = modules.record_by_path(dir.as_str()).unwrap();
    assert!(record.meta.variables.contains_key("edited"));

    engine.close_document(&path);
    assert!(engine
        .change_document(&path, 3, "variable \"closed\" {}\n")
        .await
        .is_err());

    engine.shutdown().await;
}

fn engine() -> Engine {
    let mut settings = Settings::default();
    settings.indexing.parallelism = 4;
    Engine::new(settings, Vec::new())
}

async fn wait(engine: &Engine, ids: &[JobId]) {
    tokio::time::timeout(Duration::from_secs(5), engine.wait(ids))
        .await
        .expect("jobs did not settle");
}

fn parsing_diagnostics(engine: &Engine, dir: &DirHandle) -> usize {
    engine
        .modules()
        .unwrap()
        .store()
        .record_by_path(dir.as_str())
        .unwrap()
        .diagnostics
        .get(DiagnosticSource::HclParsing)
        .map_or(0, |diags| diags.values().map(Vec::len).sum())
}

#[tokio::test]
async fn test_duplicate_declarations_follow_edits() {
    let root = TempDir::new().unwrap();
    let dir = module_dir(&root, "mod", "variable \"x\" {}\n");
    fs::write(dir.join("other.tf"), "variable \"x\" {}\n").unwrap();
    let path = dir.join("main.tf");

    let engine = engine();
    engine.start();

    let ids = engine
        .open_document(&path, "terraform", 1, "variable \"x\" {}\n")
        .await;
    wait(&engine, &ids).await;
    assert_eq!(parsing_diagnostics(&engine, &dir), 1);

    let edits = [
        (2, "variable \"y\" {}\n", 0),
        (3, "variable \"x\" {}\n", 1),
        (4, "variable \"x\" {}\n# edited\n", 1),
        (5, "variable \"x\" {}\n# edited again\n", 1),
    ];
    for (version, text, expected) in edits {
        let ids = engine.change_document(&path, version, text).await.unwrap();
        wait(&engine, &ids).await;
        assert_eq!(parsing_diagnostics(&engine, &dir), expected, "version {version}");
    }

    let record = engine.modules().unwrap().store().record_by_path(dir.as_str()).unwrap();
    assert!(record.parse_diagnostics.values().all(Vec::is_empty));

    engine.shutdown().await;
}

#[test]
fn test_metadata_waits_for_running_parse() {
    let fixture = Fixture::new();
    let dir = DirHandle::from_path("/mod");
    fixture.store().add(dir.as_str()).unwrap();
    fixture
        .store()
        .begin_stage(dir.as_str(), Stage::PARSE, false)
        .unwrap();

    let result = jobs::load_metadata(&RequestContext::new(), fixture.store(), &ModulesDialect, &dir);

    assert!(matches!(result, Err(err) if err.is_state_not_changed_for(&dir)));
    let record = fixture.store().record_by_path(dir.as_str()).unwrap();
    assert_eq!(record.meta_state, OpState::Unknown);
}

#[tokio::test]
async fn test_stack_directory_with_two_languages_is_decoded_once() {
    let root = TempDir::new().unwrap();
    let dir = root.path().join("stack");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("components.tfcomponent.hcl"),
        "component \"net\" {\n  source = \"./net\"\n}\n",
    )
    .unwrap();
    fs::write(
        dir.join("deployments.tfdeploy.hcl"),
        "deployment \"prod\" {\n  inputs = {}\n}\n",
    )
    .unwrap();

    let engine = engine();
    engine.start();
    let files = vec![
        "components.tfcomponent.hcl".to_string(),
        "deployments.tfdeploy.hcl".to_string(),
    ];
    let ids = engine.index_dir(&dir, files).await;
    wait(&engine, &ids).await;

    let record = engine
        .stacks()
        .unwrap()
        .store()
        .record_by_path(DirHandle::from_path(&dir).as_str())
        .unwrap();
    assert_eq!(record.meta_state, OpState::Loaded);
    assert_eq!(record.meta.components["net"], "./net");
    assert!(record.meta.deployments.contains("prod"));
    let parses = engine
        .state()
        .jobs
        .metrics()
        .for_type("stacks.parse_configuration")
        .snapshot();
    assert_eq!(parses.enqueued, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_local_module_calls_are_decoded() {
    let root = TempDir::new().unwrap();
    let parent = module_dir(&root, "root", "module \"net\" {\n  source = \"./net\"\n}\n");
    fs::create_dir_all(parent.join("net")).unwrap();
    fs::write(
        parent.join("net").join("main.tf"),
        "variable \"cidr\" {}\n\noutput \"id\" {\n  value = var.missing\n}\n",
    )
    .unwrap();
    let nested = DirHandle::from_path(parent.join("net"));

    let fixture = Fixture::new();
    fixture.scheduler.start();
    fixture.store().add(parent.as_str()).unwrap();
    let ids = fixture.decode(&RequestContext::new(), &parent, false);
    fixture.settle(&ids).await;

    let record = fixture.store().record_by_path(nested.as_str()).unwrap();
    assert_eq!(record.meta_state, OpState::Loaded);
    assert!(record.meta.variables.contains_key("cidr"));
    assert_eq!(record.ref_targets_state, OpState::Loaded);
    // nested directories are not validated
    assert_eq!(record.state(Stage::SCHEMA_VALIDATION), OpState::Unknown);
    assert_eq!(record.state(Stage::REFERENCE_VALIDATION), OpState::Unknown);

    let record = fixture.store().record_by_path(parent.as_str()).unwrap();
    assert_eq!(record.state(Stage::REFERENCE_VALIDATION), OpState::Loaded);
    assert_eq!(fixture.count(jobs::op::PARSE_CONFIGURATION).enqueued, 2);
    assert_eq!(fixture.count(jobs::op::VALIDATE).enqueued, 1);

    // an already indexed nested directory is not forced
    let ids = fixture.decode(&RequestContext::new(), &parent, true);
    fixture.settle(&ids).await;
    assert_eq!(fixture.count(jobs::op::PARSE_CONFIGURATION).enqueued, 4);
    assert_eq!(fixture.count(jobs::op::PARSE_CONFIGURATION).state_not_changed, 1);

    fixture.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_variable_files_are_checked_against_module() {
    let root = TempDir::new().unwrap();
    let app = module_dir(&root, "app", "variable \"region\" {}\n");
    fs::write(
        app.join("terraform.tfvars"),
        "region = \"eu-west-1\"\nregoin = \"us-east-1\"\n",
    )
    .unwrap();
    let alone = root.path().join("alone");
    fs::create_dir_all(&alone).unwrap();
    fs::write(alone.join("terraform.tfvars"), "anything = 1\n").unwrap();

    let engine = engine();
    engine.start();
    let ids = engine.index_tree(root.path()).await.unwrap();
    wait(&engine, &ids).await;

    let variables = engine.variables().unwrap().store();
    let record = variables.record_by_path(app.as_str()).unwrap();
    assert!(record.meta.assignments.contains_key("region"));
    assert_eq!(record.state(Stage::REFERENCE_VALIDATION), OpState::Loaded);
    assert!(variables.exists(DirHandle::from_path(&alone).as_str()));

    let found: Vec<_> = engine
        .diagnostics()
        .into_iter()
        .filter(|d| d.feature == "variables")
        .collect();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].dir, app.as_str());
    assert_eq!(found[0].diagnostic.summary, "Value for undeclared variable");
    assert!(!found[0].diagnostic.is_error());

    engine.shutdown().await;
}
