//! Analyze a directory tree once and report diagnostics.

use anyhow::{bail, Context, Result};
use hclsense_features::{DirDiagnostic, Engine, Settings};
use serde::Serialize;
use std::path::Path;

pub struct CheckOptions {
    pub json: bool,
    pub stats: bool,
}

#[derive(Serialize)]
struct CheckSummary {
    directories: usize,
    changed: usize,
    errors: usize,
    warnings: usize,
}

pub async fn check(config_path: &Path, dir: &Path, opts: CheckOptions) -> Result<()> {
    let settings = Settings::load_or_default(config_path).context("Failed to load configuration")?;
    let root = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;

    let engine = Engine::new(settings, Vec::new());
    engine.start();

    let ids = engine
        .index_tree(&root)
        .await
        .with_context(|| format!("Failed to index {}", root.display()))?;
    engine.wait(&ids).await;

    let batches = engine.state().changes.drain();
    tracing::debug!(batches = batches.len(), "drained change batches");
    let diagnostics = engine.diagnostics();
    let summary = CheckSummary {
        directories: count_directories(&engine),
        changed: batches.len(),
        errors: diagnostics.iter().filter(|d| d.diagnostic.is_error()).count(),
        warnings: diagnostics.iter().filter(|d| !d.diagnostic.is_error()).count(),
    };

    if opts.json {
        for diag in &diagnostics {
            println!("{}", serde_json::to_string(diag)?);
        }
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        print_diagnostics(&diagnostics);
        println!(
            "Checked {} directories: {} errors, {} warnings",
            summary.directories, summary.errors, summary.warnings
        );
    }

    if opts.stats {
        for snapshot in engine.state().jobs.metrics().snapshot() {
            eprint!("{}", snapshot);
        }
    }

    engine.shutdown().await;

    if summary.errors > 0 {
        bail!("{} error(s) found", summary.errors);
    }
    Ok(())
}

fn count_directories(engine: &Engine) -> usize {
    let mut dirs = std::collections::BTreeSet::new();
    if let Some(feature) = engine.modules() {
        dirs.extend(feature.store().snapshot().iter().map(|(path, _)| path.to_string()));
    }
    if let Some(feature) = engine.stacks() {
        dirs.extend(feature.store().snapshot().iter().map(|(path, _)| path.to_string()));
    }
    if let Some(feature) = engine.search() {
        dirs.extend(feature.store().snapshot().iter().map(|(path, _)| path.to_string()));
    }
    if let Some(feature) = engine.variables() {
        dirs.extend(feature.store().snapshot().iter().map(|(path, _)| path.to_string()));
    }
    dirs.len()
}

pub(crate) fn print_diagnostics(diagnostics: &[DirDiagnostic]) {
    for diag in diagnostics {
        let path = Path::new(&diag.dir).join(&diag.diagnostic.range.filename);
        let level = if diag.diagnostic.is_error() {
            "error"
        } else {
            "warning"
        };
        println!(
            "{}:{}:{}: {}: {} [{}]",
            path.display(),
            diag.diagnostic.range.start.line,
            diag.diagnostic.range.start.column,
            level,
            diag.diagnostic.summary,
            diag.feature
        );
        if !diag.diagnostic.detail.is_empty() {
            println!("  {}", diag.diagnostic.detail);
        }
    }
}
