//! Keep a directory tree analyzed while it changes on disk.

use super::check::print_diagnostics;
use anyhow::{Context, Result};
use chrono::Utc;
use hclsense_features::{Engine, Settings};
use hclsense_incremental::{ChangeBatch, Hook};
use hclsense_types::FileChangeType;
use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub async fn watch(config_path: &Path, dir: &Path) -> Result<()> {
    let settings = Settings::load_or_default(config_path).context("Failed to load configuration")?;
    let root = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;

    let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
    let hook: Hook = Arc::new(move |batch: &ChangeBatch| {
        let _ = batch_tx.send(batch.clone());
    });

    let engine = Engine::new(settings, vec![hook]);
    engine.start();

    let ids = engine
        .index_tree(&root)
        .await
        .with_context(|| format!("Failed to index {}", root.display()))?;
    engine.wait(&ids).await;
    print_diagnostics(&engine.diagnostics());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut _watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )
    .context("Failed to initialize watcher")?;

    _watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", root.display()))?;

    println!("Watching {} for changes (Ctrl+C to stop)...", root.display());

    loop {
        tokio::select! {
            Some(event) = rx.recv() => match event {
                Ok(ev) => {
                    let Some((change_type, is_dir)) = classify(&ev.kind) else {
                        continue;
                    };
                    for path in ev.paths {
                        if is_ignored(&engine, &root, &path) {
                            continue;
                        }
                        let change_type = match ev.kind {
                            EventKind::Modify(ModifyKind::Name(_)) if !path.exists() => {
                                FileChangeType::Deleted
                            }
                            EventKind::Modify(ModifyKind::Name(_)) => FileChangeType::Created,
                            _ => change_type,
                        };
                        let is_dir = is_dir || path.is_dir();
                        handle_change(&engine, path, change_type, is_dir).await;
                    }
                }
                Err(err) => eprintln!("Watcher error: {err}"),
            },
            Some(batch) = batch_rx.recv() => report_batch(&engine, &batch),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn handle_change(engine: &Engine, path: PathBuf, change_type: FileChangeType, is_dir: bool) {
    let new_dir = engine.dir_to_index(&path, change_type, is_dir);
    let ids = engine.did_change_watched(path, change_type, is_dir).await;

    // directories the owning feature has not seen yet get discovered
    if let Some(dir) = new_dir {
        match list_files(&dir) {
            Ok(files) => {
                let mut more = engine.index_dir(&dir, files).await;
                more.extend(ids);
                engine.wait(&more).await;
                return;
            }
            Err(err) => tracing::warn!(dir = %dir.display(), error = %err, "failed to list directory"),
        }
    }
    engine.wait(&ids).await;
}

fn report_batch(engine: &Engine, batch: &ChangeBatch) {
    println!(
        "[{}] {}{}",
        Utc::now().to_rfc3339(),
        batch.dir,
        if batch.changes.is_removal { " (removed)" } else { "" }
    );
    let diagnostics: Vec<_> = engine
        .diagnostics()
        .into_iter()
        .filter(|diag| diag.dir == batch.dir.as_str())
        .collect();
    print_diagnostics(&diagnostics);
}

fn classify(kind: &EventKind) -> Option<(FileChangeType, bool)> {
    match kind {
        EventKind::Create(CreateKind::Folder) => Some((FileChangeType::Created, true)),
        EventKind::Create(_) => Some((FileChangeType::Created, false)),
        EventKind::Modify(_) => Some((FileChangeType::Changed, false)),
        EventKind::Remove(RemoveKind::Folder) => Some((FileChangeType::Deleted, true)),
        EventKind::Remove(_) => Some((FileChangeType::Deleted, false)),
        _ => None,
    }
}

fn is_ignored(engine: &Engine, root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|rel| {
            rel.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .is_some_and(|name| engine.settings().is_ignored_dir_name(name))
            })
        })
        .unwrap_or(true)
}

fn list_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}
