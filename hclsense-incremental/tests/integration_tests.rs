//! Integration tests for the job scheduler, versioned tables and change queue

use hclsense_incremental::prelude::*;
use hclsense_incremental::{
    ChangeBatch, DidOpenEvent, Hook, JobOutcome, JobPriority, Notifier,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn settle(state: &StateStore, ids: &[JobId]) {
    tokio::time::timeout(Duration::from_secs(5), async {
        state.jobs.wait_for_jobs(ids).await;
        state.jobs.wait_until_idle().await;
    })
    .await
    .expect("jobs did not settle");
}

#[tokio::test]
async fn test_dependent_job_runs_after_dependency() {
    let state = StateStore::new();
    let scheduler = Scheduler::new(state.jobs.clone(), 4);
    scheduler.start();

    let dir = DirHandle::from_path("/mod");
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    let first = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(dir.clone(), "parse", move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.lock().push("parse");
                Ok(())
            }),
        )
        .unwrap();

    let log = order.clone();
    let second = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(dir.clone(), "metadata", move |_ctx| async move {
                log.lock().push("metadata");
                Ok(())
            })
            .depends_on([first]),
        )
        .unwrap();

    settle(&state, &[first, second]).await;
    assert_eq!(*order.lock(), vec!["parse", "metadata"]);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_dependency_still_releases_dependent() {
    let state = StateStore::new();
    let scheduler = Scheduler::new(state.jobs.clone(), 2);
    scheduler.start();

    let dir = DirHandle::from_path("/mod");
    let failing = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(dir.clone(), "parse", |_ctx| async {
                Err(JobError::failed("unreadable"))
            }),
        )
        .unwrap();
    let dependent = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(dir, "metadata", |_ctx| async { Ok(()) }).depends_on([failing]),
        )
        .unwrap();

    settle(&state, &[failing, dependent]).await;
    assert!(state.jobs.job_outcome(failing).is_some_and(|o| o.is_failure()));
    assert_eq!(state.jobs.job_outcome(dependent), Some(JobOutcome::Succeeded));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_priority_pools() {
    let state = StateStore::new();
    let high = Scheduler::new(state.jobs.clone(), 1).with_priority(JobPriority::High);
    high.start();

    let open = DirHandle::from_path("/open");
    state.documents.open_document(
        DocumentHandle::from_path("/open/main.tf"),
        "terraform",
        1,
        "",
    );

    let background = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(DirHandle::from_path("/closed"), "parse", |_ctx| async { Ok(()) }),
        )
        .unwrap();
    let foreground = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(open, "parse", |_ctx| async { Ok(()) }),
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), state.jobs.wait_for_jobs(&[foreground]))
        .await
        .unwrap();
    assert_eq!(state.jobs.job_outcome(foreground), Some(JobOutcome::Succeeded));
    assert_eq!(state.jobs.job_outcome(background), None);
    assert_eq!(state.jobs.list_queued_jobs().len(), 1);

    let low = Scheduler::new(state.jobs.clone(), 1).with_priority(JobPriority::Low);
    low.start();
    settle(&state, &[background]).await;
    assert_eq!(state.jobs.job_outcome(background), Some(JobOutcome::Succeeded));

    high.shutdown().await;
    low.shutdown().await;
}

#[tokio::test]
async fn test_dequeue_cancels_pending_chain() {
    let state = StateStore::new();
    let dir = DirHandle::from_path("/mod");

    let parse = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(dir.clone(), "parse", |_ctx| async { Ok(()) }),
        )
        .unwrap();
    let metadata = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(dir.clone(), "metadata", |_ctx| async { Ok(()) }).depends_on([parse]),
        )
        .unwrap();

    state.jobs.dequeue_jobs_for_dir(&dir).unwrap();
    assert!(!state.jobs.jobs_exist_for_dir(&dir));

    let scheduler = Scheduler::new(state.jobs.clone(), 2);
    scheduler.start();
    settle(&state, &[parse, metadata]).await;

    assert_eq!(state.jobs.job_outcome(parse), Some(JobOutcome::Dequeued));
    assert_eq!(state.jobs.job_outcome(metadata), Some(JobOutcome::Dequeued));
    let snapshot = state.jobs.metrics().for_type("parse").snapshot();
    assert_eq!(snapshot.dequeued, 1);
    assert_eq!(snapshot.executions(), 0);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_bus_subscriber_enqueues_jobs() {
    let state = StateStore::new();
    let scheduler = Scheduler::new(state.jobs.clone(), 2);
    scheduler.start();

    let bus = Arc::new(EventBus::new());
    let (done_tx, done_rx) = mpsc::channel(1);
    let mut events = bus.on_did_open("feature.modules", Some(done_rx));

    let jobs = state.jobs.clone();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let id = jobs
                .enqueue_job(
                    &event.context,
                    Job::new(event.dir.clone(), "parse", |_ctx| async { Ok(()) }),
                )
                .map(|id| vec![id])
                .unwrap_or_default();
            if done_tx.send(id).await.is_err() {
                break;
            }
        }
    });

    let ids = bus
        .did_open(DidOpenEvent {
            context: RequestContext::new(),
            dir: DirHandle::from_path("/mod"),
            language_id: "terraform".to_string(),
        })
        .await;
    assert_eq!(ids.len(), 1);

    settle(&state, &ids).await;
    assert_eq!(state.jobs.job_outcome(ids[0]), Some(JobOutcome::Succeeded));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_committed_writes_reach_notifier() {
    let state = StateStore::new();
    let scheduler = Scheduler::new(state.jobs.clone(), 1);
    scheduler.start();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let hook: Hook = Arc::new(move |batch: &ChangeBatch| {
        let _ = tx.send(batch.clone());
    });
    let notifier = Notifier::new(state.changes.clone(), vec![hook]);
    notifier.start();

    let table: Arc<VersionedTable<String>> = Arc::new(VersionedTable::new("modules"));
    let dir = DirHandle::from_path("/mod");

    let writer = table.clone();
    let changes = state.changes.clone();
    let job_dir = dir.clone();
    let id = state
        .jobs
        .enqueue_job(
            &RequestContext::new(),
            Job::new(dir.clone(), "parse", move |_ctx| async move {
                writer.write(|txn| {
                    txn.insert(job_dir.as_str(), "parsed".to_string());
                    txn.on_commit(move || {
                        let _ = changes.queue_change(job_dir, ChangeFlags::diagnostics());
                    });
                    Ok::<_, JobError>(())
                })
            }),
        )
        .unwrap();

    settle(&state, &[id]).await;
    let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(batch.dir, dir);
    assert!(batch.changes.diagnostics);
    assert!(!batch.is_dir_open);
    assert_eq!(table.revision().0, 1);
    assert_eq!(
        table.snapshot().get("/mod").map(|row| row.as_str()),
        Some("parsed")
    );

    notifier.shutdown().await;
    scheduler.shutdown().await;
}
