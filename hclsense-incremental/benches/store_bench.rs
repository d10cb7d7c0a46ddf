//! Benchmarks for the versioned table, job store and change queue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hclsense_incremental::prelude::*;
use hclsense_incremental::ChangeStore;

fn bench_table(c: &mut Criterion) {
    let table: VersionedTable<Vec<u8>> = VersionedTable::new("bench");
    table
        .write(|txn| {
            for i in 0..100 {
                txn.insert(format!("/work/mod{i}"), vec![0; 64]);
            }
            Ok::<_, ()>(())
        })
        .unwrap();

    c.bench_function("table_snapshot", |b| {
        b.iter(|| {
            let snapshot = table.snapshot();
            black_box(snapshot.get("/work/mod42").map(|row| row.len()));
        })
    });

    c.bench_function("table_copy_on_write", |b| {
        b.iter(|| {
            table
                .write(|txn| {
                    let mut row = txn.get_copy(black_box("/work/mod42")).unwrap_or_default();
                    row[0] = row[0].wrapping_add(1);
                    txn.insert("/work/mod42", row);
                    Ok::<_, ()>(())
                })
                .unwrap();
        })
    });
}

fn bench_job_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_chain");
    for len in [2usize, 6, 24] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let state = StateStore::new();
            let ctx = RequestContext::new();
            let dir = DirHandle::from_path("/work/mod");
            b.iter(|| {
                let mut prev = None;
                for _ in 0..len {
                    let job = Job::new(dir.clone(), "parse", |_ctx| async { Ok(()) })
                        .depends_on(prev);
                    prev = Some(state.jobs.enqueue_job(&ctx, job).unwrap());
                }
                state.jobs.dequeue_jobs_for_dir(&dir).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_change_queue(c: &mut Criterion) {
    let state = StateStore::new();
    let changes: &ChangeStore = &state.changes;
    let dirs: Vec<DirHandle> = (0..10)
        .map(|i| DirHandle::from_path(format!("/work/mod{i}")))
        .collect();

    c.bench_function("queue_and_drain", |b| {
        b.iter(|| {
            for dir in &dirs {
                changes.queue_change(dir.clone(), ChangeFlags::diagnostics()).unwrap();
                changes.queue_change(dir.clone(), ChangeFlags::removal()).unwrap();
            }
            black_box(changes.drain());
        })
    });
}

criterion_group!(benches, bench_table, bench_job_store, bench_change_queue);
criterion_main!(benches);
