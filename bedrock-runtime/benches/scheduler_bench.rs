//! Scheduler benchmarks using criterion.
//!
//! Run with: cargo bench --bench scheduler_bench

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bedrock_runtime::memory::BLOCK_SIZE;
use bedrock_runtime::{run, Job, RuntimeConfig, WorkItem};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn config(workers: usize) -> RuntimeConfig {
    RuntimeConfig::builder()
        .worker_thread_count(workers)
        .fiber_count(128)
        .job_queue_log2_capacity(11)
        .pin_workers(false)
        .debug_instruments_enabled(false)
        .memory_budget(64 * BLOCK_SIZE)
        .build()
        .expect("bench config")
}

fn fan_out(job: &mut Job<'_>, jobs: usize, hits: &Arc<AtomicUsize>) {
    let items = (0..jobs)
        .map(|_| {
            let hits = hits.clone();
            WorkItem::new("noop", move |_job| {
                hits.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    job.submit_and_yield(items);
}

fn bench_run_startup(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_startup");
    group.sample_size(10);

    for workers in [1usize, 2, 4] {
        group.bench_with_input(BenchmarkId::new("empty_main", workers), &workers, |b, &workers| {
            b.iter(|| run(config(workers), |_job| {}).expect("run"));
        });
    }

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_fan_out");
    group.sample_size(10);

    for jobs in [64usize, 512, 1024] {
        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::new("submit_and_yield", jobs), &jobs, |b, &jobs| {
            b.iter(|| {
                let hits = Arc::new(AtomicUsize::new(0));
                let counted = hits.clone();
                run(config(2), move |job| fan_out(job, jobs, &counted)).expect("run");
                assert_eq!(hits.load(Ordering::Relaxed), jobs);
            });
        });
    }

    group.finish();
}

fn bench_yield_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_yield");
    group.sample_size(10);

    group.bench_function("yield_now_x1000", |b| {
        b.iter(|| {
            run(config(1), |job| {
                for _ in 0..1000 {
                    job.yield_now();
                }
            })
            .expect("run")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_run_startup, bench_fan_out, bench_yield_round_trip);
criterion_main!(benches);
