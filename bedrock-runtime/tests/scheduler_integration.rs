//! End-to-end scheduler scenarios.
//!
//! Assertions inside a job would be caught as job panics, so every job
//! records what it saw and the checks run after `run` returns.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bedrock_runtime::memory::BLOCK_SIZE;
use bedrock_runtime::{run, Job, RuntimeConfig, SchedulerStats, WorkItem};
use parking_lot::Mutex;

fn small_config(workers: usize, fibers: usize) -> RuntimeConfig {
    RuntimeConfig::builder()
        .worker_thread_count(workers)
        .fiber_count(fibers)
        .job_queue_log2_capacity(4)
        .pin_workers(false)
        .memory_budget(32 * BLOCK_SIZE)
        .tagged_heap_count(4)
        .build()
        .unwrap()
}

fn counter_items(counters: &Arc<Vec<AtomicUsize>>) -> Vec<WorkItem> {
    (0..counters.len())
        .map(|i| {
            let counters = counters.clone();
            WorkItem::new("count", move |_job| {
                counters[i].fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect()
}

#[test]
fn sixteen_jobs_on_a_sixteen_slot_queue() {
    let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..16).map(|_| AtomicUsize::new(0)).collect());
    let remaining = Arc::new(AtomicUsize::new(usize::MAX));

    let items = counters.clone();
    let seen = remaining.clone();
    run(small_config(2, 8), move |job| {
        let chain = job.submit_work(counter_items(&items));
        job.yield_on(&chain);
        seen.store(chain.remaining(), Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(remaining.load(Ordering::SeqCst), 0);
    for counter in counters.iter() {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn chain_resumes_only_after_every_item() {
    let done = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(0));

    let items_done = done.clone();
    let seen = observed.clone();
    run(small_config(2, 16), move |job| {
        let items = (0..12)
            .map(|_| {
                let done = items_done.clone();
                WorkItem::new("slow", move |job: &mut Job<'_>| {
                    job.yield_now();
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        job.submit_and_yield(items);
        seen.store(items_done.load(Ordering::SeqCst), Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(observed.load(Ordering::SeqCst), 12);
    assert_eq!(done.load(Ordering::SeqCst), 12);
}

#[test]
fn nested_submit_and_yield() {
    let leaves = Arc::new(AtomicUsize::new(0));
    let counted = leaves.clone();

    let status = run(small_config(2, 32), move |job| {
        let branches = (0..4)
            .map(|_| {
                let leaves = counted.clone();
                WorkItem::new("branch", move |job: &mut Job<'_>| {
                    let items = (0..4)
                        .map(|_| {
                            let leaves = leaves.clone();
                            WorkItem::new("leaf", move |_job| {
                                leaves.fetch_add(1, Ordering::SeqCst);
                            })
                        })
                        .collect();
                    job.submit_and_yield(items);
                })
            })
            .collect();
        job.submit_and_yield(branches);
        job.bedrock()
            .set_exit_status(counted.load(Ordering::SeqCst) as i32);
    })
    .unwrap();

    assert_eq!(status, 16);
    assert_eq!(leaves.load(Ordering::SeqCst), 16);
}

#[test]
fn drift_allocation_larger_than_a_block() {
    let result = Arc::new(Mutex::new(None));
    let out = result.clone();

    run(small_config(1, 4), move |job| {
        let size = 3 * 1024 * 1024;
        let outcome = job.drift_allocate(size, 16).map(|ptr| {
            // The whole range must be writable.
            unsafe { ptr.as_ptr().write_bytes(0x5A, size) };
            ptr.as_ptr() as usize
        });
        *out.lock() = Some(outcome.is_ok() && outcome.unwrap_or(1) % 16 == 0);
    })
    .unwrap();

    assert_eq!(*result.lock(), Some(true));
}

#[test]
fn drift_scope_survives_suspension() {
    let reused = Arc::new(AtomicBool::new(false));
    let out = reused.clone();

    run(small_config(2, 8), move |job| {
        let before = job.drift_scope(|job| {
            let ptr = job.drift_allocate(4096, 64).ok();
            job.submit_and_yield(vec![WorkItem::new("noop", |_job| {})]);
            ptr
        });
        let after = job.drift_allocate(4096, 64).ok();
        out.store(before.is_some() && before == after, Ordering::SeqCst);
    })
    .unwrap();

    assert!(reused.load(Ordering::SeqCst));
}

#[test]
fn tagged_heap_free_restores_blocks() {
    let outcome = Arc::new(Mutex::new(None));
    let out = outcome.clone();

    run(small_config(1, 4), move |job| {
        let before = job.heap().free_blocks_total();
        let ok = job.thalloc(7, 5 * 1024 * 1024, 64).is_ok()
            && job.thalloc(7, 128, 8).is_ok()
            && job.heap().is_live(7);
        let during = job.heap().free_blocks_total();
        let freed = job.thfree(7).is_ok();
        let after = job.heap().free_blocks_total();
        *out.lock() = Some((ok, freed, before, during, after));
    })
    .unwrap();

    let (ok, freed, before, during, after) = outcome.lock().take().unwrap();
    assert!(ok && freed);
    assert!(during < before);
    assert_eq!(after, before);
}

#[test]
fn panicking_job_is_counted_and_chain_completes() {
    let stats = Arc::new(Mutex::new(SchedulerStats::default()));
    let out = stats.clone();

    run(small_config(2, 8), move |job| {
        let chain = job.submit_work(vec![
            WorkItem::new("fine", |_job| {}),
            WorkItem::new("broken", |_job| panic!("job failure")),
        ]);
        job.yield_on(&chain);
        *out.lock() = job.bedrock().stats();
    })
    .unwrap();

    let stats = *stats.lock();
    assert_eq!(stats.jobs_panicked, 1);
    assert_eq!(stats.jobs_completed, 2);
}

#[test]
fn yield_now_requeues_and_resumes() {
    let stats = Arc::new(Mutex::new(SchedulerStats::default()));
    let rounds = Arc::new(AtomicUsize::new(0));
    let out = stats.clone();
    let counted = rounds.clone();

    run(small_config(1, 8), move |job| {
        let chain = job.submit_work(vec![WorkItem::new("yielder", move |job: &mut Job<'_>| {
            for _ in 0..3 {
                job.yield_now();
                counted.fetch_add(1, Ordering::SeqCst);
            }
        })]);
        job.yield_on(&chain);
        *out.lock() = job.bedrock().stats();
    })
    .unwrap();

    let stats = *stats.lock();
    assert_eq!(rounds.load(Ordering::SeqCst), 3);
    assert!(stats.yields >= 3);
    assert!(stats.resumes >= 3);
    assert_eq!(stats.jobs_completed, 1);
}

#[test]
fn exit_status_defaults_to_zero() {
    assert_eq!(run(small_config(1, 2), |_job| {}).unwrap(), 0);
}

#[test]
fn detached_work_sets_exit_status_after_root_returns() {
    let status = run(small_config(2, 4), |job| {
        job.submit_detached(vec![WorkItem::new("late status", |job: &mut Job<'_>| {
            thread::sleep(Duration::from_millis(50));
            job.bedrock().set_exit_status(7);
        })]);
    })
    .unwrap();
    assert_eq!(status, 7);
}

#[test]
fn root_panic_still_shuts_down() {
    let status = run(small_config(2, 4), |job| {
        job.bedrock().set_exit_status(9);
        panic!("root failure");
    })
    .unwrap();
    assert_eq!(status, 9);
}
