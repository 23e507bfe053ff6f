//! # Fiber Job Scheduler
//!
//! M:N cooperative scheduler: N worker threads multiplex a fixed pool of
//! fibers, pulling work items from one shared MPMC job ring.
//!
//! ## Design
//!
//! ```text
//!   submit_work ──> [ job ring ] ──┐
//!                                  ├──> worker ── switch_into ──> fiber
//!   chain drains ─> [ resumable ] ─┘       ^                        │
//!                                          └─── Finished / Wait / Yield
//!   [ free fibers ] <── recycled after Finished
//! ```
//!
//! - Workers prefer resumable fibers over new jobs, and claim both in FIFO
//!   order; there is no work-stealing and no priority
//! - A job that waits on a [`WorkChain`] hands its worker back; the fiber
//!   becomes resumable when the chain drains, on whichever worker gets to it
//! - Shutdown queues one poison pill per worker behind the outstanding work
//!
//! A fiber that submits into a full job ring spins until a worker drains it;
//! with a single worker that worker is the spinning thread itself.
//!
//! The fiber pool is fixed. A worker holding a job spins in
//! `claim_free_fiber` until some fiber is recycled, so if every fiber waits
//! on a chain whose items are queued behind that job, nothing frees one.
//! Nesting `submit_and_yield` at least `fiber_count` deep does this.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::chain::WorkChain;
use crate::config::RuntimeConfig;
use crate::context::Switch;
use crate::defer::Defer;
use crate::error::{Error, Result};
use crate::fiber::{make_fiber, FiberContext, FiberId, FiberSlot, FiberState, Resume, Suspend};
use crate::job::{Job, WorkItem};
use crate::ring::MpmcRing;
use crate::tagged_heap::TaggedHeapAllocator;

/// How long an idle worker parks before polling the rings again.
const IDLE_PARK: Duration = Duration::from_millis(1);

enum QueueEntry {
    Work {
        item: WorkItem,
        chain: Option<WorkChain>,
    },
    Poison,
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerStats {
    /// Work items queued.
    pub jobs_submitted: u64,
    /// Work items that finished, panicking ones included.
    pub jobs_completed: u64,
    /// Work items that panicked.
    pub jobs_panicked: u64,
    /// Suspensions through `yield_on`, `yield_now` or `submit_and_yield`.
    pub yields: u64,
    /// Suspended fibers switched back into.
    pub resumes: u64,
}

#[derive(Default)]
struct Counters {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_panicked: AtomicU64,
    yields: AtomicU64,
    resumes: AtomicU64,
}

/// State shared by the workers, the fibers and every [`Bedrock`] handle.
pub(crate) struct Shared {
    config: RuntimeConfig,
    heap: Arc<TaggedHeapAllocator>,
    jobs: MpmcRing<QueueEntry>,
    resumable: MpmcRing<usize>,
    free_fibers: MpmcRing<usize>,
    fibers: Box<[FiberSlot]>,
    exit_status: AtomicI32,
    counters: Counters,
}

impl Shared {
    /// Build the heap, the rings and the fiber pool.
    fn new(config: RuntimeConfig) -> Result<Arc<Self>> {
        let heap = Arc::new(TaggedHeapAllocator::new(&config.memory)?);
        let fiber_count = config.scheduler.effective_fiber_count();
        // Every fiber index fits in these rings at once, so pushes never spin.
        let pool_capacity = fiber_count.max(2).next_power_of_two();

        let shared = Arc::new(Self {
            jobs: MpmcRing::with_log2_capacity(config.scheduler.job_queue_log2_capacity)?,
            resumable: MpmcRing::with_capacity(pool_capacity)?,
            free_fibers: MpmcRing::with_capacity(pool_capacity)?,
            fibers: (0..fiber_count).map(|_| FiberSlot::new()).collect(),
            exit_status: AtomicI32::new(0),
            counters: Counters::default(),
            heap,
            config,
        });

        let stack_size = shared.config.scheduler.fiber_stack_size;
        for (index, slot) in shared.fibers.iter().enumerate() {
            let context = make_fiber(Arc::downgrade(&shared), shared.heap.clone(), index, stack_size)?;
            slot.put_context(context);
            push_spin(&shared.free_fibers, index);
        }
        Ok(shared)
    }

    fn enqueue(&self, mut entry: QueueEntry) {
        let backoff = Backoff::new();
        loop {
            match self.jobs.enqueue(entry) {
                Ok(()) => return,
                Err(rejected) => {
                    entry = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    fn submit(&self, items: Vec<WorkItem>, chain: Option<WorkChain>) {
        self.counters
            .jobs_submitted
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        for item in items {
            self.enqueue(QueueEntry::Work {
                item,
                chain: chain.clone(),
            });
        }
    }

    /// Take a free fiber, running resumable fibers while none is free.
    fn claim_free_fiber(&self) -> usize {
        let backoff = Backoff::new();
        loop {
            if let Some(index) = self.free_fibers.dequeue() {
                return index;
            }
            if let Some(index) = self.resumable.dequeue() {
                self.resume_fiber(index, Resume::Continue);
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Switch into fiber `index` and act on how it comes back.
    fn resume_fiber(&self, index: usize, input: Resume) {
        let slot = &self.fibers[index];
        let Some(mut context) = slot.take_context() else {
            error!(fiber = index, "fiber context missing");
            return;
        };

        match &input {
            Resume::Run(item, _) => slot.set_job_name(Some(item.name())),
            Resume::Continue => {
                self.counters.resumes.fetch_add(1, Ordering::Relaxed);
            }
            Resume::Exit => {}
        }
        slot.set_state(FiberState::Running);
        let event = context.switch_into(input);
        // Back in the slot before the index can reach another worker.
        slot.put_context(context);

        match event {
            Switch::Suspended(Suspend::Finished(chain)) => {
                slot.set_state(FiberState::PendingRecycle);
                self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
                if let Some(chain) = chain {
                    for waiter in chain.complete_one() {
                        push_spin(&self.resumable, waiter);
                    }
                }
                slot.set_job_name(None);
                slot.set_state(FiberState::Free);
                push_spin(&self.free_fibers, index);
            }
            Switch::Suspended(Suspend::Wait(chain)) => {
                slot.set_state(FiberState::Waiting);
                if !chain.park(index) {
                    push_spin(&self.resumable, index);
                }
            }
            Switch::Suspended(Suspend::Yield) => {
                slot.set_state(FiberState::Waiting);
                push_spin(&self.resumable, index);
            }
            Switch::Returned => {
                warn!(fiber = index, "fiber left its loop and is retired");
            }
        }
    }

    /// Exit idle fibers and abandon the ones still suspended.
    fn retire_fibers(&self) {
        let mut abandoned = 0usize;
        for (index, slot) in self.fibers.iter().enumerate() {
            let Some(mut context) = slot.take_context() else {
                continue;
            };
            match slot.state() {
                FiberState::Free if context.is_started() => {
                    if let Switch::Suspended(_) = context.switch_into(Resume::Exit) {
                        warn!(fiber = index, "fiber ignored exit request");
                        mem::forget(context);
                    }
                }
                FiberState::Free => drop(context),
                state => {
                    warn!(
                        fiber = index,
                        ?state,
                        job = slot.job_name().unwrap_or("?"),
                        "abandoning suspended fiber"
                    );
                    abandon(context);
                    abandoned += 1;
                }
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "fibers were still suspended at shutdown");
        }
    }
}

/// Leak a suspended context; unwinding its stack would run the job's
/// cleanup outside the scheduler.
fn abandon(context: FiberContext) {
    mem::forget(context);
}

fn push_spin(ring: &MpmcRing<usize>, mut value: usize) {
    let backoff = Backoff::new();
    while let Err(rejected) = ring.enqueue(value) {
        value = rejected;
        backoff.snooze();
    }
}

/// Handle to a running scheduler, passed to every job.
///
/// Cheap to clone; usable from any thread.
#[derive(Clone)]
pub struct Bedrock {
    shared: Arc<Shared>,
}

impl Bedrock {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Queue `items`, returning a chain that drains as they complete.
    pub fn submit_work(&self, items: Vec<WorkItem>) -> WorkChain {
        let chain = WorkChain::new(items.len());
        self.shared.submit(items, Some(chain.clone()));
        chain
    }

    /// Queue `items` with nothing to wait on.
    pub fn submit_detached(&self, items: Vec<WorkItem>) {
        self.shared.submit(items, None);
    }

    /// Set the value [`run`] returns.
    pub fn set_exit_status(&self, status: i32) {
        self.shared.exit_status.store(status, Ordering::Release);
    }

    /// Last status recorded by [`set_exit_status`](Self::set_exit_status).
    pub fn exit_status(&self) -> i32 {
        self.shared.exit_status.load(Ordering::Acquire)
    }

    /// The shared block allocator.
    pub fn heap(&self) -> &TaggedHeapAllocator {
        &self.shared.heap
    }

    /// Configuration the scheduler was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Size of the fiber pool.
    pub fn fiber_count(&self) -> usize {
        self.shared.fibers.len()
    }

    /// State of one pooled fiber.
    pub fn fiber_state(&self, fiber: FiberId) -> Option<FiberState> {
        self.shared.fibers.get(fiber.index()).map(FiberSlot::state)
    }

    /// Work items waiting in the job ring.
    pub fn queued_jobs(&self) -> usize {
        self.shared.jobs.len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            jobs_submitted: c.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: c.jobs_completed.load(Ordering::Relaxed),
            jobs_panicked: c.jobs_panicked.load(Ordering::Relaxed),
            yields: c.yields.load(Ordering::Relaxed),
            resumes: c.resumes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_yield(&self) {
        self.shared.counters.yields.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.shared.counters.jobs_panicked.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Bedrock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bedrock")
            .field("workers", &self.shared.config.scheduler.worker_thread_count)
            .field("fibers", &self.shared.fibers.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A worker thread.
struct Worker {
    id: usize,
    shared: Arc<Shared>,
}

impl Worker {
    fn spawn(id: usize, shared: Arc<Shared>) -> Result<JoinHandle<()>> {
        let worker = Worker { id, shared };
        thread::Builder::new()
            .name(format!("bedrock-worker-{id}"))
            .spawn(move || worker.run_loop())
            .map_err(|e| Error::Init(format!("failed to spawn worker thread {id}: {e}")))
    }

    fn run_loop(self) {
        if self.shared.config.scheduler.pin_workers {
            pin_to_cpu(self.id);
        }
        debug!(worker = self.id, "worker started");

        let backoff = Backoff::new();
        loop {
            if let Some(fiber) = self.shared.resumable.dequeue() {
                self.shared.resume_fiber(fiber, Resume::Continue);
                backoff.reset();
                continue;
            }

            match self.shared.jobs.dequeue() {
                Some(QueueEntry::Work { item, chain }) => {
                    let fiber = self.shared.claim_free_fiber();
                    self.shared.resume_fiber(fiber, Resume::Run(item, chain));
                    backoff.reset();
                }
                Some(QueueEntry::Poison) => break,
                None if backoff.is_completed() => thread::park_timeout(IDLE_PARK),
                None => backoff.snooze(),
            }
        }

        debug!(worker = self.id, "worker exiting");
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(worker: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpu = worker % crate::config::num_cpus();
    let mut set = CpuSet::new();
    let result = set
        .set(cpu)
        .and_then(|()| sched_setaffinity(Pid::from_raw(0), &set));
    if let Err(e) = result {
        warn!(worker, cpu, error = %e, "failed to pin worker");
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(worker: usize) {
    debug!(worker, "worker pinning unsupported on this platform");
}

/// Stop the workers and tear the pool down.
fn shutdown(shared: Arc<Shared>, workers: Vec<JoinHandle<()>>) {
    for _ in &workers {
        shared.enqueue(QueueEntry::Poison);
    }
    for handle in workers {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
    shared.retire_fibers();
}

/// Start the scheduler, run `main` as the root job and tear down after it
/// returns.
///
/// Blocks the calling thread. Returns the status last recorded through
/// [`Bedrock::set_exit_status`], including by detached work that runs after
/// the root job returns, or an initialization error before any worker has
/// started.
///
/// Work still queued behind the shutdown pills is dropped unrun, and fibers
/// still suspended at shutdown are abandoned.
pub fn run<F>(config: RuntimeConfig, main: F) -> Result<i32>
where
    F: FnOnce(&mut Job<'_>) + Send + 'static,
{
    config.validate()?;
    let worker_count = config.scheduler.worker_thread_count;
    let shared = Shared::new(config)?;
    info!(
        workers = worker_count,
        fibers = shared.fibers.len(),
        queue = shared.jobs.capacity(),
        "bedrock starting"
    );

    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        match Worker::spawn(id, shared.clone()) {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                error!(error = %e, "worker start failed");
                shutdown(shared, workers);
                return Err(e);
            }
        }
    }

    let root_done = Arc::new((Mutex::new(false), Condvar::new()));
    let signal = root_done.clone();
    shared.submit(
        vec![WorkItem::new("main", move |job| {
            let _done = Defer::new(move || {
                let (done, cvar) = &*signal;
                *done.lock() = true;
                cvar.notify_all();
            });
            main(job);
        })],
        None,
    );

    {
        let (done, cvar) = &*root_done;
        let mut done = done.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }

    // Detached work still ahead of the pills may record a status.
    shutdown(shared.clone(), workers);
    let status = shared.exit_status.load(Ordering::Acquire);
    info!(status, "bedrock stopped");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BLOCK_SIZE;
    use std::sync::atomic::AtomicUsize;

    fn config(workers: usize) -> RuntimeConfig {
        RuntimeConfig::builder()
            .worker_thread_count(workers)
            .fiber_count(8)
            .job_queue_log2_capacity(4)
            .pin_workers(false)
            .memory_budget(32 * BLOCK_SIZE)
            .tagged_heap_count(4)
            .build()
            .unwrap()
    }

    #[test]
    fn test_run_returns_exit_status() {
        let status = run(config(1), |job| job.bedrock().set_exit_status(3)).unwrap();
        assert_eq!(status, 3);
    }

    #[test]
    fn test_run_rejects_invalid_config() {
        let bad = RuntimeConfig::builder()
            .worker_thread_count(0)
            .build_unchecked();
        assert!(matches!(run(bad, |_job| {}), Err(Error::Config(_))));
    }

    #[test]
    fn test_single_worker_chain() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        run(config(1), move |job| {
            let items = (0..6)
                .map(|_| {
                    let hits = seen.clone();
                    WorkItem::new("hit", move |_job| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();
            job.submit_and_yield(items);
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_stats_and_fiber_states() {
        let observed = Arc::new(Mutex::new(None));
        let out = observed.clone();
        run(config(2), move |job| {
            let chain = job.submit_work(vec![WorkItem::new("noop", |_job| {})]);
            job.yield_on(&chain);
            let bedrock = job.bedrock();
            let state = bedrock.fiber_state(job.fiber_id());
            *out.lock() = Some((bedrock.stats(), state, bedrock.fiber_count()));
        })
        .unwrap();

        let (stats, state, fibers) = observed.lock().take().unwrap();
        assert_eq!(state, Some(FiberState::Running));
        assert_eq!(fibers, 8);
        assert_eq!(stats.jobs_submitted, 2);
        assert_eq!(stats.jobs_completed, 1);
        assert!(stats.yields <= 1);
    }

    #[test]
    fn test_submit_detached_runs_before_shutdown() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        run(config(2), move |job| {
            let items = (0..4)
                .map(|_| {
                    let hits = seen.clone();
                    WorkItem::new("detached", move |_job| {
                        hits.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();
            job.submit_detached(items);
        })
        .unwrap();
        // Poison pills queue behind the detached items.
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }
}
