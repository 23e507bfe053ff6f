//! # Fibers
//!
//! The scheduler owns a fixed pool of fibers created at start-up. Each one is
//! an [`ExecutionContext`] running [`fiber_main`], a loop that receives a
//! work item, runs it to completion and hands the fiber back to its worker.
//!
//! ## Lifecycle
//!
//! ```text
//!          Run(item)                Finished
//!   Free ────────────> Running ───────────────> PendingRecycle ──> Free
//!                       │   ^
//!          Wait / Yield │   │ Continue
//!                       v   │
//!                      Waiting
//! ```
//!
//! Only one worker touches a fiber at a time: its index travels through the
//! free-fiber and resumable rings, and whoever dequeues it owns it until it
//! is enqueued again.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use corosensei::Yielder;
use parking_lot::Mutex;
use tracing::trace;

use crate::chain::WorkChain;
use crate::context::{switch_out, ExecutionContext};
use crate::drifter::Drifter;
use crate::error::Result;
use crate::job::{Job, WorkItem};
use crate::panic::catch_job_panic;
use crate::scheduler::{Bedrock, Shared};
use crate::tagged_heap::TaggedHeapAllocator;

/// Index of a fiber in the scheduler's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub usize);

impl FiberId {
    /// Get the raw index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// State of a pooled fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FiberState {
    /// In the free pool.
    #[default]
    Free = 0,
    /// Executing on a worker.
    Running = 1,
    /// Suspended on a chain or a yield.
    Waiting = 2,
    /// Finished its job; about to return to the pool.
    PendingRecycle = 3,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FiberState::Running,
            2 => FiberState::Waiting,
            3 => FiberState::PendingRecycle,
            _ => FiberState::Free,
        }
    }
}

/// Input of a switch into a fiber.
pub(crate) enum Resume {
    /// Run a new item, counting it down on the chain when done.
    Run(WorkItem, Option<WorkChain>),
    /// Return from the suspension point.
    Continue,
    /// Leave the fiber loop; sent during teardown.
    Exit,
}

/// Event a fiber hands back to its worker.
pub(crate) enum Suspend {
    /// The job returned or panicked.
    Finished(Option<WorkChain>),
    /// The job waits for the chain to drain.
    Wait(WorkChain),
    /// The job asked to be requeued.
    Yield,
}

pub(crate) type FiberContext = ExecutionContext<Resume, Suspend>;

/// Context parked in a slot between runs.
struct ParkedContext(FiberContext);

// SAFETY: a parked context is only resumed by the single worker that
// dequeued the fiber's index, never concurrently. Everything living on the
// fiber stack is either `Send` (work items, chains, arcs) or a reference
// into that same stack.
unsafe impl Send for ParkedContext {}

/// One entry of the fiber pool.
pub(crate) struct FiberSlot {
    state: AtomicU8,
    job: Mutex<Option<&'static str>>,
    context: Mutex<Option<ParkedContext>>,
}

impl FiberSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(FiberState::Free as u8),
            job: Mutex::new(None),
            context: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Name of the job bound to the fiber, if any.
    pub(crate) fn job_name(&self) -> Option<&'static str> {
        *self.job.lock()
    }

    pub(crate) fn set_job_name(&self, name: Option<&'static str>) {
        *self.job.lock() = name;
    }

    pub(crate) fn take_context(&self) -> Option<FiberContext> {
        self.context.lock().take().map(|parked| parked.0)
    }

    pub(crate) fn put_context(&self, context: FiberContext) {
        *self.context.lock() = Some(ParkedContext(context));
    }
}

impl fmt::Debug for FiberSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberSlot")
            .field("state", &self.state())
            .field("job", &self.job_name())
            .finish()
    }
}

/// Create the context for pool entry `index`.
pub(crate) fn make_fiber(
    shared: Weak<Shared>,
    heap: Arc<TaggedHeapAllocator>,
    index: usize,
    stack_size: usize,
) -> Result<FiberContext> {
    ExecutionContext::make_context(stack_size, move |yielder, first| {
        fiber_main(shared, heap, index, yielder, first)
    })
}

/// Body of every pooled fiber.
fn fiber_main(
    shared: Weak<Shared>,
    heap: Arc<TaggedHeapAllocator>,
    index: usize,
    yielder: &Yielder<Resume, Suspend>,
    first: Resume,
) {
    let mut drifter = Drifter::new(heap);
    let mut input = first;
    loop {
        match input {
            Resume::Run(item, chain) => {
                // The strong handle lives only while the job runs.
                if let Some(shared) = shared.upgrade() {
                    run_item(&Bedrock::from_shared(shared), item, index, yielder, &mut drifter);
                }
                drifter.reset();
                input = switch_out(yielder, Suspend::Finished(chain));
            }
            Resume::Continue => {
                crate::bedrock_assert!(false, "idle fiber {} resumed", index);
                break;
            }
            Resume::Exit => break,
        }
    }
}

fn run_item(
    bedrock: &Bedrock,
    item: WorkItem,
    index: usize,
    yielder: &Yielder<Resume, Suspend>,
    drifter: &mut Drifter,
) {
    let name = item.name();
    let instruments = bedrock.config().scheduler.debug_instruments_enabled;
    if instruments {
        trace!(job = name, fiber = index, "job started");
    }

    let mut job = Job::new(bedrock, yielder, drifter, FiberId(index), name);
    if catch_job_panic(name, || item.run(&mut job)).is_err() {
        bedrock.record_panic();
    }

    if instruments {
        trace!(job = name, fiber = index, "job finished");
    }
}
