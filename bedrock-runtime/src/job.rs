//! # Jobs
//!
//! A [`WorkItem`] is the unit of submission: a named procedure queued on the
//! job ring and later bound to a free fiber. While it runs, the procedure
//! receives a [`Job`], its handle to everything fiber-local:
//!
//! - submitting more work and suspending on the resulting [`WorkChain`]
//! - the fiber's [`Drifter`] arena
//! - the shared [`TaggedHeapAllocator`]
//!
//! ```rust,ignore
//! let chain = job.submit_work(vec![
//!     WorkItem::new("left", |job| build(job, Side::Left)),
//!     WorkItem::new("right", |job| build(job, Side::Right)),
//! ]);
//! job.yield_on(&chain);
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

use corosensei::Yielder;

use crate::chain::WorkChain;
use crate::context::switch_out;
use crate::drifter::Drifter;
use crate::error::Result;
use crate::fiber::{FiberId, Resume, Suspend};
use crate::scheduler::Bedrock;
use crate::tagged_heap::{AdviseMode, TaggedHeapAllocator};

type Procedure = Box<dyn FnOnce(&mut Job<'_>) + Send>;

/// A named procedure waiting for a fiber.
pub struct WorkItem {
    name: &'static str,
    procedure: Procedure,
}

impl WorkItem {
    /// Wrap a closure.
    pub fn new<F>(name: &'static str, procedure: F) -> Self
    where
        F: FnOnce(&mut Job<'_>) + Send + 'static,
    {
        Self {
            name,
            procedure: Box::new(procedure),
        }
    }

    /// Bind a plain function to its argument.
    pub fn from_fn<A>(name: &'static str, procedure: fn(&mut Job<'_>, A), arg: A) -> Self
    where
        A: Send + 'static,
    {
        Self::new(name, move |job| procedure(job, arg))
    }

    /// Debug name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn run(self, job: &mut Job<'_>) {
        (self.procedure)(job)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem").field("name", &self.name).finish()
    }
}

/// Handle passed to a running work item.
pub struct Job<'a> {
    bedrock: &'a Bedrock,
    yielder: &'a Yielder<Resume, Suspend>,
    drifter: &'a mut Drifter,
    fiber: FiberId,
    name: &'static str,
}

impl<'a> Job<'a> {
    pub(crate) fn new(
        bedrock: &'a Bedrock,
        yielder: &'a Yielder<Resume, Suspend>,
        drifter: &'a mut Drifter,
        fiber: FiberId,
        name: &'static str,
    ) -> Self {
        Self {
            bedrock,
            yielder,
            drifter,
            fiber,
            name,
        }
    }

    /// The scheduler running this job.
    pub fn bedrock(&self) -> &Bedrock {
        self.bedrock
    }

    /// Name of the running work item.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fiber the job is bound to.
    pub fn fiber_id(&self) -> FiberId {
        self.fiber
    }

    // ------------------------------------------------------------------
    // Work submission and suspension
    // ------------------------------------------------------------------

    /// Queue `items` and return the chain counting them down.
    pub fn submit_work(&self, items: Vec<WorkItem>) -> WorkChain {
        self.bedrock.submit_work(items)
    }

    /// Queue `items` without a chain.
    pub fn submit_detached(&self, items: Vec<WorkItem>) {
        self.bedrock.submit_detached(items)
    }

    /// Suspend until every item on `chain` has completed.
    ///
    /// Returns at once when the chain is already complete. Otherwise the
    /// worker moves on to other work and the job resumes, possibly on a
    /// different thread, once the last item finishes.
    pub fn yield_on(&mut self, chain: &WorkChain) {
        if chain.is_complete() {
            return;
        }
        self.suspend(Suspend::Wait(chain.clone()));
        crate::bedrock_assert!(chain.is_complete(), "fiber {} resumed early", self.fiber);
    }

    /// Requeue this job behind the fibers already runnable.
    pub fn yield_now(&mut self) {
        self.suspend(Suspend::Yield);
    }

    /// Queue `items` and suspend until they have all completed.
    pub fn submit_and_yield(&mut self, items: Vec<WorkItem>) {
        let chain = self.submit_work(items);
        self.yield_on(&chain);
    }

    fn suspend(&mut self, event: Suspend) {
        self.bedrock.record_yield();
        let resumed = switch_out(self.yielder, event);
        crate::bedrock_assert!(
            matches!(resumed, Resume::Continue),
            "fiber {} resumed with a new job while suspended",
            self.fiber
        );
    }

    // ------------------------------------------------------------------
    // Drifter
    // ------------------------------------------------------------------

    /// Bump-allocate from this fiber's arena.
    pub fn drift_allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.drifter.allocate(size, align)
    }

    /// Scratch allocation, reused by the next drift allocation.
    pub fn drift_alias(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.drifter.alias(size, align)
    }

    /// Open an arena scope.
    pub fn drift_push(&mut self) {
        self.drifter.push();
    }

    /// Close the innermost arena scope.
    pub fn drift_pop(&mut self) -> Result<()> {
        self.drifter.pop()
    }

    /// Run `f` inside an arena scope that is closed on every exit path.
    ///
    /// The scope may span suspensions; it stays with the fiber.
    pub fn drift_scope<R>(&mut self, f: impl FnOnce(&mut Job<'a>) -> R) -> R {
        let depth = self.drifter.enter_scope();
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(self)));
        self.drifter.leave_scope(depth, result.is_err());
        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// The fiber's arena.
    pub fn drifter(&mut self) -> &mut Drifter {
        &mut *self.drifter
    }

    // ------------------------------------------------------------------
    // Tagged heap
    // ------------------------------------------------------------------

    /// See [`TaggedHeapAllocator::thalloc`].
    pub fn thalloc(&self, tag: u64, size: usize, align: usize) -> Result<NonNull<u8>> {
        self.heap().thalloc(tag, size, align)
    }

    /// See [`TaggedHeapAllocator::thfree`].
    pub fn thfree(&self, tag: u64) -> Result<()> {
        self.heap().thfree(tag)
    }

    /// See [`TaggedHeapAllocator::thadvise`].
    pub fn thadvise(&self, request: usize, mode: AdviseMode) -> Result<usize> {
        self.heap().thadvise(request, mode)
    }

    /// The shared block allocator.
    pub fn heap(&self) -> &TaggedHeapAllocator {
        self.bedrock.heap()
    }
}

impl fmt::Debug for Job<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("fiber", &self.fiber)
            .field("drifter", &self.drifter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(_job: &mut Job<'_>, value: u32) {
        assert_eq!(value * 2, 84);
    }

    #[test]
    fn test_work_item_names() {
        let item = WorkItem::new("closure", |_job| {});
        assert_eq!(item.name(), "closure");
        assert!(format!("{item:?}").contains("closure"));

        let item = WorkItem::from_fn("double", double, 42);
        assert_eq!(item.name(), "double");
    }

    #[test]
    fn test_work_item_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WorkItem>();
    }
}
