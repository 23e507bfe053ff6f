//! Execution contexts.
//!
//! The narrow stack-switching trampoline the scheduler is built on:
//!
//! - [`ExecutionContext::make_context`] allocates a stack and binds an entry
//!   function to it
//! - [`ExecutionContext::switch_into`] transfers control from the calling
//!   thread into the context until it suspends or returns
//! - [`switch_out`] transfers control from inside a context back to whoever
//!   switched into it
//!
//! Stacks come from `corosensei`'s default stack, which places a guard page
//! below the usable region where the platform supports it; overflowing a
//! fiber stack faults on that page.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::{Error, Result};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Context currently running on this thread, 0 for the thread's own stack.
    static CURRENT_CONTEXT: Cell<u64> = const { Cell::new(0) };
}

/// Outcome of a [`ExecutionContext::switch_into`].
#[derive(Debug, PartialEq, Eq)]
pub enum Switch<Y> {
    /// The context called [`switch_out`] with this event.
    Suspended(Y),
    /// The entry function returned; the context cannot be entered again.
    Returned,
}

/// A suspended stack of execution, entered with `I` and suspending with `Y`.
pub struct ExecutionContext<I: 'static, Y: 'static> {
    id: u64,
    coroutine: Coroutine<I, Y, (), DefaultStack>,
}

impl<I: 'static, Y: 'static> ExecutionContext<I, Y> {
    /// Allocate a `stack_size` byte stack and bind `entry` to it.
    ///
    /// `entry` receives the input of the first [`switch_into`](Self::switch_into).
    pub fn make_context<F>(stack_size: usize, entry: F) -> Result<Self>
    where
        F: FnOnce(&Yielder<I, Y>, I) + 'static,
    {
        let stack = DefaultStack::new(stack_size).map_err(|e| Error::map_failed("fiber stack", e))?;
        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            coroutine: Coroutine::with_stack(stack, entry),
        })
    }

    /// Unique id of this context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the entry function has returned.
    pub fn is_done(&self) -> bool {
        self.coroutine.done()
    }

    /// Whether the context has been entered at least once.
    pub fn is_started(&self) -> bool {
        self.coroutine.started()
    }

    /// Run the context until it suspends or returns.
    pub fn switch_into(&mut self, input: I) -> Switch<Y> {
        let previous = CURRENT_CONTEXT.with(Cell::get);
        crate::bedrock_assert!(previous != self.id, "context {} switched into itself", self.id);
        crate::bedrock_assert!(!self.coroutine.done(), "context {} already returned", self.id);

        CURRENT_CONTEXT.with(|c| c.set(self.id));
        let result = self.coroutine.resume(input);
        CURRENT_CONTEXT.with(|c| c.set(previous));

        match result {
            CoroutineResult::Yield(event) => Switch::Suspended(event),
            CoroutineResult::Return(()) => Switch::Returned,
        }
    }
}

impl<I: 'static, Y: 'static> fmt::Debug for ExecutionContext<I, Y> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("started", &self.is_started())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Suspend the running context, handing `event` to its switcher.
///
/// Returns the input of the next [`ExecutionContext::switch_into`].
pub fn switch_out<I, Y>(yielder: &Yielder<I, Y>, event: Y) -> I {
    yielder.suspend(event)
}

/// Id of the context running on this thread, if any.
pub fn current_context_id() -> Option<u64> {
    match CURRENT_CONTEXT.with(Cell::get) {
        0 => None,
        id => Some(id),
    }
}
