//! Work chains.
//!
//! A [`WorkChain`] counts the outstanding items of one submission. Each
//! completed item decrements it; the item that brings it to zero wakes every
//! fiber parked on the chain.
//!
//! Parking and waking both take the waiter lock, and parking re-reads the
//! counter under it, so a fiber can never park after the final decrement has
//! already drained the waiter list.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

struct ChainInner {
    remaining: AtomicUsize,
    waiters: Mutex<Vec<usize>>,
}

/// Shared countdown for a batch of submitted work items.
#[derive(Clone)]
pub struct WorkChain {
    inner: Arc<ChainInner>,
}

impl WorkChain {
    /// Chain expecting `count` completions.
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                remaining: AtomicUsize::new(count),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Items still outstanding.
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Whether every item has completed.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Record one completed item.
    ///
    /// Returns the fibers to wake when this was the last item.
    pub(crate) fn complete_one(&self) -> Vec<usize> {
        let previous = self.inner.remaining.fetch_sub(1, Ordering::AcqRel);
        crate::bedrock_assert!(previous > 0, "work chain completed more times than submitted");
        if previous == 1 {
            std::mem::take(&mut *self.inner.waiters.lock())
        } else {
            Vec::new()
        }
    }

    /// Register `fiber` as waiting.
    ///
    /// Returns `false` without registering when the chain is already
    /// complete; the caller must then make the fiber runnable itself.
    pub(crate) fn park(&self, fiber: usize) -> bool {
        let mut waiters = self.inner.waiters.lock();
        if self.inner.remaining.load(Ordering::Acquire) == 0 {
            return false;
        }
        waiters.push(fiber);
        true
    }

    /// Number of parked fibers.
    pub fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    /// Whether two handles refer to the same chain.
    pub fn ptr_eq(&self, other: &WorkChain) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WorkChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkChain")
            .field("remaining", &self.remaining())
            .finish()
    }
}
