//! Scope-exit actions.
//!
//! [`Defer`] runs a closure when it goes out of scope, on normal return and
//! during unwinding alike. [`DeferStack`] collects several actions and runs
//! them in reverse registration order. Every action runs at most once.

use std::fmt;

/// Runs a closure on drop unless cancelled.
#[must_use = "a Defer runs immediately if not bound to a variable"]
pub struct Defer<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    /// Schedule `action` for scope exit.
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Disarm the guard; the action will not run.
    pub fn cancel(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl<F: FnOnce()> fmt::Debug for Defer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defer")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

/// Ordered list of deferred actions, run last-in first-out.
#[derive(Default)]
pub struct DeferStack<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> DeferStack<'a> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action.
    pub fn push(&mut self, action: impl FnOnce() + 'a) {
        self.actions.push(Box::new(action));
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no actions are pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every pending action now.
    pub fn run(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }

    /// Drop every pending action without running it.
    pub fn clear(&mut self) {
        self.actions.clear();
    }
}

impl Drop for DeferStack<'_> {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for DeferStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferStack")
            .field("pending", &self.actions.len())
            .finish()
    }
}

/// Run the given statements when the enclosing scope exits.
///
/// ```
/// use std::cell::Cell;
/// use bedrock_runtime::defer;
///
/// let hits = Cell::new(0);
/// {
///     defer!(hits.set(hits.get() + 1));
///     assert_eq!(hits.get(), 0);
/// }
/// assert_eq!(hits.get(), 1);
/// ```
#[macro_export]
macro_rules! defer {
    ($($body:tt)*) => {
        let _defer_guard = $crate::defer::Defer::new(|| { $($body)*; });
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_defer_runs_on_exit() {
        let log = RefCell::new(Vec::new());
        {
            let _a = Defer::new(|| log.borrow_mut().push("a"));
            let _b = Defer::new(|| log.borrow_mut().push("b"));
            log.borrow_mut().push("body");
        }
        assert_eq!(*log.borrow(), vec!["body", "b", "a"]);
    }

    #[test]
    fn test_cancel() {
        let log = RefCell::new(Vec::<u32>::new());
        {
            let guard = Defer::new(|| log.borrow_mut().push(1));
            guard.cancel();
        }
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_runs_during_unwind() {
        let log = RefCell::new(0);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _g = Defer::new(|| *log.borrow_mut() += 1);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(*log.borrow(), 1);
    }

    #[test]
    fn test_stack_lifo_exactly_once() {
        let log = RefCell::new(Vec::new());
        {
            let mut stack = DeferStack::new();
            for i in 0..3 {
                let log = &log;
                stack.push(move || log.borrow_mut().push(i));
            }
            assert_eq!(stack.len(), 3);
            stack.run();
            assert!(stack.is_empty());
            stack.push(|| log.borrow_mut().push(9));
        }
        assert_eq!(*log.borrow(), vec![2, 1, 0, 9]);
    }

    #[test]
    fn test_macro() {
        let log = RefCell::new(Vec::new());
        {
            defer!(log.borrow_mut().push(2));
            defer!(log.borrow_mut().push(1));
        }
        assert_eq!(*log.borrow(), vec![1, 2]);
    }
}
