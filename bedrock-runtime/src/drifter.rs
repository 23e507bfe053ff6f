//! # Drifter
//!
//! Fiber-scoped bump allocator. Pages are whole blocks drawn from the
//! [`TaggedHeapAllocator`]; allocation bumps the tail page and links a new
//! page when the tail is exhausted.
//!
//! ## Scopes
//!
//! ```text
//!   push()  ── snapshot {page count, tail offset}
//!     allocate / allocate / allocate (may link new pages)
//!   pop()   ── release pages linked since the snapshot, rewind the tail
//! ```
//!
//! Scopes are strictly LIFO. Nothing allocated inside a scope survives its
//! pop. A drifter belongs to exactly one fiber and has no internal locking.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::error;

use crate::error::{Error, Result};
use crate::memory::{check_layout, Region};
use crate::tagged_heap::TaggedHeapAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    pages: usize,
    used: usize,
}

/// Per-fiber bump arena with nested push/pop scopes.
pub struct Drifter {
    heap: Arc<TaggedHeapAllocator>,
    pages: Vec<Region>,
    cursors: Vec<Cursor>,
}

impl Drifter {
    /// Empty drifter; the first page is acquired on first allocation.
    pub fn new(heap: Arc<TaggedHeapAllocator>) -> Self {
        Self {
            heap,
            pages: Vec::new(),
            cursors: Vec::new(),
        }
    }

    /// Bump-allocate `size` bytes aligned to `align`.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        check_layout(size, align)?;
        if let Some(ptr) = self.pages.last_mut().and_then(|tail| tail.allocate(size, align)) {
            return Ok(ptr);
        }

        let mut page = self.heap.allocate_page(size, align).map_err(|e| {
            error!(size, align, error = %e, "drifter page allocation failed");
            e
        })?;
        let ptr = page.allocate(size, align);
        self.pages.push(page);
        ptr.ok_or(Error::InvalidParameters("request does not fit a fresh page"))
    }

    /// Allocate, then rewind so the next allocation reuses the same bytes.
    ///
    /// The result stays valid only until the next drift allocation.
    pub fn alias(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let mark = self.cursor();
        let ptr = self.allocate(size, align)?;
        match self.pages.len() {
            // A fresh page was linked: keep it, but leave it empty.
            n if n > mark.pages => {
                if let Some(tail) = self.pages.last_mut() {
                    tail.reset();
                }
            }
            _ => {
                if let Some(tail) = self.pages.last_mut() {
                    tail.rewind(mark.used);
                }
            }
        }
        Ok(ptr)
    }

    /// Open a scope.
    pub fn push(&mut self) {
        let cursor = self.cursor();
        self.cursors.push(cursor);
    }

    /// Close the innermost scope, releasing everything allocated in it.
    pub fn pop(&mut self) -> Result<()> {
        let Some(cursor) = self.cursors.pop() else {
            crate::bedrock_assert!(false, "drifter pop without a matching push");
            return Err(Error::InvalidParameters("drifter pop without a matching push"));
        };

        // Keep the first page even when the scope started with none.
        let keep = cursor.pages.max(1).min(self.pages.len());
        for page in self.pages.drain(keep..) {
            self.heap.release_page(page);
        }
        if let Some(tail) = self.pages.last_mut() {
            if cursor.pages == 0 {
                tail.reset();
            } else {
                tail.rewind(cursor.used);
            }
        }
        Ok(())
    }

    /// Run `f` inside a scope popped on every exit path, unwinding included.
    pub fn scope<R>(&mut self, f: impl FnOnce(&mut Drifter) -> R) -> R {
        let depth = self.enter_scope();
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(self)));
        self.leave_scope(depth, result.is_err());
        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Push a scope, returning the depth to hand to [`leave_scope`](Self::leave_scope).
    pub(crate) fn enter_scope(&mut self) -> usize {
        let depth = self.cursors.len();
        self.push();
        depth
    }

    /// Pop the scope opened at `depth`, closing anything a panic left open.
    pub(crate) fn leave_scope(&mut self, depth: usize, unwinding: bool) {
        crate::bedrock_assert!(
            unwinding || self.cursors.len() == depth + 1,
            "unbalanced drift scope"
        );
        if self.cursors.len() > depth {
            self.cursors.truncate(depth + 1);
            let _ = self.pop();
        }
    }

    /// Drop every scope and release all pages except the first.
    pub fn reset(&mut self) {
        self.cursors.clear();
        let keep = self.pages.len().min(1);
        for page in self.pages.drain(keep..) {
            self.heap.release_page(page);
        }
        if let Some(first) = self.pages.first_mut() {
            first.reset();
        }
    }

    /// Number of linked pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.cursors.len()
    }

    /// Bytes used in the tail page.
    pub fn tail_used(&self) -> usize {
        self.pages.last().map_or(0, Region::used)
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            pages: self.pages.len(),
            used: self.tail_used(),
        }
    }
}

impl Drop for Drifter {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            self.heap.release_page(page);
        }
    }
}

impl fmt::Debug for Drifter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drifter")
            .field("pages", &self.pages.len())
            .field("depth", &self.cursors.len())
            .field("tail_used", &self.tail_used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::BLOCK_SIZE;

    fn heap() -> Arc<TaggedHeapAllocator> {
        let config = MemoryConfig {
            memory_budget: 32 * BLOCK_SIZE,
            huge_page_ceiling: 0,
            tagged_heap_count: 2,
            frames_in_flight: 1,
        };
        Arc::new(TaggedHeapAllocator::new(&config).unwrap())
    }

    #[test]
    fn test_allocate_aligned() {
        let mut drifter = Drifter::new(heap());
        for align in [1, 8, 64, 4096] {
            let ptr = drifter.allocate(24, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
        }
        assert_eq!(drifter.page_count(), 1);
        assert!(drifter.allocate(0, 8).is_err());
        assert!(drifter.allocate(8, 6).is_err());
    }

    #[test]
    fn test_large_request_rounds_to_blocks() {
        let heap = heap();
        let mut drifter = Drifter::new(heap.clone());
        let size = 3 * 1024 * 1024;
        let ptr = drifter.allocate(size, 16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        unsafe { ptr.as_ptr().write_bytes(0xEE, size) };
        assert_eq!(drifter.page_count(), 1);
        assert!(drifter.tail_used() >= size);
    }

    #[test]
    fn test_push_pop_reuses_bytes() {
        let heap = heap();
        let mut drifter = Drifter::new(heap.clone());
        drifter.allocate(16, 8).unwrap();

        drifter.push();
        let inner = drifter.allocate(1024, 8).unwrap();
        drifter.pop().unwrap();

        let again = drifter.allocate(1024, 8).unwrap();
        assert_eq!(inner, again);
        assert_eq!(drifter.page_count(), 1);
    }

    #[test]
    fn test_pop_releases_linked_pages() {
        let heap = heap();
        let mut drifter = Drifter::new(heap.clone());
        drifter.allocate(16, 8).unwrap();
        let free_before = heap.free_blocks_total();

        drifter.push();
        for _ in 0..3 {
            drifter.allocate(BLOCK_SIZE, 1).unwrap();
        }
        assert_eq!(drifter.page_count(), 4);
        drifter.pop().unwrap();

        assert_eq!(drifter.page_count(), 1);
        assert_eq!(heap.free_blocks_total(), free_before);
    }

    #[test]
    fn test_nested_scopes() {
        let mut drifter = Drifter::new(heap());
        drifter.push();
        let a = drifter.allocate(64, 8).unwrap();
        drifter.push();
        drifter.allocate(64, 8).unwrap();
        drifter.pop().unwrap();
        let b = drifter.allocate(64, 8).unwrap();
        drifter.pop().unwrap();

        assert_ne!(a, b);
        assert_eq!(drifter.depth(), 0);
        assert_eq!(drifter.tail_used(), 0);
    }

    #[test]
    fn test_alias_rewinds() {
        let mut drifter = Drifter::new(heap());
        drifter.allocate(8, 8).unwrap();
        let used = drifter.tail_used();
        let a = drifter.alias(256, 16).unwrap();
        assert_eq!(drifter.tail_used(), used);
        let b = drifter.allocate(256, 16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scope_pops_on_panic() {
        let mut drifter = Drifter::new(heap());
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            drifter.scope(|d| {
                d.allocate(BLOCK_SIZE, 1).unwrap();
                d.allocate(BLOCK_SIZE, 1).unwrap();
                panic!("inside scope");
            })
        }));
        assert!(result.is_err());
        assert_eq!(drifter.depth(), 0);
        assert_eq!(drifter.page_count(), 1);
    }

    #[test]
    fn test_reset_keeps_first_page() {
        let heap = heap();
        let mut drifter = Drifter::new(heap.clone());
        drifter.push();
        drifter.allocate(BLOCK_SIZE, 1).unwrap();
        drifter.allocate(BLOCK_SIZE, 1).unwrap();
        drifter.reset();
        assert_eq!(drifter.page_count(), 1);
        assert_eq!(drifter.depth(), 0);
        assert_eq!(drifter.tail_used(), 0);

        let free = heap.free_blocks_total();
        drop(drifter);
        assert_eq!(heap.free_blocks_total(), free + 1);
    }
}
