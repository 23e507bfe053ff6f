//! # Tagged Heap Allocator
//!
//! The only component that talks to the OS about memory. At start-up it
//! reserves the whole memory budget as address space and commits a first
//! step of blocks; from then on memory is handed out in whole
//! [`BLOCK_SIZE`] blocks tracked by a [`BlockBitmap`].
//!
//! ## Heaps
//!
//! ```text
//!   tag 0      roots heap, owns block 0, never freed
//!   tag != 0   slots in a fixed live-heap table, claimed on first thalloc
//!              and released as a unit by thfree
//! ```
//!
//! Each heap is a list of block-aligned [`Region`] pages behind its own
//! spinlock. Allocation bumps the tail page and falls back to a fresh page
//! from [`TaggedHeapAllocator::acquire_blocks`].
//!
//! ## Committed ceiling
//!
//! Blocks below `committed_blocks` are backed by the OS; blocks at or above
//! it are free in the bitmap and inaccessible. Single-block requests take a
//! lock-free first-fit pass below the ceiling. Everything that moves the
//! ceiling (growth, [`TaggedHeapAllocator::thadvise`]) holds the
//! [`GrowthSync`] slot.

use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;
use tracing::{debug, error, trace};

use crate::bitmap::{BlockBitmap, GrowthSync};
use crate::config::MemoryConfig;
use crate::defer::Defer;
use crate::error::{Error, Result};
use crate::memory::{align_up, blocks_for, check_layout, page_size_for, Region, BLOCK_SIZE};
use crate::sync::{SpinLock, SpinMutex};
use crate::vm::Reservation;

/// Tag of the permanent roots heap.
pub const ROOTS_TAG: u64 = 0;

/// Blocks committed per growth step.
const COMMIT_STEP_BLOCKS: usize = 4;

/// First tag handed out by [`TaggedHeapAllocator::frame_tag`].
const FRAME_TAG_BASE: u64 = 1 << 48;

/// How [`TaggedHeapAllocator::thadvise`] treats the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdviseMode {
    /// Commit exactly the requested bytes past the ceiling.
    Commit,
    /// Commit, halving the request until it fits (down to one block).
    CommitSuboptimal,
    /// Return exactly the requested bytes at the top of the committed range.
    Release,
    /// Release, halving the request until the tail is free (down to one block).
    ReleaseSuboptimal,
}

impl AdviseMode {
    fn is_release(self) -> bool {
        matches!(self, AdviseMode::Release | AdviseMode::ReleaseSuboptimal)
    }

    fn allows_suboptimal(self) -> bool {
        matches!(self, AdviseMode::CommitSuboptimal | AdviseMode::ReleaseSuboptimal)
    }
}

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    /// Bytes of reserved address space usable for blocks.
    pub reserved_bytes: usize,
    /// Bytes currently committed.
    pub committed_bytes: usize,
    /// Free blocks below the committed ceiling.
    pub free_blocks: usize,
    /// Tagged heaps currently holding a slot (roots excluded).
    pub live_heaps: usize,
}

struct HeapSlot {
    tag: AtomicU64,
    pages: SpinMutex<Vec<Region>>,
}

/// Block allocator over one address-space reservation.
pub struct TaggedHeapAllocator {
    reservation: Reservation,
    /// Offset of block 0 inside the reservation (block-aligned absolute).
    origin: usize,
    total_blocks: usize,
    committed_blocks: AtomicUsize,
    bitmap: BlockBitmap,
    sync: GrowthSync,
    roots: SpinMutex<Vec<Region>>,
    heaps: Box<[HeapSlot]>,
    table_lock: SpinLock,
    frames_in_flight: u64,
}

impl TaggedHeapAllocator {
    /// Reserve the budget in `config` and set up the roots heap.
    pub fn new(config: &MemoryConfig) -> Result<Self> {
        let total_blocks = config.memory_budget / BLOCK_SIZE;
        if total_blocks < 2 {
            return Err(Error::InvalidParameters("memory budget below two blocks"));
        }
        if config.tagged_heap_count == 0 {
            return Err(Error::InvalidParameters("tagged heap table must have a slot"));
        }

        let huge_pages = cfg!(target_os = "linux") && config.huge_page_ceiling >= BLOCK_SIZE;
        // One spare block lets us align block 0 to the block size.
        let reservation = Reservation::reserve((total_blocks + 1) * BLOCK_SIZE, huge_pages)?;
        let base = reservation.base().as_ptr() as usize;
        let origin = align_up(base, BLOCK_SIZE) - base;

        let heaps = (0..config.tagged_heap_count)
            .map(|_| HeapSlot {
                tag: AtomicU64::new(0),
                pages: SpinMutex::new(Vec::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let allocator = Self {
            reservation,
            origin,
            total_blocks,
            committed_blocks: AtomicUsize::new(0),
            bitmap: BlockBitmap::new(total_blocks),
            sync: GrowthSync::new(),
            roots: SpinMutex::new(Vec::new()),
            heaps,
            table_lock: SpinLock::new(),
            frames_in_flight: config.frames_in_flight.max(1) as u64,
        };

        let initial = COMMIT_STEP_BLOCKS.min(total_blocks);
        allocator.reservation.commit(origin, initial * BLOCK_SIZE)?;
        allocator.committed_blocks.store(initial, Ordering::Release);

        // Block 0 belongs to the roots heap, so offset 0 is never a user allocation.
        allocator.bitmap.acquire(0, 1);
        let roots_page = allocator.region_at(0, BLOCK_SIZE)?;
        allocator.roots.lock().push(roots_page);

        debug!(
            budget = total_blocks * BLOCK_SIZE,
            committed = initial * BLOCK_SIZE,
            huge_pages,
            heap_slots = config.tagged_heap_count,
            "tagged heap ready"
        );
        Ok(allocator)
    }

    // ------------------------------------------------------------------
    // Tagged heaps
    // ------------------------------------------------------------------

    /// Allocate `size` bytes aligned to `align` in the heap named `tag`.
    ///
    /// Tag 0 allocates from the permanent roots heap. Any other tag claims a
    /// live-heap slot on first use.
    pub fn thalloc(&self, tag: u64, size: usize, align: usize) -> Result<NonNull<u8>> {
        let result = check_layout(size, align).and_then(|()| {
            if tag == ROOTS_TAG {
                self.bump(&mut self.roots.lock(), size, align)
            } else {
                self.bump_tagged(tag, size, align)
            }
        });

        if let Err(e) = &result {
            error!(tag, size, align, error = %e, "thalloc failed");
        }
        result
    }

    /// Release every page of heap `tag` and free its slot.
    ///
    /// Freeing a tag with no live heap is a no-op. Tag 0 is rejected.
    pub fn thfree(&self, tag: u64) -> Result<()> {
        if tag == ROOTS_TAG {
            error!("attempt to free the roots heap");
            return Err(Error::InvalidParameters("the roots heap cannot be freed"));
        }

        let Some(slot) = self.find_heap(tag) else {
            trace!(tag, "thfree on a tag with no live heap");
            return Ok(());
        };

        let pages = {
            let mut pages = slot.pages.lock();
            // Freed by a racing thfree, and possibly reclaimed since.
            if slot.tag.load(Ordering::Acquire) != tag {
                return Ok(());
            }
            let pages = mem::take(&mut *pages);
            slot.tag.store(0, Ordering::Release);
            pages
        };

        let released: usize = pages.iter().map(Region::blocks).sum();
        for page in pages {
            self.release_page(page);
        }
        trace!(tag, blocks = released, "tagged heap freed");
        Ok(())
    }

    /// Whether `tag` currently owns a live-heap slot. Always true for tag 0.
    pub fn is_live(&self, tag: u64) -> bool {
        tag == ROOTS_TAG || self.find_heap(tag).is_some()
    }

    /// Tag reserved for per-frame scratch of `frame`, cycling through
    /// `frames_in_flight` distinct tags.
    pub fn frame_tag(&self, frame: u64) -> u64 {
        FRAME_TAG_BASE + frame % self.frames_in_flight
    }

    fn find_heap(&self, tag: u64) -> Option<&HeapSlot> {
        self.heaps
            .iter()
            .find(|slot| slot.tag.load(Ordering::Acquire) == tag)
    }

    fn find_or_claim(&self, tag: u64) -> Result<&HeapSlot> {
        if let Some(slot) = self.find_heap(tag) {
            return Ok(slot);
        }

        self.table_lock.acquire();
        let _unlock = Defer::new(|| self.table_lock.release());

        // Another thread may have claimed it while we waited.
        if let Some(slot) = self.find_heap(tag) {
            return Ok(slot);
        }
        for slot in self.heaps.iter() {
            if slot
                .tag
                .compare_exchange(0, tag, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!(tag, "tagged heap created");
                return Ok(slot);
            }
        }
        Err(Error::TooManyHeaps {
            limit: self.heaps.len(),
        })
    }

    fn bump_tagged(&self, tag: u64, size: usize, align: usize) -> Result<NonNull<u8>> {
        loop {
            let slot = self.find_or_claim(tag)?;
            let mut pages = slot.pages.lock();
            // thfree clears the tag under this lock.
            if slot.tag.load(Ordering::Acquire) == tag {
                return self.bump(&mut pages, size, align);
            }
        }
    }

    fn bump(&self, pages: &mut Vec<Region>, size: usize, align: usize) -> Result<NonNull<u8>> {
        if let Some(ptr) = pages.last_mut().and_then(|tail| tail.allocate(size, align)) {
            return Ok(ptr);
        }

        let mut page = self.allocate_page(size, align)?;
        let ptr = page
            .allocate(size, align)
            .ok_or(Error::InvalidParameters("request does not fit a fresh page"))?;
        pages.push(page);
        Ok(ptr)
    }

    // ------------------------------------------------------------------
    // Pages and blocks
    // ------------------------------------------------------------------

    /// Acquire a fresh block-aligned page able to hold `size` bytes at `align`.
    pub fn allocate_page(&self, size: usize, align: usize) -> Result<Region> {
        check_layout(size, align)?;
        let bytes = page_size_for(size, align);
        let offset = self.acquire_blocks(bytes)?;
        match self.region_at(offset, bytes) {
            Ok(region) => Ok(region),
            Err(e) => {
                self.release_blocks(offset, bytes);
                Err(e)
            }
        }
    }

    /// Give a page's blocks back to the bitmap.
    pub fn release_page(&self, page: Region) {
        self.release_blocks(page.offset(), page.capacity());
    }

    /// Claim enough blocks for `bytes`, returning the byte offset of the
    /// first one.
    pub fn acquire_blocks(&self, bytes: usize) -> Result<usize> {
        let count = blocks_for(bytes).max(1);
        if count > self.total_blocks {
            error!(bytes, "request exceeds the memory budget");
            return Err(Error::OutOfHostMemory { requested: bytes });
        }

        if count == 1 {
            if let Some(block) = self.claim_single_block() {
                return Ok(block * BLOCK_SIZE);
            }
        }

        self.sync.acquire(count);
        let _release = Defer::new(|| self.sync.release());

        let ceiling = self.committed_blocks.load(Ordering::Acquire);
        if let Some(block) = self.bitmap.find_free_blocks_range(1, count, ceiling, &self.sync) {
            return Ok(block * BLOCK_SIZE);
        }

        let block = self.grow_and_claim(count).map_err(|e| {
            error!(bytes, error = %e, "could not grow committed memory");
            e
        })?;
        Ok(block * BLOCK_SIZE)
    }

    /// Return the blocks covering `[offset, offset + bytes)` to the bitmap.
    pub fn release_blocks(&self, offset: usize, bytes: usize) {
        let first = offset / BLOCK_SIZE;
        self.bitmap.release(first, blocks_for(bytes));
        self.sync.lower_frontier(first);
    }

    /// Lock-free first fit below the ceiling.
    fn claim_single_block(&self) -> Option<usize> {
        loop {
            let ceiling = self.committed_blocks.load(Ordering::Acquire);
            let block = self.bitmap.find_free_block(1, ceiling)?;
            if block < self.committed_blocks.load(Ordering::Acquire) {
                return Some(block);
            }
            // The ceiling dropped under us; this block is no longer committed.
            self.bitmap.release(block, 1);
        }
    }

    /// Extend the committed range and claim `count` blocks at the old ceiling.
    ///
    /// Caller holds the growth slot.
    fn grow_and_claim(&self, count: usize) -> Result<usize> {
        let ceiling = self.committed_blocks.load(Ordering::Acquire);
        let available = self.total_blocks - ceiling;
        if count > available {
            return Err(Error::OutOfHostMemory {
                requested: count * BLOCK_SIZE,
            });
        }
        let step = count.max(COMMIT_STEP_BLOCKS).min(available);

        // Blocks above the ceiling are free; a fast-path claimer may hold one
        // for a moment before it notices the ceiling moved.
        let backoff = Backoff::new();
        while !self.bitmap.try_claim_range(ceiling, count) {
            backoff.snooze();
        }

        if let Err(e) = self
            .reservation
            .commit(self.origin + ceiling * BLOCK_SIZE, step * BLOCK_SIZE)
        {
            self.bitmap.release(ceiling, count);
            return Err(e);
        }
        self.committed_blocks.store(ceiling + step, Ordering::Release);
        debug!(
            from = ceiling * BLOCK_SIZE,
            to = (ceiling + step) * BLOCK_SIZE,
            "committed memory grown"
        );
        Ok(ceiling)
    }

    fn region_at(&self, offset: usize, bytes: usize) -> Result<Region> {
        let base = self
            .reservation
            .at(self.origin + offset)
            .ok_or(Error::InvalidParameters("offset outside reservation"))?;
        // SAFETY: the blocks were claimed from the bitmap by the caller and
        // lie below the committed ceiling.
        Ok(unsafe { Region::from_raw(offset, base, bytes) })
    }

    // ------------------------------------------------------------------
    // Explicit advice
    // ------------------------------------------------------------------

    /// Commit or release OS memory at the top of the committed range.
    ///
    /// Returns the number of bytes actually committed or released. Release
    /// only proceeds when every block in the tail range is free; the
    /// suboptimal modes halve the request until it succeeds or reaches a
    /// single block.
    pub fn thadvise(&self, request: usize, mode: AdviseMode) -> Result<usize> {
        let mut count = blocks_for(request);
        if count == 0 {
            return Err(Error::InvalidParameters("advice request must be nonzero"));
        }

        self.sync.acquire(count);
        let _release = Defer::new(|| self.sync.release());

        loop {
            let attempt = if mode.is_release() {
                self.release_tail(count)
            } else {
                self.commit_tail(count)
            };

            match attempt {
                Ok(()) => return Ok(count * BLOCK_SIZE),
                Err(e) if mode.allows_suboptimal() && count > 1 => {
                    trace!(blocks = count, error = %e, "halving advice request");
                    count /= 2;
                }
                Err(e) => {
                    error!(request, ?mode, error = %e, "thadvise failed");
                    return Err(e);
                }
            }
        }
    }

    fn commit_tail(&self, count: usize) -> Result<()> {
        let ceiling = self.committed_blocks.load(Ordering::Acquire);
        if count > self.total_blocks - ceiling {
            return Err(Error::OutOfHostMemory {
                requested: count * BLOCK_SIZE,
            });
        }
        self.reservation
            .commit(self.origin + ceiling * BLOCK_SIZE, count * BLOCK_SIZE)?;
        self.committed_blocks.store(ceiling + count, Ordering::Release);
        Ok(())
    }

    fn release_tail(&self, count: usize) -> Result<()> {
        let ceiling = self.committed_blocks.load(Ordering::Acquire);
        // Block 0 always stays committed.
        if count >= ceiling {
            return Err(Error::InvalidParameters("release would uncommit the roots block"));
        }
        let start = ceiling - count;
        if self.bitmap.count_free_range(start, count) != count {
            return Err(Error::InvalidParameters("tail range is in use"));
        }
        if !self.bitmap.try_claim_range(start, count) {
            return Err(Error::InvalidParameters("tail range is in use"));
        }

        self.committed_blocks.store(start, Ordering::Release);
        let result = self
            .reservation
            .decommit(self.origin + start * BLOCK_SIZE, count * BLOCK_SIZE);
        self.bitmap.release(start, count);
        result
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of blocks in the budget.
    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Blocks currently backed by the OS.
    pub fn committed_blocks(&self) -> usize {
        self.committed_blocks.load(Ordering::Acquire)
    }

    /// Free blocks below the committed ceiling.
    pub fn free_blocks(&self) -> usize {
        self.bitmap.count_free_range(0, self.committed_blocks())
    }

    /// Free blocks across the whole budget.
    pub fn free_blocks_total(&self) -> usize {
        self.bitmap.count_free()
    }

    /// Whether `block` is free in the bitmap.
    pub fn is_block_free(&self, block: usize) -> bool {
        self.bitmap.is_free(block)
    }

    /// Snapshot of allocator state.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            reserved_bytes: self.total_blocks * BLOCK_SIZE,
            committed_bytes: self.committed_blocks() * BLOCK_SIZE,
            free_blocks: self.free_blocks(),
            live_heaps: self
                .heaps
                .iter()
                .filter(|slot| slot.tag.load(Ordering::Acquire) != 0)
                .count(),
        }
    }
}

impl fmt::Debug for TaggedHeapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedHeapAllocator")
            .field("stats", &self.stats())
            .finish()
    }
}
