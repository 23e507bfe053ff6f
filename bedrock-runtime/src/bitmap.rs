//! # Block Bitmap
//!
//! One bit per [`BLOCK_SIZE`](crate::memory::BLOCK_SIZE) block of the
//! reservation; a set bit means the block is free. All updates are byte-wise
//! atomic AND/OR with edge masks, so a range update never disturbs blocks
//! outside the range.
//!
//! ## Search
//!
//! - [`BlockBitmap::find_free_block`]: first fit for a single block, lock-free.
//!   A lost race is detected from the value `fetch_and` returns and the scan
//!   moves on.
//! - [`BlockBitmap::find_free_blocks_range`]: first fit for a contiguous run.
//!   The leading run of used blocks it walks past is published to the
//!   [`GrowthSync`] frontier so later searches can start beyond it.
//!
//! [`GrowthSync`] also carries the single CAS slot that serializes growth of
//! the committed region.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

/// Index of the byte holding `block`'s bit.
#[inline]
pub const fn byte_index(block: usize) -> usize {
    block / 8
}

/// Mask selecting `block`'s bit inside its byte.
#[inline]
pub const fn bit_mask(block: usize) -> u8 {
    1 << (block % 8)
}

/// Mask with bits `lo..hi` set (`lo <= hi <= 8`).
#[inline]
pub const fn edge_mask(lo: usize, hi: usize) -> u8 {
    ((1u16 << hi) - (1u16 << lo)) as u8
}

/// Walks `[start, end)` one byte at a time, yielding `(byte, mask)`.
struct ByteSpans {
    next: usize,
    end: usize,
}

impl ByteSpans {
    fn new(start: usize, end: usize) -> Self {
        Self { next: start, end }
    }
}

impl Iterator for ByteSpans {
    type Item = (usize, u8);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let idx = byte_index(self.next);
        let lo = self.next % 8;
        let hi = (self.end - idx * 8).min(8);
        self.next = idx * 8 + hi;
        Some((idx, edge_mask(lo, hi)))
    }
}

/// Atomic free/used map over a fixed number of blocks.
pub struct BlockBitmap {
    bytes: Box<[AtomicU8]>,
    blocks: usize,
}

impl BlockBitmap {
    /// Bitmap over `blocks` blocks, all free.
    pub fn new(blocks: usize) -> Self {
        let bytes = (0..blocks.div_ceil(8))
            .map(|idx| {
                let hi = (blocks - idx * 8).min(8);
                AtomicU8::new(edge_mask(0, hi))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { bytes, blocks }
    }

    /// Number of tracked blocks.
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    fn clamp(&self, start: usize, count: usize) -> (usize, usize) {
        let end = start.saturating_add(count).min(self.blocks);
        (start.min(end), end)
    }

    /// Whether `block` is free.
    pub fn is_free(&self, block: usize) -> bool {
        block < self.blocks
            && self.bytes[byte_index(block)].load(Ordering::Acquire) & bit_mask(block) != 0
    }

    /// Mark `[start, start + count)` used, whatever its current state.
    pub fn acquire(&self, start: usize, count: usize) {
        let (start, end) = self.clamp(start, count);
        for (idx, mask) in ByteSpans::new(start, end) {
            self.bytes[idx].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Mark `[start, start + count)` free.
    pub fn release(&self, start: usize, count: usize) {
        let (start, end) = self.clamp(start, count);
        for (idx, mask) in ByteSpans::new(start, end) {
            self.bytes[idx].fetch_or(mask, Ordering::AcqRel);
        }
    }

    /// Claim `[start, start + count)` only if every block in it is free.
    ///
    /// On conflict the blocks this call took are handed back and `false` is
    /// returned; the range is claimed entirely or not at all.
    pub fn try_claim_range(&self, start: usize, count: usize) -> bool {
        if count == 0 || start.checked_add(count).map_or(true, |end| end > self.blocks) {
            return false;
        }
        let end = start + count;
        for (idx, mask) in ByteSpans::new(start, end) {
            let prev = self.bytes[idx].fetch_and(!mask, Ordering::AcqRel);
            if prev & mask != mask {
                self.bytes[idx].fetch_or(prev & mask, Ordering::AcqRel);
                let claimed_end = idx * 8;
                if claimed_end > start {
                    self.release(start, claimed_end - start);
                }
                return false;
            }
        }
        true
    }

    /// Free blocks in `[start, start + count)`.
    pub fn count_free_range(&self, start: usize, count: usize) -> usize {
        let (start, end) = self.clamp(start, count);
        ByteSpans::new(start, end)
            .map(|(idx, mask)| (self.bytes[idx].load(Ordering::Acquire) & mask).count_ones() as usize)
            .sum()
    }

    /// Free blocks in the whole bitmap.
    pub fn count_free(&self) -> usize {
        self.count_free_range(0, self.blocks)
    }

    /// Claim the first free block in `[offset, ceiling)`.
    pub fn find_free_block(&self, offset: usize, ceiling: usize) -> Option<usize> {
        let ceiling = ceiling.min(self.blocks);
        let mut block = offset;
        while block < ceiling {
            let idx = byte_index(block);
            let window = edge_mask(block % 8, (ceiling - idx * 8).min(8));
            let free = self.bytes[idx].load(Ordering::Acquire) & window;
            if free == 0 {
                block = (idx + 1) * 8;
                continue;
            }

            let candidate = idx * 8 + free.trailing_zeros() as usize;
            let mask = bit_mask(candidate);
            let prev = self.bytes[idx].fetch_and(!mask, Ordering::AcqRel);
            if prev & mask != 0 {
                return Some(candidate);
            }
            // Someone else got it first.
            block = candidate + 1;
        }
        None
    }

    /// Claim the first run of `count` free blocks in `[offset, ceiling)`.
    ///
    /// Starts at the frontier published in `sync` when it lies past
    /// `offset`, falling back to a full scan from `offset`.
    pub fn find_free_blocks_range(
        &self,
        offset: usize,
        count: usize,
        ceiling: usize,
        sync: &GrowthSync,
    ) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let ceiling = ceiling.min(self.blocks);
        let hinted = sync.frontier().max(offset);
        if hinted > offset {
            if let Some(found) = self.scan_run(hinted, count, ceiling, sync) {
                return Some(found);
            }
        }
        self.scan_run(offset, count, ceiling, sync)
    }

    fn scan_run(&self, from: usize, count: usize, ceiling: usize, sync: &GrowthSync) -> Option<usize> {
        let mut run_start = from;
        let mut block = from;
        let mut leading_used = true;

        while block < ceiling && ceiling - run_start >= count {
            if block % 8 == 0 && self.bytes[byte_index(block)].load(Ordering::Acquire) == 0 {
                block += 8;
                run_start = block;
                if leading_used {
                    sync.record_frontier(block.min(ceiling));
                }
                continue;
            }

            if !self.is_free(block) {
                block += 1;
                run_start = block;
                if leading_used {
                    sync.record_frontier(block);
                }
                continue;
            }

            leading_used = false;
            if block + 1 - run_start == count {
                if self.try_claim_range(run_start, count) {
                    return Some(run_start);
                }
                run_start += 1;
                block = run_start;
                continue;
            }
            block += 1;
        }
        None
    }
}

impl fmt::Debug for BlockBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBitmap")
            .field("blocks", &self.blocks)
            .field("free", &self.count_free())
            .finish()
    }
}

// ============================================================================
// Growth sync
// ============================================================================

/// Single-slot cooperative lock for growing the committed region, plus the
/// scan frontier hint shared by multi-block searches.
#[derive(Debug, Default)]
pub struct GrowthSync {
    owner: AtomicUsize,
    frontier: AtomicUsize,
}

impl GrowthSync {
    /// Create an unowned slot with the frontier at block 0.
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
            frontier: AtomicUsize::new(0),
        }
    }

    /// CAS the slot from 0 to `candidate` (which must be nonzero).
    pub fn try_acquire(&self, candidate: usize) -> bool {
        debug_assert!(candidate != 0);
        self.owner
            .compare_exchange(0, candidate, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Spin until the slot is ours.
    pub fn acquire(&self, candidate: usize) {
        let backoff = Backoff::new();
        while !self.try_acquire(candidate) {
            backoff.snooze();
        }
    }

    /// Give the slot back.
    pub fn release(&self) {
        self.owner.store(0, Ordering::Release);
    }

    /// Current owner's candidate, or 0.
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    /// First block not known to be inside a leading used run.
    pub fn frontier(&self) -> usize {
        self.frontier.load(Ordering::Acquire)
    }

    /// Advance the frontier to `block` if it is further along.
    pub fn record_frontier(&self, block: usize) {
        self.frontier.fetch_max(block, Ordering::AcqRel);
    }

    /// Pull the frontier back to `block` after blocks there were freed.
    pub fn lower_frontier(&self, block: usize) {
        self.frontier.fetch_min(block, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_index_helpers() {
        assert_eq!(byte_index(0), 0);
        assert_eq!(byte_index(15), 1);
        assert_eq!(bit_mask(9), 0b0000_0010);
        assert_eq!(edge_mask(0, 8), 0xFF);
        assert_eq!(edge_mask(2, 5), 0b0001_1100);
        assert_eq!(edge_mask(3, 3), 0);
    }

    #[test]
    fn test_new_marks_tail_bits_used() {
        let bitmap = BlockBitmap::new(11);
        assert_eq!(bitmap.count_free(), 11);
        assert!(bitmap.is_free(10));
        assert!(!bitmap.is_free(11));
    }

    #[test]
    fn test_acquire_release_leave_neighbors_alone() {
        let bitmap = BlockBitmap::new(32);
        bitmap.acquire(5, 13);
        assert_eq!(bitmap.count_free(), 32 - 13);
        assert!(bitmap.is_free(4));
        assert!(!bitmap.is_free(5));
        assert!(!bitmap.is_free(17));
        assert!(bitmap.is_free(18));

        bitmap.release(5, 13);
        assert_eq!(bitmap.count_free(), 32);
    }

    #[test]
    fn test_try_claim_rolls_back() {
        let bitmap = BlockBitmap::new(32);
        bitmap.acquire(20, 1);

        assert!(!bitmap.try_claim_range(4, 20));
        assert_eq!(bitmap.count_free(), 31);
        assert!(!bitmap.is_free(20));

        assert!(bitmap.try_claim_range(4, 16));
        assert_eq!(bitmap.count_free_range(4, 16), 0);
        assert!(!bitmap.try_claim_range(30, 4));
    }

    #[test]
    fn test_find_free_block_first_fit() {
        let bitmap = BlockBitmap::new(16);
        bitmap.acquire(0, 3);
        assert_eq!(bitmap.find_free_block(0, 16), Some(3));
        assert_eq!(bitmap.find_free_block(0, 16), Some(4));
        assert_eq!(bitmap.find_free_block(10, 12), Some(10));
        assert_eq!(bitmap.find_free_block(0, 5), None);
    }

    #[test]
    fn test_find_free_blocks_range_skips_fragments() {
        let bitmap = BlockBitmap::new(64);
        let sync = GrowthSync::new();
        bitmap.acquire(0, 10);
        bitmap.acquire(12, 1);

        assert_eq!(bitmap.find_free_blocks_range(0, 4, 64, &sync), Some(13));
        assert!(sync.frontier() >= 10);
        assert_eq!(bitmap.count_free_range(13, 4), 0);

        // The two-block hole below the frontier is still found.
        sync.record_frontier(40);
        assert_eq!(bitmap.find_free_blocks_range(0, 2, 64, &sync), Some(40));
        assert_eq!(bitmap.find_free_blocks_range(0, 2, 40, &sync), Some(10));
        assert_eq!(bitmap.find_free_blocks_range(0, 64, 64, &sync), None);
    }

    #[test]
    fn test_growth_sync_exclusive() {
        let sync = GrowthSync::new();
        assert!(sync.try_acquire(3));
        assert_eq!(sync.owner(), 3);
        assert!(!sync.try_acquire(5));
        sync.release();
        assert!(sync.try_acquire(5));

        sync.record_frontier(9);
        sync.record_frontier(4);
        assert_eq!(sync.frontier(), 9);
        sync.lower_frontier(2);
        assert_eq!(sync.frontier(), 2);
    }

    #[test]
    fn test_concurrent_single_block_claims_are_unique() {
        let bitmap = Arc::new(BlockBitmap::new(256));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bitmap = bitmap.clone();
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(b) = bitmap.find_free_block(0, 256) {
                        mine.push(b);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for b in h.join().unwrap() {
                assert!(seen.insert(b), "block {b} claimed twice");
            }
        }
        assert_eq!(seen.len(), 256);
        assert_eq!(bitmap.count_free(), 0);
    }
}
