//! # Memory Primitives
//!
//! Block geometry shared by the tagged heap and the drifter, and [`Region`],
//! the bump-allocated page both of them hand out.
//!
//! Every page is a whole number of [`BLOCK_SIZE`] blocks carved from the
//! single address-space reservation owned by the tagged heap. A region
//! remembers its byte offset inside that reservation so the blocks can be
//! given back to the bitmap when the page is released.

use std::fmt;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Allocation granularity of the block bitmap (2 MiB).
pub const BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Number of blocks needed to hold `bytes`.
#[inline]
pub const fn blocks_for(bytes: usize) -> usize {
    (bytes + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// Reject zero sizes and non-power-of-two alignments.
pub fn check_layout(size: usize, align: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidParameters("allocation size must be nonzero"));
    }
    if align == 0 || !align.is_power_of_two() {
        return Err(Error::InvalidParameters("alignment must be a power of two"));
    }
    if size.checked_add(align - 1).is_none() {
        return Err(Error::InvalidParameters("allocation size overflows"));
    }
    Ok(())
}

/// Bytes of block-aligned page needed to satisfy `size` at `align`.
///
/// Never less than one block, so small requests share a page.
pub fn page_size_for(size: usize, align: usize) -> usize {
    let worst_case = size.saturating_add(align.saturating_sub(1));
    align_up(worst_case.max(1), BLOCK_SIZE).max(BLOCK_SIZE)
}

/// A block-aligned page used as a bump arena.
///
/// Invariant: `used <= alloc`.
pub struct Region {
    /// Byte offset of the page inside the reservation.
    offset: usize,
    /// First byte of the page.
    base: NonNull<u8>,
    /// Bump cursor.
    used: usize,
    /// Page capacity in bytes.
    alloc: usize,
}

// SAFETY: a Region is a view of memory owned by the reservation, which
// outlives every page handed out from it.
unsafe impl Send for Region {}

impl Region {
    /// Wrap `alloc` bytes at `base`, located `offset` bytes into the reservation.
    ///
    /// # Safety
    ///
    /// `base .. base + alloc` must be committed, writable and not aliased by
    /// another live region.
    pub unsafe fn from_raw(offset: usize, base: NonNull<u8>, alloc: usize) -> Self {
        Self {
            offset,
            base,
            used: 0,
            alloc,
        }
    }

    /// Byte offset of this page inside the reservation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current bump offset.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Page capacity.
    pub fn capacity(&self) -> usize {
        self.alloc
    }

    /// Bytes left after the bump cursor.
    pub fn remaining(&self) -> usize {
        self.alloc - self.used
    }

    /// Number of bitmap blocks covered by the page.
    pub fn blocks(&self) -> usize {
        self.alloc / BLOCK_SIZE
    }

    /// Whether `ptr` falls inside the page.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.alloc
    }

    /// Bump-allocate `size` bytes aligned to `align`.
    ///
    /// Alignment is applied to the absolute address. Returns `None` when the
    /// page cannot fit the request.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let start = self.base.as_ptr() as usize;
        let aligned = align_up(start + self.used, align) - start;
        let end = aligned.checked_add(size)?;
        if end > self.alloc {
            return None;
        }
        self.used = end;
        // SAFETY: `aligned < alloc`, so the pointer stays in the page.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(aligned)) })
    }

    /// Move the bump cursor back to `used`.
    pub fn rewind(&mut self, used: usize) {
        debug_assert!(used <= self.alloc);
        self.used = used.min(self.alloc);
    }

    /// Reset the region, freeing all allocations.
    pub fn reset(&mut self) {
        self.used = 0;
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("offset", &self.offset)
            .field("used", &self.used)
            .field("capacity", &self.alloc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_over(buf: &mut [u8]) -> Region {
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe { Region::from_raw(0, base, buf.len()) }
    }

    #[test]
    fn test_region_allocation() {
        let mut buf = vec![0u8; 1024];
        let mut region = region_over(&mut buf);
        assert_eq!(region.used(), 0);

        let ptr1 = region.allocate(100, 8).unwrap();
        assert_eq!(ptr1.as_ptr() as usize % 8, 0);
        assert!(region.used() >= 100);

        let ptr2 = region.allocate(200, 64).unwrap();
        assert_eq!(ptr2.as_ptr() as usize % 64, 0);
        assert!(region.contains(ptr2.as_ptr()));
        assert!(region.used() >= 300);
    }

    #[test]
    fn test_region_exhaustion() {
        let mut buf = vec![0u8; 256];
        let mut region = region_over(&mut buf);
        assert!(region.allocate(200, 1).is_some());
        assert!(region.allocate(100, 1).is_none());
        assert!(region.used() <= region.capacity());
    }

    #[test]
    fn test_region_reset_and_rewind() {
        let mut buf = vec![0u8; 1024];
        let mut region = region_over(&mut buf);
        region.allocate(100, 1).unwrap();
        let mark = region.used();
        region.allocate(500, 1).unwrap();

        region.rewind(mark);
        assert_eq!(region.used(), mark);

        region.reset();
        assert_eq!(region.used(), 0);
        assert_eq!(region.remaining(), 1024);
    }

    #[test]
    fn test_page_size_rounds_to_blocks() {
        assert_eq!(page_size_for(1, 8), BLOCK_SIZE);
        assert_eq!(page_size_for(BLOCK_SIZE, 1), BLOCK_SIZE);
        assert_eq!(page_size_for(BLOCK_SIZE, 16), 2 * BLOCK_SIZE);
        assert_eq!(page_size_for(3 * 1024 * 1024, 16), 2 * BLOCK_SIZE);
        assert_eq!(blocks_for(page_size_for(5 * BLOCK_SIZE, 8)), 6);
    }

    #[test]
    fn test_check_layout() {
        assert!(check_layout(16, 8).is_ok());
        assert!(check_layout(0, 8).is_err());
        assert!(check_layout(16, 3).is_err());
        assert!(check_layout(16, 0).is_err());
        assert!(check_layout(usize::MAX, 2).is_err());
    }
}
