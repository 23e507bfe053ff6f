//! Virtual memory reservation.
//!
//! The tagged heap reserves its whole budget up front as inaccessible address
//! space, then commits and decommits block ranges inside it. Only this module
//! talks to the OS memory-mapping calls.

use std::io;
use std::ptr::NonNull;

use tracing::{debug, error};

use crate::error::{Error, Result};

/// A contiguous span of reserved address space.
pub struct Reservation {
    base: NonNull<u8>,
    len: usize,
    huge_pages: bool,
}

// SAFETY: the reservation is a plain address range; callers coordinate
// access to its contents through the block bitmap.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve `len` bytes of address space without committing it.
    ///
    /// `huge_pages` asks the OS to back committed ranges with transparent
    /// huge pages where supported.
    pub fn reserve(len: usize, huge_pages: bool) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidParameters("reservation must be nonzero"));
        }
        let base = sys::reserve(len).map_err(|e| {
            error!(bytes = len, error = %e, "address space reservation failed");
            Error::map_failed("reserve", e)
        })?;
        debug!(bytes = len, base = ?base, huge_pages, "reserved address space");
        Ok(Self {
            base,
            len,
            huge_pages,
        })
    }

    /// First byte of the reservation.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Reserved bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the reservation is empty (never true for a live reservation).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer `offset` bytes into the reservation.
    pub fn at(&self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.len {
            return None;
        }
        // SAFETY: offset is inside the reserved span.
        NonNull::new(unsafe { self.base.as_ptr().add(offset) })
    }

    /// Make `[offset, offset + len)` readable and writable.
    pub fn commit(&self, offset: usize, len: usize) -> Result<()> {
        let ptr = self.range(offset, len)?;
        sys::commit(ptr, len, self.huge_pages).map_err(|e| {
            error!(offset, bytes = len, error = %e, "commit failed");
            Error::map_failed("commit", e)
        })
    }

    /// Return `[offset, offset + len)` to the OS and make it inaccessible.
    pub fn decommit(&self, offset: usize, len: usize) -> Result<()> {
        let ptr = self.range(offset, len)?;
        sys::decommit(ptr, len).map_err(|e| {
            error!(offset, bytes = len, error = %e, "decommit failed");
            Error::map_failed("decommit", e)
        })
    }

    fn range(&self, offset: usize, len: usize) -> Result<NonNull<u8>> {
        match offset.checked_add(len) {
            Some(end) if len > 0 && end <= self.len => self
                .at(offset)
                .ok_or(Error::InvalidParameters("range outside reservation")),
            _ => Err(Error::InvalidParameters("range outside reservation")),
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Err(e) = sys::release(self.base, self.len) {
            error!(bytes = self.len, error = %e, "failed to release reservation");
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("huge_pages", &self.huge_pages)
            .finish()
    }
}

/// Physical memory of the host, if it can be determined.
pub fn host_physical_memory() -> Option<usize> {
    sys::physical_memory()
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::ffi::c_void;
    use std::num::NonZeroUsize;

    use nix::sys::mman::{self, MapFlags, MmapAdvise, ProtFlags};

    fn to_void(ptr: NonNull<u8>) -> NonNull<c_void> {
        ptr.cast()
    }

    pub(super) fn reserve(len: usize) -> io::Result<NonNull<u8>> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero length"))?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = MapFlags::MAP_PRIVATE;

        // SAFETY: anonymous mapping at an OS-chosen address.
        let ptr = unsafe { mman::mmap_anonymous(None, length, ProtFlags::PROT_NONE, flags) }?;
        Ok(ptr.cast())
    }

    pub(super) fn commit(ptr: NonNull<u8>, len: usize, huge_pages: bool) -> io::Result<()> {
        // SAFETY: the range lies inside our own mapping.
        unsafe {
            mman::mprotect(
                to_void(ptr),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            )?;
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if huge_pages {
            // Advisory only; kernels without THP reject it.
            // SAFETY: same range as above.
            if let Err(e) = unsafe { mman::madvise(to_void(ptr), len, MmapAdvise::MADV_HUGEPAGE) } {
                tracing::trace!(error = %e, "huge page advice ignored");
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = huge_pages;

        Ok(())
    }

    pub(super) fn decommit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: the range lies inside our own mapping and holds no live data.
        unsafe {
            mman::madvise(to_void(ptr), len, MmapAdvise::MADV_DONTNEED)?;
            mman::mprotect(to_void(ptr), len, ProtFlags::PROT_NONE)?;
        }
        Ok(())
    }

    pub(super) fn release(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: unmapping the exact span returned by `reserve`.
        unsafe { mman::munmap(to_void(ptr), len) }?;
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(super) fn physical_memory() -> Option<usize> {
        use nix::unistd::{sysconf, SysconfVar};

        let pages = sysconf(SysconfVar::_PHYS_PAGES).ok()??;
        let page_size = sysconf(SysconfVar::PAGE_SIZE).ok()??;
        usize::try_from(pages)
            .ok()?
            .checked_mul(usize::try_from(page_size).ok()?)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(super) fn physical_memory() -> Option<usize> {
        None
    }
}

#[cfg(windows)]
mod sys {
    use super::*;
    use std::ffi::c_void;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_DECOMMIT: u32 = 0x0000_4000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const PAGE_NOACCESS: u32 = 0x01;
    const PAGE_READWRITE: u32 = 0x04;

    extern "system" {
        fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
    }

    pub(super) fn reserve(len: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: reserving fresh address space at an OS-chosen address.
        let ptr = unsafe { VirtualAlloc(std::ptr::null_mut(), len, MEM_RESERVE, PAGE_NOACCESS) };
        NonNull::new(ptr.cast()).ok_or_else(io::Error::last_os_error)
    }

    pub(super) fn commit(ptr: NonNull<u8>, len: usize, _huge_pages: bool) -> io::Result<()> {
        // SAFETY: the range lies inside our own reservation.
        let out = unsafe { VirtualAlloc(ptr.as_ptr().cast(), len, MEM_COMMIT, PAGE_READWRITE) };
        if out.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn decommit(ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // SAFETY: the range lies inside our own reservation.
        if unsafe { VirtualFree(ptr.as_ptr().cast(), len, MEM_DECOMMIT) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn release(ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        // SAFETY: releasing the base returned by `reserve`.
        if unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn physical_memory() -> Option<usize> {
        None
    }
}
