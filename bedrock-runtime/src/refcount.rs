//! Intrusive reference counting.
//!
//! A type embeds a [`RefCount`] and implements [`RefCounted`]; the decrement
//! that takes the count from one to zero calls [`RefCounted::on_zero`]
//! synchronously on the decrementing thread. A destructor that needs the
//! scheduler must submit its own job from there.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::atomic::{AtomicOps, MemoryModel};
use crate::error::{Error, Result};

/// Atomic signed reference count.
pub struct RefCount(AtomicI32);

impl RefCount {
    /// Count starting at `initial` references.
    pub const fn new(initial: i32) -> Self {
        Self(AtomicI32::new(initial))
    }

    /// Current count.
    pub fn get(&self) -> i32 {
        self.0.read_explicit(MemoryModel::Acquire)
    }

    /// Add a reference, returning the previous count.
    pub fn inc_ref(&self) -> i32 {
        self.0.fetch_add_explicit(1, MemoryModel::Release)
    }

    /// Drop a reference, returning the previous count.
    ///
    /// A previous count of one or less means the caller released the last
    /// reference.
    pub fn dec_ref(&self) -> i32 {
        self.0.fetch_sub_explicit(1, MemoryModel::Release)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefCount").field(&self.get()).finish()
    }
}

/// An object carrying its own reference count and zero-count destructor.
pub trait RefCounted {
    /// The embedded count.
    fn ref_count(&self) -> &RefCount;

    /// Called once the last reference is released.
    fn on_zero(&self);
}

/// Add a reference to `obj`, returning the previous count.
pub fn inc_ref<T: RefCounted + ?Sized>(obj: &T) -> i32 {
    obj.ref_count().inc_ref()
}

/// Release a reference to `obj`, running [`RefCounted::on_zero`] if it was
/// the last one. Returns the previous count.
pub fn dec_ref<T: RefCounted + ?Sized>(obj: &T) -> i32 {
    let previous = obj.ref_count().dec_ref();
    if previous <= 1 {
        // Pairs with the release decrements of the other owners.
        std::sync::atomic::fence(Ordering::Acquire);
        obj.on_zero();
    }
    previous
}

/// Check that `obj` holds no references other than the caller's.
pub fn ensure_released<T: RefCounted + ?Sized>(obj: &T) -> Result<()> {
    match obj.ref_count().get() {
        refs if refs > 1 => Err(Error::StillReferenced { refs }),
        _ => Ok(()),
    }
}

/// A counted reference: cloning retains, dropping releases.
pub struct Retained<'a, T: RefCounted + ?Sized> {
    obj: &'a T,
}

impl<'a, T: RefCounted + ?Sized> Retained<'a, T> {
    /// Take a new reference to `obj`.
    pub fn retain(obj: &'a T) -> Self {
        inc_ref(obj);
        Self { obj }
    }

    /// Wrap a reference the caller already owns.
    pub fn adopt(obj: &'a T) -> Self {
        Self { obj }
    }
}

impl<T: RefCounted + ?Sized> Clone for Retained<'_, T> {
    fn clone(&self) -> Self {
        Self::retain(self.obj)
    }
}

impl<T: RefCounted + ?Sized> Deref for Retained<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.obj
    }
}

impl<T: RefCounted + ?Sized> Drop for Retained<'_, T> {
    fn drop(&mut self) {
        dec_ref(self.obj);
    }
}

impl<T: RefCounted + fmt::Debug + ?Sized> fmt::Debug for Retained<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Retained").field(&self.obj).finish()
    }
}
