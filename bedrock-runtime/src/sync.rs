//! # Spinlocks
//!
//! Busy-wait locks for short critical sections that must never park the OS
//! thread (a parked worker would stall every fiber multiplexed onto it).
//!
//! ## Primitives
//!
//! - [`SpinLock`] - raw test-and-set flag: `try_acquire` / `acquire` / `release`
//! - [`SpinMutex`] - data-owning wrapper handing out an RAII guard
//!
//! Neither lock is recursive and neither has a timeout: acquiring a lock the
//! current thread already holds spins forever.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

// ============================================================================
// SpinLock
// ============================================================================

/// A non-recursive spinlock built on an atomic test-and-set flag.
pub struct SpinLock {
    flag: AtomicBool,
}

impl SpinLock {
    /// Create an unlocked spinlock.
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Try to take the lock once. Acquire ordering on success.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        !self.flag.swap(true, Ordering::Acquire)
    }

    /// Spin until the lock is taken.
    pub fn acquire(&self) {
        let backoff = Backoff::new();
        while !self.try_acquire() {
            // Wait on a plain load so contenders don't bounce the line.
            while self.flag.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    /// Clear the flag with release ordering.
    #[inline]
    pub fn release(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

// ============================================================================
// SpinMutex
// ============================================================================

/// Data protected by a [`SpinLock`].
pub struct SpinMutex<T> {
    /// Unique mutex ID for debugging.
    id: u64,
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    /// Create a new spin mutex in an unlocked state.
    pub fn new(value: T) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            lock: SpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Get the mutex ID for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Spin until the lock is held, returning a guard.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.acquire();
        SpinMutexGuard { mutex: self }
    }

    /// Take the lock if it is free.
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_acquire() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Returns whether the mutex is currently locked.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Mutable access without locking; the borrow proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consume the mutex, returning the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f
                .debug_struct("SpinMutex")
                .field("id", &self.id)
                .field("data", &&*guard)
                .finish(),
            None => f
                .debug_struct("SpinMutex")
                .field("id", &self.id)
                .field("data", &"<locked>")
                .finish(),
        }
    }
}

// SAFETY: access to `data` is serialized by `lock`.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard releasing a [`SpinMutex`] on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}

impl<T: fmt::Debug> fmt::Debug for SpinMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

// ============================================================================
// Tests
// ============================================================================
