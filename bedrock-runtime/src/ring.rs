//! # Bounded MPMC Ring
//!
//! Lock-free multi-producer/multi-consumer queue over a fixed power-of-two
//! array of cells. Each cell carries a sequence number that tells producers
//! and consumers whose turn it is:
//!
//! ```text
//!   seq == pos            cell is empty, producer for `pos` may write
//!   seq == pos + 1        cell is full, consumer for `pos` may read
//!   seq == pos + cap      cell was drained, producer one lap later may write
//! ```
//!
//! Neither operation blocks. A full ring hands the item back from
//! [`MpmcRing::enqueue`] and an empty ring returns `None` from
//! [`MpmcRing::dequeue`]; the caller owns the retry policy. A thread that
//! retries a full enqueue while it is also the only consumer will spin
//! forever.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{Error, Result};

struct Cell<T> {
    sequence: AtomicUsize,
    data: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity lock-free MPMC queue.
pub struct MpmcRing<T> {
    buffer: CachePadded<Box<[Cell<T>]>>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: a cell's payload is touched only by the single thread that won the
// position for it, and ownership hand-off is published by `sequence`.
unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Create a ring with exactly `capacity` cells.
    ///
    /// `capacity` must be a power of two and at least 2.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(Error::InvalidParameters(
                "ring capacity must be a power of two >= 2",
            ));
        }

        let buffer = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            buffer: CachePadded::new(buffer),
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Create a ring with `1 << log2` cells.
    pub fn with_log2_capacity(log2: u32) -> Result<Self> {
        if log2 == 0 || log2 >= usize::BITS {
            return Err(Error::InvalidParameters("ring log2 capacity out of range"));
        }
        Self::with_capacity(1usize << log2)
    }

    /// Number of cells.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Try to push `item`. Hands it back when the ring is full.
    pub fn enqueue(&self, item: T) -> std::result::Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        let cell = loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break cell,
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(item);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        };

        // SAFETY: winning the CAS on `pos` grants exclusive access to the cell.
        unsafe { (*cell.data.get()).write(item) };
        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Try to pop the oldest item.
    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        let cell = loop {
            let cell = &self.buffer[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos.wrapping_add(1) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break cell,
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        };

        // SAFETY: the producer published this cell with `pos + 1` and we won
        // the CAS for `pos`.
        let item = unsafe { (*cell.data.get()).assume_init_read() };
        cell.sequence
            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
        Some(item)
    }

    /// Approximate number of queued items.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    /// Whether the ring looked empty at the time of the call.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

impl<T> fmt::Debug for MpmcRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpmcRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(MpmcRing::<u32>::with_capacity(0).is_err());
        assert!(MpmcRing::<u32>::with_capacity(1).is_err());
        assert!(MpmcRing::<u32>::with_capacity(12).is_err());
        assert!(MpmcRing::<u32>::with_log2_capacity(0).is_err());
        assert_eq!(MpmcRing::<u32>::with_log2_capacity(4).unwrap().capacity(), 16);
    }

    #[test]
    fn test_fifo_single_thread() {
        let ring = MpmcRing::with_capacity(4).unwrap();
        assert!(ring.is_empty());
        for i in 0..4 {
            ring.enqueue(i).unwrap();
        }
        assert_eq!(ring.enqueue(99), Err(99));
        assert_eq!(ring.len(), 4);

        for i in 0..4 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn test_wraps_around() {
        let ring = MpmcRing::with_capacity(2).unwrap();
        for lap in 0..100 {
            ring.enqueue(lap).unwrap();
            ring.enqueue(lap + 1000).unwrap();
            assert_eq!(ring.dequeue(), Some(lap));
            assert_eq!(ring.dequeue(), Some(lap + 1000));
        }
    }

    #[test]
    fn test_drop_releases_items() {
        let token = Arc::new(());
        {
            let ring = MpmcRing::with_capacity(8).unwrap();
            for _ in 0..5 {
                ring.enqueue(token.clone()).unwrap();
            }
            assert_eq!(Arc::strong_count(&token), 6);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        const PER_PRODUCER: usize = 10_000;
        const PRODUCERS: usize = 4;

        let ring = Arc::new(MpmcRing::with_capacity(64).unwrap());
        let consumed = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = p * PER_PRODUCER + i;
                        while let Err(back) = ring.enqueue(item) {
                            item = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let ring = ring.clone();
                let consumed = consumed.clone();
                let sum = sum.clone();
                thread::spawn(move || {
                    while consumed.load(Ordering::Relaxed) < PRODUCERS * PER_PRODUCER {
                        match ring.dequeue() {
                            Some(v) => {
                                sum.fetch_add(v, Ordering::Relaxed);
                                consumed.fetch_add(1, Ordering::Relaxed);
                            }
                            None => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();

        for h in producers.into_iter().chain(consumers) {
            h.join().unwrap();
        }

        let n = PRODUCERS * PER_PRODUCER;
        assert_eq!(consumed.load(Ordering::Relaxed), n);
        assert_eq!(sum.load(Ordering::Relaxed), n * (n - 1) / 2);
    }
}
