//! Property-based tests for the Bedrock runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use bedrock_runtime::bitmap::BlockBitmap;
use bedrock_runtime::memory::{align_up, blocks_for, page_size_for, BLOCK_SIZE};
use bedrock_runtime::ring::MpmcRing;
use proptest::prelude::*;
use std::collections::VecDeque;

/// Operations applied to a ring and to a reference queue side by side.
#[derive(Debug, Clone)]
enum RingOp {
    Enqueue(u32),
    Dequeue,
}

fn ring_op() -> impl Strategy<Value = RingOp> {
    prop_oneof![
        any::<u32>().prop_map(RingOp::Enqueue),
        Just(RingOp::Dequeue),
    ]
}

/// Strategy for a block range inside a bitmap of `blocks` blocks.
fn block_range(blocks: usize) -> impl Strategy<Value = (usize, usize)> {
    (0..blocks).prop_flat_map(move |start| (Just(start), 1..=blocks - start))
}

fn power_of_two_align() -> impl Strategy<Value = usize> {
    (0u32..22).prop_map(|shift| 1usize << shift)
}

proptest! {
    /// The ring never holds more than its capacity and only returns what was
    /// put in, in FIFO order.
    #[test]
    fn ring_matches_bounded_fifo(
        log2 in 1u32..6,
        ops in prop::collection::vec(ring_op(), 0..200),
    ) {
        let ring = MpmcRing::with_log2_capacity(log2).unwrap();
        let capacity = ring.capacity();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                RingOp::Enqueue(value) => {
                    let result = ring.enqueue(value);
                    if model.len() < capacity {
                        prop_assert!(result.is_ok());
                        model.push_back(value);
                    } else {
                        prop_assert_eq!(result, Err(value));
                    }
                }
                RingOp::Dequeue => {
                    prop_assert_eq!(ring.dequeue(), model.pop_front());
                }
            }
            prop_assert!(ring.len() <= capacity);
            prop_assert_eq!(ring.len(), model.len());
        }
    }

    /// Only power-of-two capacities of at least 2 are accepted.
    #[test]
    fn ring_capacity_validation(capacity in 0usize..4096) {
        let ring = MpmcRing::<u8>::with_capacity(capacity);
        prop_assert_eq!(ring.is_ok(), capacity >= 2 && capacity.is_power_of_two());
    }

    /// Acquire then release restores every bit, and touches only the range.
    #[test]
    fn bitmap_acquire_release_inverse(
        blocks in 1usize..200,
        seed in any::<u64>(),
    ) {
        let bitmap = BlockBitmap::new(blocks);
        let start = (seed as usize) % blocks;
        let count = 1 + (seed >> 32) as usize % (blocks - start);

        bitmap.acquire(start, count);
        prop_assert_eq!(bitmap.count_free(), blocks - count);
        prop_assert_eq!(bitmap.count_free_range(start, count), 0);
        for block in 0..blocks {
            let inside = block >= start && block < start + count;
            prop_assert_eq!(bitmap.is_free(block), !inside);
        }

        bitmap.release(start, count);
        prop_assert_eq!(bitmap.count_free(), blocks);
    }

    /// A claim on a range overlapping a used block leaves the bitmap unchanged.
    #[test]
    fn bitmap_failed_claim_is_atomic(
        (start, count) in block_range(64),
        used in 0usize..64,
    ) {
        let bitmap = BlockBitmap::new(64);
        bitmap.acquire(used, 1);

        let overlaps = used >= start && used < start + count;
        let claimed = bitmap.try_claim_range(start, count);
        prop_assert_eq!(claimed, !overlaps);

        let expected = if claimed { 63 - count } else { 63 };
        prop_assert_eq!(bitmap.count_free(), expected);
        prop_assert!(!bitmap.is_free(used));
    }

    /// Pages always cover the request at any alignment and stay block-sized.
    #[test]
    fn page_size_covers_request(
        size in 1usize..(16 * BLOCK_SIZE),
        align in power_of_two_align(),
    ) {
        let page = page_size_for(size, align);
        prop_assert_eq!(page % BLOCK_SIZE, 0);
        prop_assert!(page >= size + align - 1);
        prop_assert_eq!(blocks_for(page) * BLOCK_SIZE, page);
    }

    /// `align_up` lands on the next multiple and never moves more than align - 1.
    #[test]
    fn align_up_is_minimal(value in 0usize..(1 << 40), align in power_of_two_align()) {
        let aligned = align_up(value, align);
        prop_assert_eq!(aligned % align, 0);
        prop_assert!(aligned >= value);
        prop_assert!(aligned - value < align);
    }
}
