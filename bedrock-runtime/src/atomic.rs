//! # Atomic Operations
//!
//! Atomic read/write/exchange/compare-exchange and fetch-op primitives with an
//! explicit memory-model parameter, plus relaxed shorthands.
//!
//! ## Design
//!
//! Every operation comes in two flavours:
//! - `*_explicit(.., model)` takes a [`MemoryModel`]
//! - the bare name uses [`MemoryModel::Relaxed`]
//!
//! Models that are illegal for a particular access (a `Release` load, an
//! `Acquire` store, ...) are weakened to the closest legal ordering instead of
//! panicking the way `std` does.

use std::sync::atomic::{
    AtomicI32, AtomicI64, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};

/// Memory-model parameter for atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryModel {
    /// No ordering constraints.
    #[default]
    Relaxed,
    /// Data-dependency ordering; promoted to acquire.
    Consume,
    /// Acquire ordering.
    Acquire,
    /// Release ordering.
    Release,
    /// Acquire and release.
    AcqRel,
    /// Sequentially consistent.
    SeqCst,
}

impl MemoryModel {
    /// Ordering for read-modify-write operations.
    pub const fn rmw(self) -> Ordering {
        match self {
            MemoryModel::Relaxed => Ordering::Relaxed,
            MemoryModel::Consume | MemoryModel::Acquire => Ordering::Acquire,
            MemoryModel::Release => Ordering::Release,
            MemoryModel::AcqRel => Ordering::AcqRel,
            MemoryModel::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering for plain loads.
    pub const fn load(self) -> Ordering {
        match self {
            MemoryModel::Relaxed | MemoryModel::Release => Ordering::Relaxed,
            MemoryModel::Consume | MemoryModel::Acquire | MemoryModel::AcqRel => Ordering::Acquire,
            MemoryModel::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering for plain stores.
    pub const fn store(self) -> Ordering {
        match self {
            MemoryModel::Relaxed | MemoryModel::Consume | MemoryModel::Acquire => Ordering::Relaxed,
            MemoryModel::Release | MemoryModel::AcqRel => Ordering::Release,
            MemoryModel::SeqCst => Ordering::SeqCst,
        }
    }

    /// Ordering for the failure path of a compare-exchange.
    pub const fn failure(self) -> Ordering {
        self.load()
    }
}

/// Atomic integer cell with explicit memory-model entry points.
pub trait AtomicOps {
    /// The plain integer type stored in the cell.
    type Value: Copy + PartialEq;

    /// Load with the given model.
    fn read_explicit(&self, model: MemoryModel) -> Self::Value;
    /// Store with the given model.
    fn write_explicit(&self, value: Self::Value, model: MemoryModel);
    /// Swap in `value`, returning the previous value.
    fn exchange_explicit(&self, value: Self::Value, model: MemoryModel) -> Self::Value;
    /// Strong compare-exchange. `Err` carries the observed value.
    fn compare_exchange_explicit(
        &self,
        current: Self::Value,
        new: Self::Value,
        success: MemoryModel,
        failure: MemoryModel,
    ) -> Result<Self::Value, Self::Value>;
    /// Weak compare-exchange; may fail spuriously.
    fn compare_exchange_weak_explicit(
        &self,
        current: Self::Value,
        new: Self::Value,
        success: MemoryModel,
        failure: MemoryModel,
    ) -> Result<Self::Value, Self::Value>;
    /// Wrapping add, returning the previous value.
    fn fetch_add_explicit(&self, value: Self::Value, model: MemoryModel) -> Self::Value;
    /// Wrapping subtract, returning the previous value.
    fn fetch_sub_explicit(&self, value: Self::Value, model: MemoryModel) -> Self::Value;
    /// Bitwise and, returning the previous value.
    fn fetch_and_explicit(&self, value: Self::Value, model: MemoryModel) -> Self::Value;
    /// Bitwise or, returning the previous value.
    fn fetch_or_explicit(&self, value: Self::Value, model: MemoryModel) -> Self::Value;
    /// Bitwise xor, returning the previous value.
    fn fetch_xor_explicit(&self, value: Self::Value, model: MemoryModel) -> Self::Value;

    /// Relaxed load.
    fn read(&self) -> Self::Value {
        self.read_explicit(MemoryModel::Relaxed)
    }

    /// Relaxed store.
    fn write(&self, value: Self::Value) {
        self.write_explicit(value, MemoryModel::Relaxed)
    }

    /// Relaxed exchange.
    fn exchange(&self, value: Self::Value) -> Self::Value {
        self.exchange_explicit(value, MemoryModel::Relaxed)
    }

    /// Relaxed strong compare-exchange.
    fn compare_exchange(&self, current: Self::Value, new: Self::Value) -> Result<Self::Value, Self::Value> {
        self.compare_exchange_explicit(current, new, MemoryModel::Relaxed, MemoryModel::Relaxed)
    }

    /// Relaxed weak compare-exchange.
    fn compare_exchange_weak(&self, current: Self::Value, new: Self::Value) -> Result<Self::Value, Self::Value> {
        self.compare_exchange_weak_explicit(current, new, MemoryModel::Relaxed, MemoryModel::Relaxed)
    }

    /// Relaxed fetch-add.
    fn fetch_add(&self, value: Self::Value) -> Self::Value {
        self.fetch_add_explicit(value, MemoryModel::Relaxed)
    }

    /// Relaxed fetch-sub.
    fn fetch_sub(&self, value: Self::Value) -> Self::Value {
        self.fetch_sub_explicit(value, MemoryModel::Relaxed)
    }

    /// Relaxed fetch-and.
    fn fetch_and(&self, value: Self::Value) -> Self::Value {
        self.fetch_and_explicit(value, MemoryModel::Relaxed)
    }

    /// Relaxed fetch-or.
    fn fetch_or(&self, value: Self::Value) -> Self::Value {
        self.fetch_or_explicit(value, MemoryModel::Relaxed)
    }

    /// Relaxed fetch-xor.
    fn fetch_xor(&self, value: Self::Value) -> Self::Value {
        self.fetch_xor_explicit(value, MemoryModel::Relaxed)
    }
}

macro_rules! impl_atomic_ops {
    ($($atomic:ty => $value:ty),* $(,)?) => {
        $(
            impl AtomicOps for $atomic {
                type Value = $value;

                #[inline]
                fn read_explicit(&self, model: MemoryModel) -> $value {
                    <$atomic>::load(self, model.load())
                }

                #[inline]
                fn write_explicit(&self, value: $value, model: MemoryModel) {
                    <$atomic>::store(self, value, model.store())
                }

                #[inline]
                fn exchange_explicit(&self, value: $value, model: MemoryModel) -> $value {
                    <$atomic>::swap(self, value, model.rmw())
                }

                #[inline]
                fn compare_exchange_explicit(
                    &self,
                    current: $value,
                    new: $value,
                    success: MemoryModel,
                    failure: MemoryModel,
                ) -> Result<$value, $value> {
                    <$atomic>::compare_exchange(self, current, new, success.rmw(), failure.failure())
                }

                #[inline]
                fn compare_exchange_weak_explicit(
                    &self,
                    current: $value,
                    new: $value,
                    success: MemoryModel,
                    failure: MemoryModel,
                ) -> Result<$value, $value> {
                    <$atomic>::compare_exchange_weak(self, current, new, success.rmw(), failure.failure())
                }

                #[inline]
                fn fetch_add_explicit(&self, value: $value, model: MemoryModel) -> $value {
                    <$atomic>::fetch_add(self, value, model.rmw())
                }

                #[inline]
                fn fetch_sub_explicit(&self, value: $value, model: MemoryModel) -> $value {
                    <$atomic>::fetch_sub(self, value, model.rmw())
                }

                #[inline]
                fn fetch_and_explicit(&self, value: $value, model: MemoryModel) -> $value {
                    <$atomic>::fetch_and(self, value, model.rmw())
                }

                #[inline]
                fn fetch_or_explicit(&self, value: $value, model: MemoryModel) -> $value {
                    <$atomic>::fetch_or(self, value, model.rmw())
                }

                #[inline]
                fn fetch_xor_explicit(&self, value: $value, model: MemoryModel) -> $value {
                    <$atomic>::fetch_xor(self, value, model.rmw())
                }
            }
        )*
    };
}

impl_atomic_ops! {
    AtomicU8 => u8,
    AtomicU16 => u16,
    AtomicU32 => u32,
    AtomicU64 => u64,
    AtomicUsize => usize,
    AtomicI32 => i32,
    AtomicI64 => i64,
}
