//! # Bedrock Runtime
//!
//! A fiber job system and the memory layer underneath it:
//!
//! - **Scheduler**: worker threads multiplexing a fixed fiber pool, fed by a
//!   lock-free MPMC job ring, with work chains for yield/resume
//! - **Tagged heap**: one address-space reservation carved into 2 MiB blocks
//!   tracked by an atomic bitmap; heaps named by a tag are freed as a unit
//! - **Drifter**: per-fiber bump arena with nested push/pop scopes
//! - **Primitives**: atomics with explicit memory models, spinlocks, scope
//!   guards and intrusive reference counts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         BEDROCK RUNTIME                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Scheduler   │  │    Fibers    │  │  Work chains │           │
//! │  │(scheduler.rs)│  │  (fiber.rs)  │  │  (chain.rs)  │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         │                 │                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  MPMC ring   │  │   Contexts   │  │   Drifter    │           │
//! │  │  (ring.rs)   │  │ (context.rs) │  │ (drifter.rs) │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                             │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │ Tagged heap  │──│    Bitmap    │  │   VM layer   │           │
//! │  │(tagged_heap) │  │ (bitmap.rs)  │  │   (vm.rs)    │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use bedrock_runtime::{run, RuntimeConfig, WorkItem};
//!
//! let status = run(RuntimeConfig::default(), |job| {
//!     let items = (0..16).map(|i| WorkItem::new("tile", move |_job| shade(i))).collect();
//!     job.submit_and_yield(items);
//!     job.bedrock().set_exit_status(0);
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod atomic;
pub mod bitmap;
pub mod chain;
pub mod config;
pub mod context;
pub mod defer;
pub mod drifter;
pub mod error;
pub mod fiber;
pub mod job;
pub mod log;
pub mod memory;
pub mod panic;
pub mod refcount;
pub mod ring;
pub mod scheduler;
pub mod sync;
pub mod tagged_heap;
pub mod vm;

// Re-exports
pub use atomic::{AtomicOps, MemoryModel};
pub use chain::WorkChain;
pub use config::{ConfigError, LogConfig, LogLevel, MemoryConfig, RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig};
pub use defer::{Defer, DeferStack};
pub use drifter::Drifter;
pub use error::{Error, Result};
pub use fiber::{FiberId, FiberState};
pub use job::{Job, WorkItem};
pub use panic::{AssertAction, AssertInfo, Location as AssertLocation};
pub use refcount::{dec_ref, inc_ref, RefCount, RefCounted, Retained};
pub use ring::MpmcRing;
pub use scheduler::{run, Bedrock, SchedulerStats};
pub use sync::{SpinLock, SpinMutex};
pub use tagged_heap::{AdviseMode, HeapStats, TaggedHeapAllocator};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run `main` with configuration and logging taken from the environment.
///
/// Reads `BEDROCK_*` variables (see [`RuntimeConfig::from_env`]) and
/// installs the fmt subscriber unless one is already set.
pub fn run_from_env<F>(main: F) -> Result<i32>
where
    F: FnOnce(&mut Job<'_>) + Send + 'static,
{
    let config = RuntimeConfig::from_env();
    log::init(&config.log);
    run(config, main)
}
