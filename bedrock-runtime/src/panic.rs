//! Assertions and Job Panics
//!
//! Two concerns live here:
//!
//! - **Assertions**: [`bedrock_assert!`](crate::bedrock_assert) checks an
//!   invariant in debug builds and routes failures through a process-wide
//!   handler that chooses an [`AssertAction`].
//! - **Job panics**: [`catch_job_panic`] runs a job body, turning a panic into
//!   an [`Error::Panic`] so the fiber running it can be recycled.
//!
//! # Example
//!
//! ```rust,ignore
//! use bedrock_runtime::panic::{set_assert_handler, AssertAction};
//!
//! // Keep running after a failed assertion, logging it instead.
//! set_assert_handler(|info| {
//!     eprintln!("assertion failed: {info}");
//!     AssertAction::Log
//! });
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::error;

use crate::error::{Error, Result};

/// Counter for jobs that panicked.
static JOB_PANIC_COUNT: AtomicU64 = AtomicU64::new(0);

type AssertHandler = Arc<dyn Fn(&AssertInfo) -> AssertAction + Send + Sync>;

/// Currently installed assertion handler.
static ASSERT_HANDLER: OnceLock<RwLock<Option<AssertHandler>>> = OnceLock::new();

fn assert_handler() -> &'static RwLock<Option<AssertHandler>> {
    ASSERT_HANDLER.get_or_init(|| RwLock::new(None))
}

/// Source location information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// File name.
    pub file: &'static str,
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// What to do about a failed assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssertAction {
    /// Panic on the current thread (default).
    #[default]
    Panic,
    /// Abort the process.
    Abort,
    /// Stop in an attached debugger; aborts where that is unavailable.
    Trap,
    /// Log the failure and keep going.
    Log,
}

/// A failed assertion.
#[derive(Debug, Clone)]
pub struct AssertInfo {
    /// Source text of the failed condition.
    pub expression: &'static str,
    /// Optional formatted message.
    pub message: Option<String>,
    /// Where the assertion lives.
    pub location: Location,
}

impl fmt::Display for AssertInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` at {}", self.expression, self.location)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Install a handler that decides what a failed assertion does.
pub fn set_assert_handler<F>(handler: F)
where
    F: Fn(&AssertInfo) -> AssertAction + Send + Sync + 'static,
{
    *assert_handler().write() = Some(Arc::new(handler));
}

/// Restore the default handler, which panics.
pub fn reset_assert_handler() {
    *assert_handler().write() = None;
}

/// Dispatch a failed assertion to the installed handler.
///
/// Called by [`bedrock_assert!`](crate::bedrock_assert); returns only for
/// [`AssertAction::Log`].
pub fn report_assert(info: &AssertInfo) {
    // Clone out of the lock so a handler may replace itself.
    let handler = assert_handler().read().clone();
    let action = handler.map_or(AssertAction::Panic, |h| h(info));

    error!(
        expression = info.expression,
        location = %info.location,
        message = info.message.as_deref().unwrap_or(""),
        ?action,
        "assertion failed"
    );

    match action {
        AssertAction::Panic => panic!("assertion failed: {info}"),
        AssertAction::Abort => std::process::abort(),
        AssertAction::Trap => trap(),
        AssertAction::Log => {}
    }
}

#[cfg(unix)]
fn trap() {
    use nix::sys::signal::{raise, Signal};

    if raise(Signal::SIGTRAP).is_err() {
        std::process::abort();
    }
}

#[cfg(not(unix))]
fn trap() {
    std::process::abort();
}

/// Check an invariant in debug builds.
///
/// The condition is not evaluated when `debug_assertions` are off.
///
/// ```
/// bedrock_runtime::bedrock_assert!(1 + 1 == 2);
/// bedrock_runtime::bedrock_assert!(4 % 2 == 0, "{} must be even", 4);
/// ```
#[macro_export]
macro_rules! bedrock_assert {
    ($cond:expr $(,)?) => {
        if cfg!(debug_assertions) && !($cond) {
            $crate::panic::report_assert(&$crate::panic::AssertInfo {
                expression: stringify!($cond),
                message: None,
                location: $crate::panic::Location {
                    file: file!(),
                    line: line!(),
                    column: column!(),
                },
            });
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if cfg!(debug_assertions) && !($cond) {
            $crate::panic::report_assert(&$crate::panic::AssertInfo {
                expression: stringify!($cond),
                message: Some(format!($($arg)+)),
                location: $crate::panic::Location {
                    file: file!(),
                    line: line!(),
                    column: column!(),
                },
            });
        }
    };
}

/// Extract a message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a job body, converting a panic into [`Error::Panic`].
///
/// The panic is logged with the job's name and counted.
pub fn catch_job_panic<R>(job: &str, f: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(&*payload);
        let count = JOB_PANIC_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        error!(job, panic = %message, count, "job panicked");
        Error::Panic(message)
    })
}

/// Number of job panics caught in this process.
pub fn job_panic_count() -> u64 {
    JOB_PANIC_COUNT.load(Ordering::Relaxed)
}
