//! Error types shared by the allocator, the scheduler and the entry point.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the Bedrock runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The memory budget cannot satisfy the request.
    #[error("out of host memory: requested {requested} bytes")]
    OutOfHostMemory {
        /// Bytes requested by the failing call.
        requested: usize,
    },

    /// A size, alignment or tag argument was rejected.
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),

    /// Every live-heap slot already holds a tag.
    #[error("tagged heap table is full ({limit} slots)")]
    TooManyHeaps {
        /// Configured number of slots.
        limit: usize,
    },

    /// A handle was destroyed while other owners still referenced it.
    #[error("handle still referenced ({refs} outstanding references)")]
    StillReferenced {
        /// Reference count observed at destruction time.
        refs: i32,
    },

    /// An assertion or unreachable path fired.
    #[error("panic: {0}")]
    Panic(String),

    /// The OS refused to reserve, commit or release address space.
    #[error("memory map failed during {op}")]
    MemoryMapFailed {
        /// The virtual memory operation that failed.
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The runtime configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The scheduler could not be brought up.
    #[error("scheduler initialization failed: {0}")]
    Init(String),
}

impl Error {
    pub(crate) fn map_failed(op: &'static str, source: io::Error) -> Self {
        Error::MemoryMapFailed { op, source }
    }

    /// Whether this error means the allocator ran out of budget.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfHostMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfHostMemory { requested: 4096 };
        assert!(err.to_string().contains("4096"));
        assert!(err.is_out_of_memory());

        let err = Error::StillReferenced { refs: 3 };
        assert!(err.to_string().contains('3'));
        assert!(!err.is_out_of_memory());
    }

    #[test]
    fn test_map_failed_keeps_source() {
        use std::error::Error as _;

        let err = Error::map_failed("reserve", io::Error::from_raw_os_error(12));
        assert!(err.to_string().contains("reserve"));
        assert!(err.source().is_some());
    }
}
