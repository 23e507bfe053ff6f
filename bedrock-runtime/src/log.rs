//! Logging Infrastructure
//!
//! The runtime emits structured `tracing` events everywhere and never
//! installs a subscriber on its own. Binaries and tests that want output call
//! [`init`] once, which installs a `tracing-subscriber` formatter filtered by
//! `RUST_LOG` or, when that is unset, by [`LogConfig::level`].
//!
//! # Example
//!
//! ```rust,ignore
//! use bedrock_runtime::config::LogConfig;
//!
//! bedrock_runtime::log::init(&LogConfig::default());
//! tracing::info!(workers = 4, "scheduler started");
//! ```

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Map a configured level onto a `tracing` filter.
pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Off => LevelFilter::OFF,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install the global fmt subscriber.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init(config: &LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true)
        .with_thread_names(config.thread_names)
        .with_file(config.source_location)
        .with_line_number(config.source_location);

    let result = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };
    result.is_ok()
}
