//! Runtime Configuration
//!
//! Configuration for the scheduler, the tagged heap and logging. It can be
//! set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `BEDROCK_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `BEDROCK_WORKER_THREADS` | Number of worker threads | CPU count |
//! | `BEDROCK_FIBER_COUNT` | Fibers in the pool | 96 + 4 * workers |
//! | `BEDROCK_FIBER_STACK_SIZE` | Fiber stack size in bytes | 65536 (64KB) |
//! | `BEDROCK_JOB_QUEUE_LOG2` | log2 of the job queue capacity | 11 |
//! | `BEDROCK_PIN_WORKERS` | Pin workers to CPUs ("true"/"false") | true |
//! | `BEDROCK_DEBUG_INSTRUMENTS` | Per-job trace spans ("true"/"false") | debug builds |
//! | `BEDROCK_MEMORY_BUDGET` | Bytes of address space to reserve | host RAM |
//! | `BEDROCK_HUGE_PAGE_CEILING` | Huge page size hint in bytes (0 = off) | 2097152 (2MB) |
//! | `BEDROCK_TAGGED_HEAP_COUNT` | Live tagged heap slots | 32 |
//! | `BEDROCK_FRAMES_IN_FLIGHT` | Distinct per-frame heap tags | 2 |
//! | `BEDROCK_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! Unset or unparseable variables keep their defaults.
//!
//! # Example
//!
//! ```rust,ignore
//! use bedrock_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .worker_thread_count(4)
//!     .memory_budget(1024 * 1024 * 1024) // 1GB
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

use crate::memory::BLOCK_SIZE;

/// Smallest accepted fiber stack.
pub const MIN_FIBER_STACK_SIZE: usize = 16 * 1024;

/// Largest accepted `job_queue_log2_capacity`.
pub const MAX_JOB_QUEUE_LOG2: u32 = 24;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub worker_thread_count: usize,

    /// Number of fibers in the pool.
    /// Default: `None`, meaning 96 + 4 per worker.
    pub fiber_count: Option<usize>,

    /// Stack size of every fiber in bytes.
    /// Default: 64KB.
    pub fiber_stack_size: usize,

    /// The job queue holds `1 << job_queue_log2_capacity` entries.
    /// Default: 11 (2048 entries).
    pub job_queue_log2_capacity: u32,

    /// Pin worker `i` to logical CPU `i % cpus`.
    /// Default: true.
    pub pin_workers: bool,

    /// Emit a trace span per job.
    /// Default: true in debug builds.
    pub debug_instruments_enabled: bool,
}

impl SchedulerConfig {
    /// Fiber pool size after applying the default formula.
    pub fn effective_fiber_count(&self) -> usize {
        self.fiber_count
            .unwrap_or(96 + 4 * self.worker_thread_count)
    }

    /// Job queue capacity in entries.
    pub fn job_queue_capacity(&self) -> usize {
        1usize << self.job_queue_log2_capacity
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_thread_count: num_cpus(),
            fiber_count: None,
            fiber_stack_size: 64 * 1024, // 64 KB
            job_queue_log2_capacity: 11,
            pin_workers: true,
            debug_instruments_enabled: cfg!(debug_assertions),
        }
    }
}

/// Memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Bytes of address space reserved for the tagged heap.
    /// Default: host physical memory, or 4GB when unknown.
    pub memory_budget: usize,

    /// Largest page size the OS may back committed memory with.
    /// Huge pages are requested when this is at least one block.
    /// Default: 2MB.
    pub huge_page_ceiling: usize,

    /// Number of live tagged heap slots.
    /// Default: 32.
    pub tagged_heap_count: usize,

    /// Number of distinct per-frame heap tags.
    /// Default: 2.
    pub frames_in_flight: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_budget: default_memory_budget(),
            huge_page_ceiling: 2 * 1024 * 1024,
            tagged_heap_count: 32,
            frames_in_flight: 2,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level used when `RUST_LOG` is unset.
    /// Default: Info.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include source location in log output.
    /// Default: false (only in debug builds).
    pub source_location: bool,

    /// Include the emitting thread's name.
    /// Default: true.
    pub thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            source_location: cfg!(debug_assertions),
            thread_names: true,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Memory configuration.
    pub memory: MemoryConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables that are not set use default values, and so do
    /// values that fail to parse or fall outside the accepted range.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Scheduler configuration
        if let Some(val) = parse_env_usize("BEDROCK_WORKER_THREADS") {
            if val > 0 {
                config.scheduler.worker_thread_count = val;
            }
        }

        if let Some(val) = parse_env_usize("BEDROCK_FIBER_COUNT") {
            if val >= 2 {
                config.scheduler.fiber_count = Some(val);
            }
        }

        if let Some(val) = parse_env_usize("BEDROCK_FIBER_STACK_SIZE") {
            if val >= MIN_FIBER_STACK_SIZE {
                config.scheduler.fiber_stack_size = val;
            }
        }

        if let Some(val) = parse_env_usize("BEDROCK_JOB_QUEUE_LOG2") {
            if (1..=MAX_JOB_QUEUE_LOG2 as usize).contains(&val) {
                config.scheduler.job_queue_log2_capacity = val as u32;
            }
        }

        if let Some(val) = parse_env_bool("BEDROCK_PIN_WORKERS") {
            config.scheduler.pin_workers = val;
        }

        if let Some(val) = parse_env_bool("BEDROCK_DEBUG_INSTRUMENTS") {
            config.scheduler.debug_instruments_enabled = val;
        }

        // Memory configuration
        if let Some(val) = parse_env_usize("BEDROCK_MEMORY_BUDGET") {
            if val >= MIN_MEMORY_BUDGET {
                config.memory.memory_budget = val;
            }
        }

        if let Some(val) = parse_env_usize("BEDROCK_HUGE_PAGE_CEILING") {
            config.memory.huge_page_ceiling = val;
        }

        if let Some(val) = parse_env_usize("BEDROCK_TAGGED_HEAP_COUNT") {
            if val > 0 {
                config.memory.tagged_heap_count = val;
            }
        }

        if let Some(val) = parse_env_usize("BEDROCK_FRAMES_IN_FLIGHT") {
            if val > 0 {
                config.memory.frames_in_flight = val;
            }
        }

        // Logging configuration
        if let Ok(val) = env::var("BEDROCK_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return the first error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sched = &self.scheduler;
        if sched.worker_thread_count == 0 {
            return Err(invalid("scheduler.worker_thread_count", "must be at least 1"));
        }

        if sched.effective_fiber_count() < 2 {
            return Err(invalid("scheduler.fiber_count", "must be at least 2"));
        }

        if sched.fiber_stack_size < MIN_FIBER_STACK_SIZE {
            return Err(invalid(
                "scheduler.fiber_stack_size",
                format!("must be at least {MIN_FIBER_STACK_SIZE} bytes"),
            ));
        }

        if !(1..=MAX_JOB_QUEUE_LOG2).contains(&sched.job_queue_log2_capacity) {
            return Err(invalid(
                "scheduler.job_queue_log2_capacity",
                format!("must be between 1 and {MAX_JOB_QUEUE_LOG2}"),
            ));
        }

        let mem = &self.memory;
        if mem.memory_budget < MIN_MEMORY_BUDGET {
            return Err(invalid(
                "memory.memory_budget",
                format!("must be at least {MIN_MEMORY_BUDGET} bytes"),
            ));
        }

        if mem.tagged_heap_count == 0 {
            return Err(invalid("memory.tagged_heap_count", "must be at least 1"));
        }

        if mem.frames_in_flight == 0 {
            return Err(invalid("memory.frames_in_flight", "must be at least 1"));
        }

        Ok(())
    }
}

/// Smallest accepted memory budget: four blocks.
pub const MIN_MEMORY_BUDGET: usize = 4 * BLOCK_SIZE;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn worker_thread_count(mut self, n: usize) -> Self {
        self.config.scheduler.worker_thread_count = n;
        self
    }

    /// Set the number of fibers.
    pub fn fiber_count(mut self, n: usize) -> Self {
        self.config.scheduler.fiber_count = Some(n);
        self
    }

    /// Set the fiber stack size in bytes.
    pub fn fiber_stack_size(mut self, size: usize) -> Self {
        self.config.scheduler.fiber_stack_size = size;
        self
    }

    /// Set log2 of the job queue capacity.
    pub fn job_queue_log2_capacity(mut self, log2: u32) -> Self {
        self.config.scheduler.job_queue_log2_capacity = log2;
        self
    }

    /// Enable or disable worker CPU pinning.
    pub fn pin_workers(mut self, enabled: bool) -> Self {
        self.config.scheduler.pin_workers = enabled;
        self
    }

    /// Enable or disable per-job trace spans.
    pub fn debug_instruments_enabled(mut self, enabled: bool) -> Self {
        self.config.scheduler.debug_instruments_enabled = enabled;
        self
    }

    /// Set the memory budget in bytes.
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.config.memory.memory_budget = bytes;
        self
    }

    /// Set the huge page ceiling in bytes (0 disables huge pages).
    pub fn huge_page_ceiling(mut self, bytes: usize) -> Self {
        self.config.memory.huge_page_ceiling = bytes;
        self
    }

    /// Set the number of live tagged heap slots.
    pub fn tagged_heap_count(mut self, n: usize) -> Self {
        self.config.memory.tagged_heap_count = n;
        self
    }

    /// Set the number of frames in flight.
    pub fn frames_in_flight(mut self, n: usize) -> Self {
        self.config.memory.frames_in_flight = n;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

/// Get the number of available CPUs.
pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_memory_budget() -> usize {
    const FALLBACK: usize = 4 * 1024 * 1024 * 1024;
    crate::vm::host_physical_memory()
        .filter(|&bytes| bytes >= MIN_MEMORY_BUDGET)
        .unwrap_or(FALLBACK)
}
