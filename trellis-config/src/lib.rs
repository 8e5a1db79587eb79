//! Run configuration for Trellis
//!
//! Configuration is split by functional domain (pool, execution, sequence,
//! logging) with defaults, validation and `TRELLIS_*` environment overrides.
//! A loaded [`RunConfig`] is treated as immutable for the duration of a run.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    execution::{ExecutionConfig, RetrySettings},
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::{BackoffKind, CrashPolicy, PoolConfig, PoolKind, RestartBackoffConfig},
    sequence::{HookSequence, SequenceConfig},
    RunConfig,
};
