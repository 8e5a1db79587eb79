//! Domain-specific configuration modules

pub mod execution;
pub mod logging;
pub mod pool;
pub mod sequence;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Complete run configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Execution context pool configuration
    #[serde(default)]
    pub pool: pool::PoolConfig,

    /// Timeouts, retries, concurrency and bail
    #[serde(default)]
    pub execution: execution::ExecutionConfig,

    /// Hook and test sequencing
    #[serde(default)]
    pub sequence: sequence::SequenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,

    /// Values made available to test code through `inject`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provide: BTreeMap<String, serde_json::Value>,
}

impl RunConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.execution.validate()?;
        self.sequence.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = RunConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}

pub(crate) fn default_true() -> bool {
    true
}
