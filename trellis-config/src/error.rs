//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read run configuration {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run configuration is not valid YAML: {0}")]
    Malformed(#[from] serde_yaml::Error),

    /// A `TRELLIS_*` variable could not be applied
    #[error("Bad environment override: {0}")]
    BadOverride(String),

    /// A value is out of range for its domain
    #[error("Invalid {domain} setting: {message}")]
    Invalid { domain: String, message: String },
}

impl ConfigError {
    pub fn invalid(domain: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            domain: domain.to_string(),
            message: message.into(),
        }
    }
}
