//! Test execution configuration

use crate::error::ConfigResult;
use crate::validation::{require_nonzero, require_nonzero_duration, validate_pattern, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default retry policy applied to tests that declare none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries allowed after the first attempt
    pub count: u32,

    /// Delay before each retry
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

/// Test execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Default deadline of one test attempt
    #[serde(with = "humantime_serde")]
    pub test_timeout: Duration,

    /// Default deadline of one hook invocation
    #[serde(with = "humantime_serde")]
    pub hook_timeout: Duration,

    pub retry: RetrySettings,

    /// Per-suite bound on concurrently running tests
    pub max_concurrency: usize,

    /// Stop scheduling after this many failed tests; 0 disables
    pub bail: u32,

    /// Only run tests whose full name matches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name_pattern: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_secs(10),
            retry: RetrySettings::default(),
            max_concurrency: 5,
            bail: 0,
            test_name_pattern: None,
        }
    }
}

impl ExecutionConfig {
    pub fn bail_threshold(&self) -> Option<u32> {
        (self.bail > 0).then_some(self.bail)
    }
}

impl Validatable for ExecutionConfig {
    fn validate(&self) -> ConfigResult<()> {
        require_nonzero_duration(self.test_timeout, "test_timeout", self.domain_name())?;
        require_nonzero_duration(self.hook_timeout, "hook_timeout", self.domain_name())?;
        require_nonzero(self.max_concurrency, "max_concurrency", self.domain_name())?;

        if let Some(pattern) = &self.test_name_pattern {
            validate_pattern(pattern, "test_name_pattern", self.domain_name())?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution"
    }
}
