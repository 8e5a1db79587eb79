//! Reading run configuration from YAML and `TRELLIS_*` environment variables

use crate::domains::logging::{LogFormat, LogLevel};
use crate::domains::pool::PoolKind;
use crate::domains::sequence::HookSequence;
use crate::domains::RunConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate_choice;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Builds a [`RunConfig`] from a file or defaults, then layers environment
/// overrides and validates the result
pub struct ConfigLoader {
    prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::with_prefix("TRELLIS")
    }

    /// Read overrides from `<prefix>_*` instead of `TRELLIS_*`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<RunConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        self.from_yaml(&content)
    }

    /// An empty document means "all defaults"
    pub fn from_yaml(&self, content: &str) -> ConfigResult<RunConfig> {
        let config = if content.trim().is_empty() {
            RunConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        self.finish(config)
    }

    pub fn from_env(&self) -> ConfigResult<RunConfig> {
        self.finish(RunConfig::default())
    }

    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<RunConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    fn finish(&self, mut config: RunConfig) -> ConfigResult<RunConfig> {
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut RunConfig) -> ConfigResult<()> {
        let pool = &mut config.pool;
        self.override_with("POOL", &mut pool.kind, PoolKind::from_str)?;
        self.override_with("MAX_WORKERS", &mut pool.max_workers, str::parse)?;
        self.override_with("ISOLATE", &mut pool.isolate, str::parse)?;

        let execution = &mut config.execution;
        self.override_with("BAIL", &mut execution.bail, str::parse)?;
        self.override_with("MAX_CONCURRENCY", &mut execution.max_concurrency, str::parse)?;
        self.override_with("TEST_TIMEOUT_MS", &mut execution.test_timeout, |raw| {
            raw.parse().map(Duration::from_millis)
        })?;

        if let Some(hooks) = self.var("HOOK_SEQUENCE") {
            validate_choice(&hooks, &HookSequence::CHOICES, "HOOK_SEQUENCE")?;
        }
        self.override_with("HOOK_SEQUENCE", &mut config.sequence.hooks, HookSequence::from_str)?;

        let logging = &mut config.logging;
        self.override_with("LOG_LEVEL", &mut logging.level, LogLevel::from_str)?;
        self.override_with("LOG_FORMAT", &mut logging.format, LogFormat::from_str)?;
        Ok(())
    }

    /// Replace `slot` when `<prefix>_<name>` is set; unparseable values are errors
    fn override_with<T, E, F>(&self, name: &str, slot: &mut T, parse: F) -> ConfigResult<()>
    where
        E: Display,
        F: FnOnce(&str) -> Result<T, E>,
    {
        let Some(raw) = self.var(name) else {
            return Ok(());
        };
        *slot = parse(raw.trim()).map_err(|e| {
            ConfigError::BadOverride(format!("{}_{}='{}': {}", self.prefix, name, raw, e))
        })?;
        Ok(())
    }

    fn var(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}_{}", self.prefix, name)).ok()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
