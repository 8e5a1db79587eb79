//! Validation shared by the configuration domains

use crate::error::{ConfigError, ConfigResult};
use std::time::Duration;

/// A configuration domain that can check its own values
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    /// Name used as the error prefix, e.g. `pool`
    fn domain_name(&self) -> &'static str;

    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::invalid(self.domain_name(), message)
    }
}

/// Counts such as `max_workers` must be at least one
pub fn require_nonzero<T>(value: T, field: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialEq + Default + std::fmt::Display,
{
    if value == T::default() {
        return Err(ConfigError::invalid(domain, format!("{} must be at least 1", field)));
    }
    Ok(())
}

/// Timeouts and intervals of zero would fire immediately
pub fn require_nonzero_duration(value: Duration, field: &str, domain: &str) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(ConfigError::invalid(domain, format!("{} cannot be zero", field)));
    }
    Ok(())
}

/// Test name filters must compile as regular expressions
pub fn validate_pattern(pattern: &str, field: &str, domain: &str) -> ConfigResult<()> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ConfigError::invalid(domain, format!("{} is not a valid pattern: {}", field, e)))
}

/// Case-insensitive membership check for string-valued settings
pub fn validate_choice(value: &str, choices: &[&str], field: &str) -> ConfigResult<()> {
    if choices.iter().any(|c| c.eq_ignore_ascii_case(value)) {
        return Ok(());
    }
    Err(ConfigError::BadOverride(format!(
        "{} must be one of {}, got '{}'",
        field,
        choices.join(", "),
        value
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_counts_rejected() {
        assert!(require_nonzero(3usize, "max_workers", "pool").is_ok());
        let err = require_nonzero(0usize, "max_workers", "pool").unwrap_err();
        assert_eq!(err.to_string(), "Invalid pool setting: max_workers must be at least 1");
    }

    #[test]
    fn test_zero_duration_rejected() {
        assert!(require_nonzero_duration(Duration::from_millis(1), "test_timeout", "execution").is_ok());
        assert!(require_nonzero_duration(Duration::ZERO, "test_timeout", "execution").is_err());
    }

    #[test]
    fn test_name_pattern_must_compile() {
        assert!(validate_pattern("^math", "test_name_pattern", "execution").is_ok());
        assert!(validate_pattern("(", "test_name_pattern", "execution").is_err());
    }

    #[test]
    fn test_choice_ignores_case() {
        assert!(validate_choice("STACK", &["parallel", "stack"], "HOOK_SEQUENCE").is_ok());
        let err = validate_choice("random", &["parallel", "stack"], "HOOK_SEQUENCE").unwrap_err();
        assert!(matches!(err, ConfigError::BadOverride(_)));
    }
}
