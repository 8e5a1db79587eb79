//! Execution context pool configuration

use crate::error::ConfigResult;
use crate::validation::{require_nonzero, require_nonzero_duration, Validatable};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Isolation strategy of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Separate OS process speaking JSON lines over stdio
    #[default]
    Process,
    /// Dedicated native thread with its own runtime
    Thread,
    /// Task on the host runtime; cheapest, shares process state
    Sandboxed,
}

impl FromStr for PoolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "forks" => Ok(PoolKind::Process),
            "thread" | "threads" => Ok(PoolKind::Thread),
            "sandboxed" | "vm" => Ok(PoolKind::Sandboxed),
            _ => Err(format!("Invalid pool kind: {}", s)),
        }
    }
}

/// What happens to queued files after a context crashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPolicy {
    /// Replace the context and keep dispatching
    #[default]
    Restart,
    /// Fail every file still queued for that slot
    FailRemaining,
}

/// Delay growth between context replacements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartBackoffConfig {
    pub strategy: BackoffKind,

    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    pub jitter: bool,
}

impl Default for RestartBackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffKind::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: false,
        }
    }
}

/// Execution context pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Isolation strategy
    pub kind: PoolKind,

    /// Reset module and fixture state between files
    #[serde(default = "crate::domains::default_true")]
    pub isolate: bool,

    /// Maximum number of contexts running in parallel
    pub max_workers: usize,

    /// Force a single context regardless of `max_workers`
    pub single_worker: bool,

    /// Retire a context once its reported memory exceeds this many MiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,

    /// How often a context reports it is alive
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Extra time after a timeout or cancel before a context is killed
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    pub crash_policy: CrashPolicy,

    /// Replacement contexts allowed over the whole run
    pub max_restarts: u32,

    pub restart_backoff: RestartBackoffConfig,

    /// Program started for process contexts; defaults to the current executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<String>,

    /// Arguments passed before `--worker-id`
    pub worker_args: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::default(),
            isolate: true,
            max_workers: default_max_workers(),
            single_worker: false,
            memory_limit_mb: None,
            heartbeat_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            crash_policy: CrashPolicy::default(),
            max_restarts: 3,
            restart_backoff: RestartBackoffConfig::default(),
            worker_program: None,
            worker_args: vec!["--worker".to_string()],
        }
    }
}

impl PoolConfig {
    /// Number of contexts the pool may run at once
    pub fn effective_workers(&self) -> usize {
        if self.single_worker {
            1
        } else {
            self.max_workers.max(1)
        }
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        require_nonzero(self.max_workers, "max_workers", self.domain_name())?;
        require_nonzero_duration(self.heartbeat_interval, "heartbeat_interval", self.domain_name())?;
        if let Some(limit) = self.memory_limit_mb {
            require_nonzero(limit, "memory_limit_mb", self.domain_name())?;
        }

        if self.restart_backoff.initial_delay > self.restart_backoff.max_delay {
            return Err(self.validation_error(
                "restart_backoff.initial_delay cannot exceed restart_backoff.max_delay",
            ));
        }

        if self.kind != PoolKind::Process && self.worker_program.is_some() {
            log::warn!("pool.worker_program is ignored for {:?} pools", self.kind);
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

fn default_max_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert!(config.isolate);
        assert!(config.max_workers >= 1);
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_worker_overrides_max() {
        let config = PoolConfig {
            max_workers: 8,
            single_worker: true,
            ..Default::default()
        };
        assert_eq!(config.effective_workers(), 1);
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let config = PoolConfig {
            restart_backoff: RestartBackoffConfig {
                initial_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_kind_aliases() {
        assert_eq!("forks".parse::<PoolKind>().unwrap(), PoolKind::Process);
        assert_eq!("Threads".parse::<PoolKind>().unwrap(), PoolKind::Thread);
        assert_eq!("vm".parse::<PoolKind>().unwrap(), PoolKind::Sandboxed);
        assert!("cluster".parse::<PoolKind>().is_err());
    }
}
