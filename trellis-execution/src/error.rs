//! Error types for run orchestration

use std::time::Duration;
use thiserror::Error;

/// Orchestration errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to spawn execution context {context_id}: {message}")]
    Spawn { context_id: String, message: String },

    #[error("Execution context {0} exited before it was ready")]
    NotReady(String),

    #[error("Execution context {context_id} was not ready within {}ms", .timeout.as_millis())]
    StartupTimeout {
        context_id: String,
        timeout: Duration,
    },

    #[error("Execution context {context_id} sent {message} before ready")]
    UnexpectedMessage {
        context_id: String,
        message: &'static str,
    },

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("No test files to run")]
    NoTestFiles,
}

impl ExecutionError {
    pub(crate) fn spawn(context_id: &str, message: impl ToString) -> Self {
        Self::Spawn {
            context_id: context_id.to_string(),
            message: message.to_string(),
        }
    }
}

// Convert from config errors
impl From<trellis_config::ConfigError> for ExecutionError {
    fn from(err: trellis_config::ConfigError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}

// Convert from IPC errors
impl From<trellis_ipc::IpcError> for ExecutionError {
    fn from(err: trellis_ipc::IpcError) -> Self {
        Self::IpcError(err.to_string())
    }
}
