//! Runtime error types

use thiserror::Error;
use trellis_core::CoreError;
use trellis_ipc::IpcError;

use crate::fixtures::FixtureScope;

/// Failures turning a file into a registered task tree
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("File read error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Invalid test name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Fixture(#[from] FixtureError),

    #[error(transparent)]
    Tree(#[from] CoreError),
}

/// Fixture graph and lookup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FixtureError {
    #[error("Fixture '{0}' is registered twice")]
    Duplicate(String),

    #[error("Unknown fixture '{fixture}' requested by '{requested_by}'")]
    Unknown { fixture: String, requested_by: String },

    #[error("Fixture dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("{scope} fixture '{fixture}' cannot depend on {dependency_scope} fixture '{dependency}'")]
    ScopeMismatch {
        fixture: String,
        scope: FixtureScope,
        dependency: String,
        dependency_scope: FixtureScope,
    },

    #[error("Fixture '{0}' is not available to this task")]
    Missing(String),

    #[error("Fixture '{0}' has a different type")]
    WrongType(String),
}

/// Errors ending an execution context's service loop
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Orchestrator link closed")]
    LinkClosed,
}
