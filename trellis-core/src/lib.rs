//! Core task model for Trellis
//!
//! This crate defines the task tree (files, suites and tests), their states
//! and modes, the error taxonomy recorded on task results, and the update
//! events that carry state changes from an execution context to the
//! orchestrator. It has no async or I/O dependencies.

pub mod error;
pub mod events;
pub mod task;
pub mod types;

// Re-export commonly used types at the crate root
pub use error::{CoreError, Diff, ErrorKind, Result, SourceLocation, TaskError, TestFailure};
pub use events::{TaskUpdate, UpdateKind};
pub use task::{
    AttemptRecord, HookDescriptor, NodeId, SuiteOptions, TaskId, TaskNode, TaskResult, TaskTree,
    TaskVariant, TestOptions,
};
pub use types::{
    CancelReason, HookKind, RetryPolicy, StateCounts, TaskKind, TaskMode, TaskState,
};
