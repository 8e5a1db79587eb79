//! Trellis Execution Engine
//!
//! This crate provides the orchestrator side of a run: spawning execution
//! contexts of every pool kind, scheduling files across them, mirroring the
//! task updates they emit, supervising their liveness and fanning events out
//! to reporters.

pub mod aggregator;
pub mod error;
pub mod orchestrator;
pub mod reporter;
pub mod spawner;

// Re-export main types
pub use aggregator::{FileError, FileStatus, FileSummary, ResultAggregator, RunSummary};
pub use error::ExecutionError;
pub use orchestrator::{CancelHandle, Orchestrator};
pub use reporter::{ChannelReporter, Reporter, ReporterEvent, Reporters, TaskInfo};
pub use spawner::{
    spawner_for, ContextHandle, ContextSpawner, ProcessSpawner, SandboxSpawner, ThreadSpawner,
};
