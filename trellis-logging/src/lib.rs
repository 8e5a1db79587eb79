//! Logging setup for Trellis
//!
//! Every crate logs through `tracing`; this crate installs the global
//! subscriber. Everything logs to stderr: the orchestrator's stdout belongs
//! to reporters and a process context's stdout carries the IPC stream. The
//! orchestrator re-emits a process context's stderr at debug level.

pub mod init;

pub use init::{build_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing};
