//! Resilience patterns for Trellis
//!
//! This crate provides the per-attempt deadline, the bounded retry loop,
//! run cancellation with bail counting and grace escalation, and the backoff
//! used when execution contexts have to be replaced.

pub mod backoff;
pub mod cancellation;
pub mod retry;
pub mod timeout;

// Re-export commonly used types
pub use backoff::BackoffCalculator;
pub use cancellation::{CancelError, CancelSignal, CancelToken, CancellationController};
pub use retry::{Attempted, RetryError, RetryExecutor, Retryable};
pub use timeout::{run_with_deadline, AttemptError};
