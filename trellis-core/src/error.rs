//! Error taxonomy for tasks and the task tree

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;
use std::time::Duration;
use thiserror::Error;

use crate::task::TaskId;
use crate::types::{HookKind, TaskState};

/// Category of a task-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The test body reported a mismatch
    Assertion,
    /// A setup/teardown hook failed
    Hook,
    /// An attempt or hook exceeded its deadline
    Timeout,
    /// A panic or error escaped user code
    Unhandled,
    /// The owning execution context was force-terminated
    Terminated,
    /// The file could not be loaded or registered
    Collection,
    /// The run was cancelled before the task finished
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Assertion => "assertion",
            ErrorKind::Hook => "hook",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unhandled => "unhandled",
            ErrorKind::Terminated => "terminated",
            ErrorKind::Collection => "collection",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Source position of a declaration, log line or failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    /// Location of the caller of the enclosing `#[track_caller]` function
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&Location<'_>> for SourceLocation {
    fn from(location: &Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Expected/actual pair attached to assertion failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub expected: String,
    pub actual: String,
}

/// An error recorded on a task result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<Diff>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hook: None,
            location: None,
            diff: None,
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Assertion, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Timed out in {}ms", limit.as_millis()),
        )
    }

    /// A hook that exceeded its own deadline
    pub fn hook_timeout(hook: HookKind, limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{} hook timed out in {}ms", hook, limit.as_millis()),
        )
        .with_hook(hook)
    }

    /// A hook whose body failed; the inner message and location are kept
    pub fn hook_failed(hook: HookKind, inner: TaskError) -> Self {
        Self {
            kind: ErrorKind::Hook,
            message: format!("{} hook failed: {}", hook, inner.message),
            hook: Some(hook),
            location: inner.location,
            diff: inner.diff,
        }
    }

    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unhandled, message)
    }

    pub fn terminated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Terminated, message)
    }

    pub fn collection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Collection, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn with_hook(mut self, hook: HookKind) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({})", location)?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

/// Failure value returned by test and hook bodies
#[derive(Debug, Clone, PartialEq)]
pub struct TestFailure {
    pub message: String,
    pub diff: Option<Diff>,
    pub location: Option<SourceLocation>,
}

impl TestFailure {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diff: None,
            location: Some(SourceLocation::caller()),
        }
    }

    pub fn with_diff(mut self, expected: impl fmt::Debug, actual: impl fmt::Debug) -> Self {
        self.diff = Some(Diff {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        });
        self
    }

    /// Convert into the recorded assertion error
    pub fn into_task_error(self) -> TaskError {
        TaskError {
            kind: ErrorKind::Assertion,
            message: self.message,
            hook: None,
            location: self.location,
            diff: self.diff,
        }
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<anyhow::Error> for TestFailure {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        TestFailure::new(format!("{:#}", err))
    }
}

impl From<String> for TestFailure {
    #[track_caller]
    fn from(message: String) -> Self {
        TestFailure::new(message)
    }
}

impl From<&str> for TestFailure {
    #[track_caller]
    fn from(message: &str) -> Self {
        TestFailure::new(message)
    }
}

/// Errors raised by task tree operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task {0} already reached a terminal state")]
    AlreadyFinished(TaskId),

    #[error("State {0} is not terminal")]
    NotTerminal(TaskState),

    #[error("Task {parent} cannot contain children")]
    InvalidParent { parent: TaskId },

    #[error("Task {task} recorded {retries} retries but only {limit} are allowed")]
    RetryBudgetExceeded { task: TaskId, retries: u32, limit: u32 },
}

/// Result type alias for tree operations
pub type Result<T> = std::result::Result<T, CoreError>;
