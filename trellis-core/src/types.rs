//! Shared enums and small value types used across the workspace

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Discriminant of a task node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    File,
    Suite,
    Test,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::File => write!(f, "file"),
            TaskKind::Suite => write!(f, "suite"),
            TaskKind::Test => write!(f, "test"),
        }
    }
}

/// How a task was declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    #[default]
    Run,
    Skip,
    Todo,
    Only,
}

impl TaskMode {
    /// Whether the task body is expected to execute
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskMode::Run | TaskMode::Only)
    }
}

/// Lifecycle state of a task within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Passed,
    Failed,
    Skipped,
    Todo,
}

impl TaskState {
    /// Terminal states are set exactly once per run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Passed | TaskState::Failed | TaskState::Skipped | TaskState::Todo
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            TaskState::Queued => "·",
            TaskState::Running => "…",
            TaskState::Passed => "✓",
            TaskState::Failed => "✗",
            TaskState::Skipped => "↓",
            TaskState::Todo => "□",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Passed => "passed",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::Todo => "todo",
        };
        write!(f, "{}", s)
    }
}

/// Setup/teardown callback kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl HookKind {
    pub fn is_before(&self) -> bool {
        matches!(self, HookKind::BeforeAll | HookKind::BeforeEach)
    }

    /// `*Each` hooks bracket every individual test
    pub fn is_each(&self) -> bool {
        matches!(self, HookKind::BeforeEach | HookKind::AfterEach)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookKind::BeforeAll => "beforeAll",
            HookKind::AfterAll => "afterAll",
            HookKind::BeforeEach => "beforeEach",
            HookKind::AfterEach => "afterEach",
        };
        write!(f, "{}", s)
    }
}

/// Retry policy attached to a test or inherited from an ancestor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    #[serde(default)]
    pub count: u32,

    /// Delay before each retry
    #[serde(with = "humantime_serde", default)]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(count: u32, delay: Duration) -> Self {
        Self { count, delay }
    }

    /// Whether a failed attempt (1-indexed) may be followed by another
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt <= self.count
    }
}

/// Why a run stopped scheduling work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CancelReason {
    /// The bail threshold was reached
    Bail { failures: u32 },
    /// An operator asked for the run to stop
    Operator,
    /// Contexts kept crashing and the replacement budget ran out
    RestartBudgetExhausted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Bail { failures } => write!(f, "bailed after {} failed tests", failures),
            CancelReason::Operator => write!(f, "cancelled by operator"),
            CancelReason::RestartBudgetExhausted => {
                write!(f, "execution contexts kept crashing")
            }
        }
    }
}

/// Test counts by terminal state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub todo: usize,
    /// Tests that never reached a terminal state
    pub pending: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: Option<TaskState>) {
        match state {
            Some(TaskState::Passed) => self.passed += 1,
            Some(TaskState::Failed) => self.failed += 1,
            Some(TaskState::Skipped) => self.skipped += 1,
            Some(TaskState::Todo) => self.todo += 1,
            _ => self.pending += 1,
        }
    }

    pub fn merge(&mut self, other: &StateCounts) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.todo += other.todo;
        self.pending += other.pending;
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.todo + self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Passed.is_terminal());
        assert!(TaskState::Todo.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
    }

    #[test]
    fn test_retry_policy_window() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        assert!(policy.allows_retry_after(1));
        assert!(policy.allows_retry_after(2));
        assert!(!policy.allows_retry_after(3));
        assert!(!RetryPolicy::default().allows_retry_after(1));
    }

    #[test]
    fn test_retry_policy_serde() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"count": 3, "delay": "250ms"}"#).unwrap();
        assert_eq!(policy.count, 3);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }

    #[test]
    fn test_state_counts() {
        let mut counts = StateCounts::default();
        counts.record(Some(TaskState::Passed));
        counts.record(Some(TaskState::Failed));
        counts.record(None);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.pending, 1);
    }
}
