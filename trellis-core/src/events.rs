//! Task state change events
//!
//! Contexts emit one [`TaskUpdate`] per transition. Updates for a single task
//! are produced in causal order by the context that owns the task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{AttemptRecord, TaskId, TaskResult};
use crate::types::{HookKind, TaskState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub kind: UpdateKind,
}

impl TaskUpdate {
    pub fn new(task_id: TaskId, kind: UpdateKind) -> Self {
        Self { task_id, kind }
    }

    pub fn started(task_id: TaskId) -> Self {
        Self::new(task_id, UpdateKind::Started { at: Utc::now() })
    }

    pub fn finished(task_id: TaskId, result: TaskResult) -> Self {
        Self::new(task_id, UpdateKind::Finished { result })
    }

    /// Whether this update carries a terminal result
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, UpdateKind::Finished { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateKind {
    Started {
        at: DateTime<Utc>,
    },
    HookStarted {
        hook: HookKind,
    },
    HookFinished {
        hook: HookKind,
        state: TaskState,
    },
    /// One attempt of a test completed; more may follow if retries remain
    AttemptFinished {
        record: AttemptRecord,
    },
    Finished {
        result: TaskResult,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_wire_shape() {
        let update = TaskUpdate::new(
            TaskId::from("abc_0"),
            UpdateKind::HookStarted {
                hook: HookKind::BeforeEach,
            },
        );
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["task_id"], "abc_0");
        assert_eq!(json["kind"]["event"], "hook_started");
        assert_eq!(json["kind"]["hook"], "before_each");
        assert!(!update.is_terminal());
    }
}
