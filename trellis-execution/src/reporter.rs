//! Reporter seam
//!
//! Reporters are pure consumers of the run: they receive events in the order
//! the orchestrator mirrored them and never touch the task trees.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use trellis_config::PoolKind;
use trellis_core::{NodeId, TaskError, TaskId, TaskKind, TaskTree, TaskUpdate};
use trellis_ipc::ConsoleEntry;

use crate::aggregator::RunSummary;

/// Identity of a task as reporters see it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    /// Suite path plus name; the file path for file tasks
    pub name: String,
    pub kind: TaskKind,
}

impl TaskInfo {
    pub fn of(tree: &TaskTree, node: NodeId) -> Self {
        let task = &tree[node];
        let name = match task.kind() {
            TaskKind::File => tree.filepath().to_string(),
            _ => tree.full_name(node),
        };
        Self {
            id: task.id.clone(),
            name,
            kind: task.kind(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReporterEvent {
    RunStarted {
        files: Vec<String>,
        workers: usize,
        pool: PoolKind,
    },
    FileCollected {
        filepath: String,
        tree: TaskTree,
    },
    Task {
        filepath: String,
        task: TaskInfo,
        update: TaskUpdate,
    },
    Console {
        entry: ConsoleEntry,
    },
    /// Error that belongs to a file (or the run) rather than a test
    Error {
        filepath: Option<String>,
        error: TaskError,
    },
    ContextCrashed {
        context_id: String,
        filepath: String,
        reason: String,
    },
    RunFinished {
        summary: RunSummary,
    },
}

/// Consumer of run events
pub trait Reporter: Send + Sync {
    fn on_event(&self, event: &ReporterEvent);
}

/// Fan-out to several reporters, in registration order
#[derive(Clone, Default)]
pub struct Reporters {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl Reporters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Reporter for Reporters {
    fn on_event(&self, event: &ReporterEvent) {
        for reporter in &self.reporters {
            reporter.on_event(event);
        }
    }
}

/// Forwards every event into a channel
#[derive(Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ReporterEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReporterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn on_event(&self, event: &ReporterEvent) {
        // A dropped receiver just stops listening
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{SuiteOptions, TestOptions};

    #[test]
    fn test_task_info_names() {
        let mut tree = TaskTree::new_file("math.yaml");
        let suite = tree.add_suite(tree.root(), "sums", SuiteOptions::new()).unwrap();
        let test = tree.add_test(suite, "adds", TestOptions::new()).unwrap();

        assert_eq!(TaskInfo::of(&tree, tree.root()).name, "math.yaml");
        let info = TaskInfo::of(&tree, test);
        assert_eq!(info.name, "sums > adds");
        assert_eq!(info.kind, TaskKind::Test);
    }

    #[test]
    fn test_fan_out_reaches_every_reporter() {
        let (first, mut first_rx) = ChannelReporter::new();
        let (second, mut second_rx) = ChannelReporter::new();
        let mut reporters = Reporters::new();
        reporters.push(Arc::new(first));
        reporters.push(Arc::new(second));

        reporters.on_event(&ReporterEvent::Error {
            filepath: None,
            error: TaskError::unhandled("boom"),
        });

        assert!(matches!(first_rx.try_recv(), Ok(ReporterEvent::Error { .. })));
        assert!(matches!(second_rx.try_recv(), Ok(ReporterEvent::Error { .. })));
    }

    #[test]
    fn test_event_json_shape() {
        let event = ReporterEvent::ContextCrashed {
            context_id: "context-0-1".to_string(),
            filepath: "hang.yaml".to_string(),
            reason: "link closed".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "context_crashed");
        assert_eq!(json["filepath"], "hang.yaml");
    }
}
