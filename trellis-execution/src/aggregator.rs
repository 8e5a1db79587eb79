//! Result aggregation
//!
//! The [`ResultAggregator`] keeps a read-only mirror of every file's task
//! tree, built only from the updates contexts emit. Besides applying updates
//! it tracks when each running test's current attempt began, so the
//! orchestrator can synthesise timeouts for tests whose context has gone
//! silent, and it fails whatever was pending on a context that had to be
//! killed. Terminal states are set once: an update arriving for a task the
//! mirror already finished is ignored.
//!
//! An attempt's clock matches the one the context applies to the body: it is
//! restarted when the test's `beforeEach` hooks finish, so slow setup is
//! bounded by the hook timeout rather than eating into the test's own.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use trellis_config::ExecutionConfig;
use trellis_core::{
    CancelReason, HookKind, RetryPolicy, StateCounts, TaskError, TaskId, TaskKind, TaskState, TaskTree,
    TaskUpdate, UpdateKind,
};

use crate::reporter::TaskInfo;

/// Where a file is in the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Queued,
    Running,
    Finished,
    /// Never dispatched because the run was cancelled
    NotRun,
}

/// An error attached to a file, or to the run when `filepath` is `None`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileError {
    pub filepath: Option<String>,
    pub error: TaskError,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub filepath: String,
    pub state: TaskState,
    pub counts: StateCounts,
    pub duration_ms: Option<u64>,
    pub context_id: Option<String>,
    pub errors: Vec<TaskError>,
}

/// Final outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub files: Vec<FileSummary>,
    pub counts: StateCounts,
    pub duration_ms: u64,
    pub errors: Vec<FileError>,
    pub cancelled: Option<CancelReason>,
    /// Contexts replaced after a crash
    pub restarts: u32,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.cancelled.is_none()
            && self.counts.failed == 0
            && self.counts.pending == 0
            && self.errors.is_empty()
    }

    pub fn failed_files(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.state == TaskState::Failed)
            .count()
    }

    pub fn file(&self, filepath: &str) -> Option<&FileSummary> {
        self.files.iter().find(|f| f.filepath == filepath)
    }
}

/// Result of mirroring one update
#[derive(Debug, Clone)]
pub struct Applied {
    pub task: TaskInfo,
    /// A test reached `Failed` with this update
    pub failed: bool,
}

struct FileRecord {
    filepath: String,
    status: FileStatus,
    tree: Option<TaskTree>,
    errors: Vec<TaskError>,
    context_id: Option<String>,
    /// Start of the current attempt of each running test
    attempts: HashMap<TaskId, Instant>,
    /// Longest deadline among tests timed out on this side of the link
    overdue_limit: Option<Duration>,
}

impl FileRecord {
    fn new(filepath: &str) -> Self {
        Self {
            filepath: filepath.to_string(),
            status: FileStatus::Queued,
            tree: None,
            errors: Vec::new(),
            context_id: None,
            attempts: HashMap::new(),
            overdue_limit: None,
        }
    }

    fn summary(&self) -> FileSummary {
        let counts = self
            .tree
            .as_ref()
            .map(|t| t.state_counts())
            .unwrap_or_default();
        let root = self.tree.as_ref().map(|t| &t[t.root()]);

        let mut errors = self.errors.clone();
        if let Some(result) = root.and_then(|r| r.result.as_ref()) {
            errors.extend(result.errors.iter().cloned());
        }

        let state = if self.status == FileStatus::NotRun {
            TaskState::Skipped
        } else if !errors.is_empty() || counts.failed > 0 || counts.pending > 0 {
            TaskState::Failed
        } else {
            match root.and_then(|r| r.state()) {
                Some(state) if state.is_terminal() => state,
                _ => TaskState::Failed,
            }
        };

        FileSummary {
            filepath: self.filepath.clone(),
            state,
            counts,
            duration_ms: root
                .and_then(|r| r.result.as_ref())
                .and_then(|r| r.duration)
                .map(|d| d.as_millis() as u64),
            context_id: self.context_id.clone(),
            errors,
        }
    }
}

/// Orchestrator-side mirror of all files in a run
pub struct ResultAggregator {
    files: Vec<FileRecord>,
    index: HashMap<String, usize>,
    run_errors: Vec<TaskError>,
    failed_tests: u32,
    test_timeout: Duration,
    retry: RetryPolicy,
}

impl ResultAggregator {
    pub fn new(files: &[String], execution: &ExecutionConfig) -> Self {
        let mut aggregator = Self {
            files: Vec::with_capacity(files.len()),
            index: HashMap::new(),
            run_errors: Vec::new(),
            failed_tests: 0,
            test_timeout: execution.test_timeout,
            retry: RetryPolicy::new(execution.retry.count, execution.retry.delay),
        };
        for file in files {
            aggregator.record_mut(file);
        }
        aggregator
    }

    fn record_mut(&mut self, filepath: &str) -> &mut FileRecord {
        let index = match self.index.get(filepath) {
            Some(index) => *index,
            None => {
                self.files.push(FileRecord::new(filepath));
                self.index.insert(filepath.to_string(), self.files.len() - 1);
                self.files.len() - 1
            }
        };
        &mut self.files[index]
    }

    fn record(&self, filepath: &str) -> Option<&FileRecord> {
        self.index.get(filepath).map(|i| &self.files[*i])
    }

    /// Mirrored tree of `filepath`, once collected
    pub fn tree(&self, filepath: &str) -> Option<&TaskTree> {
        self.record(filepath).and_then(|r| r.tree.as_ref())
    }

    pub fn status(&self, filepath: &str) -> Option<FileStatus> {
        self.record(filepath).map(|r| r.status)
    }

    /// Failed tests seen so far, including synthesised ones
    pub fn failed_tests(&self) -> u32 {
        self.failed_tests
    }

    pub fn file_dispatched(&mut self, filepath: &str, context_id: &str) {
        let record = self.record_mut(filepath);
        record.status = FileStatus::Running;
        record.context_id = Some(context_id.to_string());
    }

    pub fn file_finished(&mut self, filepath: &str) {
        let record = self.record_mut(filepath);
        record.status = FileStatus::Finished;
        record.attempts.clear();
    }

    pub fn collected(&mut self, tree: TaskTree) {
        let record = self.record_mut(tree.filepath());
        record.tree = Some(tree);
    }

    /// Collection or unhandled error of a file
    pub fn file_error(&mut self, filepath: &str, error: TaskError) {
        self.record_mut(filepath).errors.push(error);
    }

    /// Error raised outside of any task
    pub fn unhandled(&mut self, filepath: Option<&str>, error: TaskError) {
        match filepath {
            Some(filepath) => self.file_error(filepath, error),
            None => self.run_errors.push(error),
        }
    }

    /// Mirror one update; `None` when it was ignored
    pub fn apply_update(&mut self, filepath: &str, update: &TaskUpdate) -> Option<Applied> {
        let default_retry = self.retry;
        let record = self.record_mut(filepath);
        let Some(tree) = record.tree.as_mut() else {
            debug!("Update for {} before its tree was collected", filepath);
            return None;
        };

        let node = match tree.apply_update(update) {
            Ok(node) => node,
            Err(e) => {
                debug!("Ignoring update for {}: {}", update.task_id, e);
                return None;
            }
        };

        let task = TaskInfo::of(tree, node);
        let mut failed = false;
        if task.kind == TaskKind::Test {
            match &update.kind {
                UpdateKind::Started { .. } => {
                    record.attempts.insert(task.id.clone(), Instant::now());
                }
                UpdateKind::AttemptFinished { .. } => {
                    let delay = tree.effective_retry(node, default_retry).delay;
                    record
                        .attempts
                        .insert(task.id.clone(), Instant::now() + delay);
                }
                UpdateKind::Finished { result } => {
                    record.attempts.remove(&task.id);
                    failed = result.state == TaskState::Failed;
                }
                UpdateKind::HookFinished {
                    hook: HookKind::BeforeEach,
                    ..
                } => {
                    if let Some(started) = record.attempts.get_mut(&task.id) {
                        *started = Instant::now();
                    }
                }
                UpdateKind::HookStarted { .. } | UpdateKind::HookFinished { .. } => {}
            }
        }

        if failed {
            self.failed_tests += 1;
        }
        Some(Applied { task, failed })
    }

    /// Longest deadline among tests running in `filepath`
    ///
    /// Tests already timed out here still count: their context may be
    /// blocked inside them. When no test is known to be running, the
    /// context may have started one whose `Started` never arrived, so every
    /// unfinished test of the file bounds the wait instead.
    pub fn longest_timeout(&self, filepath: &str) -> Duration {
        let Some(record) = self.record(filepath) else {
            return self.test_timeout;
        };
        let Some(tree) = record.tree.as_ref() else {
            return self.test_timeout;
        };
        let running = record
            .attempts
            .keys()
            .filter_map(|id| tree.node_id(id))
            .map(|node| tree.effective_timeout(node, self.test_timeout))
            .chain(record.overdue_limit)
            .max();
        running.unwrap_or_else(|| {
            tree.tests()
                .into_iter()
                .filter(|node| !tree[*node].is_finished())
                .map(|node| tree.effective_timeout(node, self.test_timeout))
                .max()
                .unwrap_or(self.test_timeout)
        })
    }

    /// Fail every running test of `filepath` whose attempt is past its deadline
    pub fn synthesize_timeouts(&mut self, filepath: &str, now: Instant) -> Vec<(TaskInfo, TaskUpdate)> {
        let default_timeout = self.test_timeout;
        let record = self.record_mut(filepath);
        let FileRecord {
            tree,
            attempts,
            overdue_limit,
            ..
        } = record;
        let Some(tree) = tree.as_mut() else {
            return Vec::new();
        };

        let overdue: Vec<(TaskId, Duration)> = attempts
            .iter()
            .filter_map(|(id, started)| {
                let node = tree.node_id(id)?;
                let limit = tree.effective_timeout(node, default_timeout);
                (now >= *started + limit).then(|| (id.clone(), limit))
            })
            .collect();

        let mut synthesized = Vec::new();
        for (id, limit) in overdue {
            attempts.remove(&id);
            *overdue_limit = (*overdue_limit).max(Some(limit));
            let Some(node) = tree.node_id(&id) else { continue };
            match tree.mark_result(node, TaskState::Failed, vec![TaskError::timeout(limit)]) {
                Ok(result) => {
                    let update = TaskUpdate::finished(id, result.clone());
                    synthesized.push((TaskInfo::of(tree, node), update));
                }
                Err(e) => debug!("Timeout for {} not recorded: {}", id, e),
            }
        }

        self.failed_tests += synthesized.len() as u32;
        synthesized
    }

    /// Fail everything still pending in `filepath` with `error`
    ///
    /// Used when the context running the file was killed. Returns the
    /// updates for every task this finished, tests first.
    pub fn terminate_file(&mut self, filepath: &str, error: TaskError) -> Vec<(TaskInfo, TaskUpdate)> {
        let record = self.record_mut(filepath);
        record.status = FileStatus::Finished;
        record.attempts.clear();

        let Some(tree) = record.tree.as_mut() else {
            record.errors.push(error);
            return Vec::new();
        };

        let root = tree.root();
        let mut finished = tree.fail_pending(root, &error);
        let tests = finished.len() as u32;

        // Close suites bottom-up, then the file itself
        let mut containers: Vec<_> = tree
            .descendants(root)
            .into_iter()
            .filter(|n| !tree[*n].is_test())
            .collect();
        containers.reverse();
        for node in containers {
            if !tree[node].is_finished() && tree.mark_result(node, TaskState::Failed, Vec::new()).is_ok() {
                finished.push(node);
            }
        }
        if !tree[root].is_finished() && tree.mark_result(root, TaskState::Failed, vec![error]).is_ok() {
            finished.push(root);
        }

        let tree: &TaskTree = tree;
        let updates = finished
            .into_iter()
            .filter_map(|node| {
                let result = tree[node].result.clone()?;
                Some((
                    TaskInfo::of(tree, node),
                    TaskUpdate::finished(tree[node].id.clone(), result),
                ))
            })
            .collect();

        self.failed_tests += tests;
        updates
    }

    /// `filepath` was never dispatched
    pub fn not_run(&mut self, filepath: &str) {
        self.record_mut(filepath).status = FileStatus::NotRun;
    }

    /// `filepath` could not be run at all
    pub fn fail_unrun(&mut self, filepath: &str, error: TaskError) {
        let record = self.record_mut(filepath);
        record.status = FileStatus::Finished;
        record.errors.push(error);
    }

    pub fn summary(&self, duration: Duration, cancelled: Option<CancelReason>, restarts: u32) -> RunSummary {
        let files: Vec<FileSummary> = self.files.iter().map(FileRecord::summary).collect();

        let mut counts = StateCounts::default();
        let mut errors = Vec::new();
        for file in &files {
            counts.merge(&file.counts);
            errors.extend(file.errors.iter().cloned().map(|error| FileError {
                filepath: Some(file.filepath.clone()),
                error,
            }));
        }
        errors.extend(self.run_errors.iter().cloned().map(|error| FileError {
            filepath: None,
            error,
        }));

        RunSummary {
            files,
            counts,
            duration_ms: duration.as_millis() as u64,
            errors,
            cancelled,
            restarts,
        }
    }
}
