//! Task tree model
//!
//! A [`TaskTree`] holds one file and all suites and tests declared in it. Nodes
//! live in an arena and refer to each other through [`NodeId`] indices, so a
//! child's parent link never owns the parent and the tree stays acyclic.
//!
//! The tree is owned and mutated by the execution context that loaded the
//! file. The orchestrator keeps a read-only mirror that it updates with
//! [`TaskTree::apply_update`] as events arrive.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::ops::Index;
use std::time::Duration;

use crate::error::{CoreError, Result, SourceLocation, TaskError};
use crate::events::{TaskUpdate, UpdateKind};
use crate::types::{HookKind, RetryPolicy, StateCounts, TaskKind, TaskMode, TaskState};

/// Stable identifier of a task, derived from the file path and declaration order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Identifier of the file task for `filepath`
    pub fn for_file(filepath: &str) -> Self {
        let digest = Sha256::digest(filepath.as_bytes());
        let hex: String = digest.iter().take(5).map(|b| format!("{:02x}", b)).collect();
        TaskId(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        TaskId(id.to_string())
    }
}

/// Index of a node inside its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Kind-specific data of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskVariant {
    File {
        filepath: String,
    },
    Suite,
    Test {
        /// Expected to fail; the outcome is inverted
        #[serde(default)]
        fails: bool,
        /// Fixtures the test asks for, by name
        #[serde(default)]
        fixtures: Vec<String>,
    },
}

impl TaskVariant {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskVariant::File { .. } => TaskKind::File,
            TaskVariant::Suite => TaskKind::Suite,
            TaskVariant::Test { .. } => TaskKind::Test,
        }
    }
}

/// A hook registered on a file or suite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookDescriptor {
    pub kind: HookKind,
    /// Position among hooks of the same kind on the same node
    pub index: usize,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
}

/// One execution attempt of a test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number
    pub attempt: u32,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub errors: Vec<TaskError>,
}

/// Mutable result record of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde", default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub errors: Vec<TaskError>,
    #[serde(default)]
    pub retry_count: u32,
    /// Attempts in execution order; retries append, never overwrite
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl TaskResult {
    pub fn with_state(state: TaskState) -> Self {
        Self {
            state,
            started_at: None,
            duration: None,
            errors: Vec::new(),
            retry_count: 0,
            attempts: Vec::new(),
        }
    }
}

/// A file, suite or test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub name: String,
    pub variant: TaskVariant,
    pub mode: TaskMode,
    /// Declared concurrency; `None` inherits from the nearest ancestor
    pub concurrent: Option<bool>,
    /// Forces non-concurrent scheduling for this node and its descendants
    #[serde(default)]
    pub sequential: bool,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub hooks: Vec<HookDescriptor>,
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub location: Option<SourceLocation>,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

impl TaskNode {
    pub fn kind(&self) -> TaskKind {
        self.variant.kind()
    }

    pub fn is_test(&self) -> bool {
        self.kind() == TaskKind::Test
    }

    pub fn state(&self) -> Option<TaskState> {
        self.result.as_ref().map(|r| r.state)
    }

    pub fn is_finished(&self) -> bool {
        self.state().map(|s| s.is_terminal()).unwrap_or(false)
    }

    /// Number of hooks of `kind` registered directly on this node
    pub fn hook_count(&self, kind: HookKind) -> usize {
        self.hooks.iter().filter(|h| h.kind == kind).count()
    }
}

/// Declaration options for a suite
#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    pub mode: TaskMode,
    pub concurrent: Option<bool>,
    pub sequential: bool,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub location: Option<SourceLocation>,
}

impl SuiteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = Some(true);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry = Some(RetryPolicy::new(count, delay));
        self
    }
}

/// Declaration options for a test
#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub mode: TaskMode,
    pub concurrent: Option<bool>,
    pub sequential: bool,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub fails: bool,
    pub fixtures: Vec<String>,
    pub location: Option<SourceLocation>,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = Some(true);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    pub fn mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn skip(self) -> Self {
        self.mode(TaskMode::Skip)
    }

    pub fn only(self) -> Self {
        self.mode(TaskMode::Only)
    }

    pub fn todo(self) -> Self {
        self.mode(TaskMode::Todo)
    }

    pub fn fails(mut self) -> Self {
        self.fails = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry = Some(RetryPolicy::new(count, delay));
        self
    }

    pub fn uses(mut self, fixture: impl Into<String>) -> Self {
        self.fixtures.push(fixture.into());
        self
    }
}

#[derive(Serialize, Deserialize)]
struct TreeRepr {
    nodes: Vec<TaskNode>,
}

/// Arena-backed tree rooted at exactly one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TreeRepr", into = "TreeRepr")]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
    index: HashMap<TaskId, NodeId>,
}

impl From<TreeRepr> for TaskTree {
    fn from(repr: TreeRepr) -> Self {
        let index = repr
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), NodeId(i)))
            .collect();
        Self {
            nodes: repr.nodes,
            index,
        }
    }
}

impl From<TaskTree> for TreeRepr {
    fn from(tree: TaskTree) -> Self {
        TreeRepr { nodes: tree.nodes }
    }
}

impl Index<NodeId> for TaskTree {
    type Output = TaskNode;

    fn index(&self, id: NodeId) -> &TaskNode {
        &self.nodes[id.0]
    }
}

impl TaskTree {
    /// Create a tree holding only the file task for `filepath`
    pub fn new_file(filepath: &str) -> Self {
        let id = TaskId::for_file(filepath);
        let root = TaskNode {
            id: id.clone(),
            name: filepath.to_string(),
            variant: TaskVariant::File {
                filepath: filepath.to_string(),
            },
            mode: TaskMode::Run,
            concurrent: None,
            sequential: false,
            timeout: None,
            retry: None,
            hooks: Vec::new(),
            parent: None,
            children: Vec::new(),
            location: None,
            result: None,
        };
        let mut index = HashMap::new();
        index.insert(id, NodeId(0));
        Self {
            nodes: vec![root],
            index,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn filepath(&self) -> &str {
        match &self.nodes[0].variant {
            TaskVariant::File { filepath } => filepath,
            _ => &self.nodes[0].name,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&TaskNode> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn node_id(&self, task_id: &TaskId) -> Option<NodeId> {
        self.index.get(task_id).copied()
    }

    pub fn node_by_id(&self, task_id: &TaskId) -> Option<&TaskNode> {
        self.node_id(task_id).and_then(|id| self.get(id))
    }

    /// Iterate over all node ids in declaration (pre-)order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.preorder(self.root()).into_iter()
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut TaskNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| CoreError::UnknownTask(format!("#{}", id.0)))
    }

    fn insert_child(&mut self, parent: NodeId, mut node: TaskNode) -> Result<NodeId> {
        let parent_node = self
            .nodes
            .get(parent.0)
            .ok_or_else(|| CoreError::UnknownTask(format!("#{}", parent.0)))?;
        if parent_node.kind() == TaskKind::Test {
            return Err(CoreError::InvalidParent {
                parent: parent_node.id.clone(),
            });
        }

        node.id = TaskId(format!("{}_{}", parent_node.id, parent_node.children.len()));
        node.parent = Some(parent);

        let id = NodeId(self.nodes.len());
        self.index.insert(node.id.clone(), id);
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    /// Declare a suite under `parent`
    pub fn add_suite(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        options: SuiteOptions,
    ) -> Result<NodeId> {
        let node = TaskNode {
            id: TaskId(String::new()),
            name: name.into(),
            variant: TaskVariant::Suite,
            mode: options.mode,
            concurrent: options.concurrent,
            sequential: options.sequential,
            timeout: options.timeout,
            retry: options.retry,
            hooks: Vec::new(),
            parent: None,
            children: Vec::new(),
            location: options.location,
            result: None,
        };
        self.insert_child(parent, node)
    }

    /// Declare a test under `parent`
    pub fn add_test(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        options: TestOptions,
    ) -> Result<NodeId> {
        let node = TaskNode {
            id: TaskId(String::new()),
            name: name.into(),
            variant: TaskVariant::Test {
                fails: options.fails,
                fixtures: options.fixtures,
            },
            mode: options.mode,
            concurrent: options.concurrent,
            sequential: options.sequential,
            timeout: options.timeout,
            retry: options.retry,
            hooks: Vec::new(),
            parent: None,
            children: Vec::new(),
            location: options.location,
            result: None,
        };
        self.insert_child(parent, node)
    }

    /// Register a hook on a file or suite, returning its index within `kind`
    pub fn add_hook(
        &mut self,
        node: NodeId,
        kind: HookKind,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let target = self.node_mut(node)?;
        if target.kind() == TaskKind::Test {
            return Err(CoreError::InvalidParent {
                parent: target.id.clone(),
            });
        }
        let index = target.hook_count(kind);
        target.hooks.push(HookDescriptor {
            kind,
            index,
            timeout,
        });
        Ok(index)
    }

    /// Ancestors of `id`, nearest first (the node itself excluded)
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|n| n.parent);
        while let Some(parent) = current {
            out.push(parent);
            current = self.nodes[parent.0].parent;
        }
        out
    }

    /// Path from the root down to `id`, both included
    pub fn chain(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = self.ancestors(id);
        chain.reverse();
        chain.push(id);
        chain
    }

    fn preorder(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(node) = self.get(next) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// All nodes below `id` in declaration order
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut all = self.preorder(id);
        all.remove(0);
        all
    }

    /// All tests of the file in declaration order
    pub fn tests(&self) -> Vec<NodeId> {
        self.preorder(self.root())
            .into_iter()
            .filter(|id| self.nodes[id.0].is_test())
            .collect()
    }

    /// Suite path plus test name, without the file
    pub fn full_name(&self, id: NodeId) -> String {
        self.chain(id)
            .into_iter()
            .filter(|n| self.nodes[n.0].kind() != TaskKind::File)
            .map(|n| self.nodes[n.0].name.as_str())
            .collect::<Vec<_>>()
            .join(" > ")
    }

    pub fn effective_timeout(&self, id: NodeId, default: Duration) -> Duration {
        self.chain(id)
            .into_iter()
            .rev()
            .find_map(|n| self.nodes[n.0].timeout)
            .unwrap_or(default)
    }

    pub fn effective_retry(&self, id: NodeId, default: RetryPolicy) -> RetryPolicy {
        self.chain(id)
            .into_iter()
            .rev()
            .find_map(|n| self.nodes[n.0].retry)
            .unwrap_or(default)
    }

    /// Nearest explicit setting wins; `sequential` anywhere on the path
    /// at or below the nearest `concurrent` declaration forces `false`
    pub fn effective_concurrent(&self, id: NodeId, default: bool) -> bool {
        for n in self.chain(id).into_iter().rev() {
            let node = &self.nodes[n.0];
            if node.sequential {
                return false;
            }
            if let Some(concurrent) = node.concurrent {
                return concurrent;
            }
        }
        default
    }

    /// Apply `only`/`skip`/`todo` propagation and the name filter
    pub fn interpret_modes(&mut self, name_pattern: Option<&Regex>) {
        let has_only = self.nodes.iter().any(|n| n.mode == TaskMode::Only);
        let root = self.root();
        self.interpret_node(root, TaskMode::Run, false, has_only, name_pattern);
    }

    fn interpret_node(
        &mut self,
        id: NodeId,
        inherited: TaskMode,
        under_only: bool,
        has_only: bool,
        pattern: Option<&Regex>,
    ) {
        let own = self.nodes[id.0].mode;
        let under_only = under_only || own == TaskMode::Only;
        let mode = match (inherited, own) {
            (TaskMode::Skip | TaskMode::Todo, TaskMode::Run | TaskMode::Only) => inherited,
            _ => own,
        };
        self.nodes[id.0].mode = mode;

        if self.nodes[id.0].is_test() {
            if mode.is_runnable() {
                let filtered_by_only = has_only && !under_only;
                let filtered_by_name = pattern
                    .map(|re| !re.is_match(&self.full_name(id)))
                    .unwrap_or(false);
                if filtered_by_only || filtered_by_name {
                    self.nodes[id.0].mode = TaskMode::Skip;
                }
            }
            return;
        }

        let children = self.nodes[id.0].children.clone();
        for child in &children {
            self.interpret_node(*child, mode, under_only, has_only, pattern);
        }

        let any_runnable = children.iter().any(|c| self.nodes[c.0].mode.is_runnable());
        if !children.is_empty() && !any_runnable && mode.is_runnable() {
            self.nodes[id.0].mode = TaskMode::Skip;
        }
    }

    /// Move a task into `Running`
    pub fn mark_running(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        if node.is_finished() {
            return Err(CoreError::AlreadyFinished(node.id.clone()));
        }
        let result = node
            .result
            .get_or_insert_with(|| TaskResult::with_state(TaskState::Running));
        result.state = TaskState::Running;
        if result.started_at.is_none() {
            result.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Append one attempt; `retry_limit` bounds `retry_count`
    pub fn record_attempt(
        &mut self,
        id: NodeId,
        record: AttemptRecord,
        retry_limit: u32,
    ) -> Result<()> {
        let node = self.node_mut(id)?;
        if node.is_finished() {
            return Err(CoreError::AlreadyFinished(node.id.clone()));
        }
        let task_id = node.id.clone();
        let result = node
            .result
            .get_or_insert_with(|| TaskResult::with_state(TaskState::Running));
        let retries = result.attempts.len() as u32;
        if retries > retry_limit {
            return Err(CoreError::RetryBudgetExceeded {
                task: task_id,
                retries,
                limit: retry_limit,
            });
        }
        result.retry_count = retries;
        result.attempts.push(record);
        Ok(())
    }

    /// Set the terminal state of a task, exactly once
    pub fn mark_result(
        &mut self,
        id: NodeId,
        state: TaskState,
        errors: Vec<TaskError>,
    ) -> Result<&TaskResult> {
        if !state.is_terminal() {
            return Err(CoreError::NotTerminal(state));
        }
        let node = self.node_mut(id)?;
        if node.is_finished() {
            return Err(CoreError::AlreadyFinished(node.id.clone()));
        }
        let result = node
            .result
            .get_or_insert_with(|| TaskResult::with_state(state));
        result.state = state;
        result.errors.extend(errors);
        result.duration = Some(match result.started_at {
            Some(started) => (Utc::now() - started).to_std().unwrap_or_default(),
            None => Duration::ZERO,
        });
        Ok(result)
    }

    /// Fail every unfinished test at or below `id`, returning the affected tests
    pub fn fail_pending(&mut self, id: NodeId, error: &TaskError) -> Vec<NodeId> {
        let mut affected = Vec::new();
        for node_id in self.preorder(id) {
            let node = &self.nodes[node_id.0];
            if node.is_test() && !node.is_finished() {
                if self
                    .mark_result(node_id, TaskState::Failed, vec![error.clone()])
                    .is_ok()
                {
                    affected.push(node_id);
                }
            }
        }
        affected
    }

    /// Mirror an update emitted by the owning context
    pub fn apply_update(&mut self, update: &TaskUpdate) -> Result<NodeId> {
        let id = self
            .node_id(&update.task_id)
            .ok_or_else(|| CoreError::UnknownTask(update.task_id.to_string()))?;
        match &update.kind {
            UpdateKind::Started { at } => {
                self.mark_running(id)?;
                if let Some(result) = self.nodes[id.0].result.as_mut() {
                    result.started_at = Some(*at);
                }
            }
            UpdateKind::HookStarted { .. } | UpdateKind::HookFinished { .. } => {}
            UpdateKind::AttemptFinished { record } => {
                self.record_attempt(id, record.clone(), u32::MAX)?;
            }
            UpdateKind::Finished { result } => {
                let node = &mut self.nodes[id.0];
                if node.is_finished() {
                    return Err(CoreError::AlreadyFinished(node.id.clone()));
                }
                node.result = Some(result.clone());
            }
        }
        Ok(id)
    }

    /// Counts of test states in this file
    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for id in self.tests() {
            counts.record(self.nodes[id.0].state().filter(|s| s.is_terminal()));
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> (TaskTree, NodeId, NodeId, NodeId) {
        let mut tree = TaskTree::new_file("math.spec.yaml");
        let suite = tree
            .add_suite(tree.root(), "arithmetic", SuiteOptions::new().concurrent())
            .unwrap();
        let add = tree.add_test(suite, "adds", TestOptions::new()).unwrap();
        let sub = tree
            .add_test(suite, "subtracts", TestOptions::new().sequential())
            .unwrap();
        (tree, suite, add, sub)
    }

    #[test]
    fn test_ids_follow_declaration_order() {
        let (tree, suite, add, sub) = sample_tree();
        let file_id = tree[tree.root()].id.clone();
        assert_eq!(tree[suite].id.0, format!("{}_0", file_id));
        assert_eq!(tree[add].id.0, format!("{}_0_0", file_id));
        assert_eq!(tree[sub].id.0, format!("{}_0_1", file_id));
        assert_eq!(tree.node_id(&tree[sub].id), Some(sub));
        assert_eq!(tree.full_name(sub), "arithmetic > subtracts");
    }

    #[test]
    fn test_tests_cannot_have_children() {
        let (mut tree, _, add, _) = sample_tree();
        let err = tree.add_test(add, "nested", TestOptions::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParent { .. }));
        assert!(tree.add_hook(add, HookKind::BeforeEach, None).is_err());
    }

    #[test]
    fn test_inheritance() {
        let mut tree = TaskTree::new_file("inherit.yaml");
        let outer = tree
            .add_suite(
                tree.root(),
                "outer",
                SuiteOptions::new()
                    .timeout(Duration::from_secs(2))
                    .retry(3, Duration::from_millis(10)),
            )
            .unwrap();
        let inner = tree.add_suite(outer, "inner", SuiteOptions::new()).unwrap();
        let plain = tree.add_test(inner, "plain", TestOptions::new()).unwrap();
        let own = tree
            .add_test(inner, "own", TestOptions::new().timeout(Duration::from_millis(50)))
            .unwrap();

        let default = Duration::from_secs(5);
        assert_eq!(tree.effective_timeout(plain, default), Duration::from_secs(2));
        assert_eq!(tree.effective_timeout(own, default), Duration::from_millis(50));
        assert_eq!(tree.effective_retry(plain, RetryPolicy::default()).count, 3);
        assert_eq!(tree.effective_timeout(tree.root(), default), default);
    }

    #[test]
    fn test_effective_concurrent() {
        let (tree, _, add, sub) = sample_tree();
        assert!(tree.effective_concurrent(add, false));
        assert!(!tree.effective_concurrent(sub, true));
        assert!(!tree.effective_concurrent(tree.root(), false));
    }

    #[test]
    fn test_terminal_state_set_once() {
        let (mut tree, _, add, _) = sample_tree();
        tree.mark_running(add).unwrap();
        tree.mark_result(add, TaskState::Passed, vec![]).unwrap();
        let err = tree.mark_result(add, TaskState::Failed, vec![]).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyFinished(_)));
        assert!(tree.mark_running(add).is_err());
        assert!(matches!(
            tree.mark_result(add, TaskState::Running, vec![]),
            Err(CoreError::NotTerminal(_))
        ));
    }

    #[test]
    fn test_attempts_append_and_respect_limit() {
        let (mut tree, _, add, _) = sample_tree();
        tree.mark_running(add).unwrap();
        for attempt in 1..=2 {
            let record = AttemptRecord {
                attempt,
                state: TaskState::Failed,
                started_at: Utc::now(),
                duration: Duration::from_millis(1),
                errors: vec![TaskError::assertion("nope")],
            };
            tree.record_attempt(add, record, 1).unwrap();
        }
        let result = tree[add].result.clone().unwrap();
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.retry_count, 1);

        let third = AttemptRecord {
            attempt: 3,
            state: TaskState::Passed,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            errors: vec![],
        };
        assert!(matches!(
            tree.record_attempt(add, third, 1),
            Err(CoreError::RetryBudgetExceeded { .. })
        ));
    }

    #[test]
    fn test_only_mode_skips_siblings() {
        let mut tree = TaskTree::new_file("only.yaml");
        let root = tree.root();
        let a = tree.add_test(root, "a", TestOptions::new()).unwrap();
        let b = tree.add_test(root, "b", TestOptions::new().only()).unwrap();
        let suite = tree
            .add_suite(root, "focused", SuiteOptions::new().mode(TaskMode::Only))
            .unwrap();
        let c = tree.add_test(suite, "c", TestOptions::new()).unwrap();
        let other = tree.add_suite(root, "other", SuiteOptions::new()).unwrap();
        let d = tree.add_test(other, "d", TestOptions::new()).unwrap();

        tree.interpret_modes(None);

        assert_eq!(tree[a].mode, TaskMode::Skip);
        assert_eq!(tree[b].mode, TaskMode::Only);
        assert!(tree[c].mode.is_runnable());
        assert_eq!(tree[d].mode, TaskMode::Skip);
        assert_eq!(tree[other].mode, TaskMode::Skip);
    }

    #[test]
    fn test_skip_and_todo_propagate() {
        let mut tree = TaskTree::new_file("skip.yaml");
        let skipped = tree
            .add_suite(tree.root(), "later", SuiteOptions::new().mode(TaskMode::Todo))
            .unwrap();
        let t = tree.add_test(skipped, "t", TestOptions::new()).unwrap();
        tree.interpret_modes(None);
        assert_eq!(tree[t].mode, TaskMode::Todo);
    }

    #[test]
    fn test_name_pattern_filter() {
        let (mut tree, _, add, sub) = sample_tree();
        let pattern = Regex::new("adds$").unwrap();
        tree.interpret_modes(Some(&pattern));
        assert!(tree[add].mode.is_runnable());
        assert_eq!(tree[sub].mode, TaskMode::Skip);
    }

    #[test]
    fn test_fail_pending_preserves_finished() {
        let (mut tree, suite, add, sub) = sample_tree();
        tree.mark_result(add, TaskState::Passed, vec![]).unwrap();
        let affected = tree.fail_pending(suite, &TaskError::terminated("context killed"));
        assert_eq!(affected, vec![sub]);
        assert_eq!(tree[add].state(), Some(TaskState::Passed));
        assert_eq!(tree[sub].state(), Some(TaskState::Failed));
    }

    #[test]
    fn test_tree_serialization_rebuilds_index() {
        let (tree, _, _, sub) = sample_tree();
        let json = serde_json::to_string(&tree).unwrap();
        let back: TaskTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_id(&tree[sub].id), Some(sub));
        assert_eq!(back, tree);
    }

    #[test]
    fn test_apply_update_mirrors_result() {
        let (source, _, add, _) = sample_tree();
        let mut mirror = source.clone();
        let task_id = source[add].id.clone();

        mirror
            .apply_update(&TaskUpdate::new(
                task_id.clone(),
                UpdateKind::Started { at: Utc::now() },
            ))
            .unwrap();
        assert_eq!(mirror[add].state(), Some(TaskState::Running));

        let mut result = TaskResult::with_state(TaskState::Passed);
        result.duration = Some(Duration::from_millis(3));
        mirror
            .apply_update(&TaskUpdate::new(
                task_id.clone(),
                UpdateKind::Finished {
                    result: result.clone(),
                },
            ))
            .unwrap();
        assert_eq!(mirror[add].state(), Some(TaskState::Passed));

        let again = mirror.apply_update(&TaskUpdate::new(task_id, UpdateKind::Finished { result }));
        assert!(matches!(again, Err(CoreError::AlreadyFinished(_))));
        assert_eq!(mirror.state_counts().passed, 1);
        assert_eq!(mirror.state_counts().pending, 1);
    }
}
