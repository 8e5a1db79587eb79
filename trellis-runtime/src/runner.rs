//! Running one collected file inside an execution context
//!
//! The [`FileRunner`] owns the file's task tree for the duration of the run.
//! It walks suites recursively: `beforeAll` hooks, then children segment by
//! segment (see [`crate::scheduler`]), then `afterAll` hooks. Each test runs
//! under the retry executor; every attempt resolves fixtures, runs the
//! `beforeEach` schedule, the body under its deadline, the `afterEach`
//! schedule and finally tears down test fixtures. All state changes are
//! emitted as task updates as they happen.
//!
//! Cancellation is checked at task boundaries only. A test already running
//! finishes its attempt and after-hooks; tests not yet started are skipped.

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use trellis_config::{HookSequence, RunConfig};
use trellis_core::{
    AttemptRecord, HookKind, NodeId, RetryPolicy, TaskError, TaskId, TaskMode, TaskState,
    TaskTree, TaskUpdate, TaskVariant, UpdateKind,
};
use trellis_resilience::{run_with_deadline, AttemptError, CancellationController, RetryExecutor};

use crate::collector::{CollectedFile, Registry};
use crate::context::{FileEnv, TestContext};
use crate::fixtures::{self, FixtureSet, FixtureStore, SharedStores};
use crate::hooks::HookSchedule;
use crate::scheduler::{partition_children, Segment, SuiteLimiter};

/// Execution settings taken from the run configuration
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub test_timeout: Duration,
    pub hook_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_concurrency: usize,
    pub hooks: HookSequence,
    pub default_concurrent: bool,
}

impl RunSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            test_timeout: config.execution.test_timeout,
            hook_timeout: config.execution.hook_timeout,
            retry: RetryPolicy::new(config.execution.retry.count, config.execution.retry.delay),
            max_concurrency: config.execution.max_concurrency,
            hooks: config.sequence.hooks,
            default_concurrent: config.sequence.concurrent,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

/// Final state of a file run
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub tree: TaskTree,
    pub failed: u32,
}

struct Shared {
    tree: Mutex<TaskTree>,
    registry: Registry,
    settings: RunSettings,
    env: Arc<FileEnv>,
    controller: CancellationController,
    stores: SharedStores,
    limiters: Mutex<HashMap<NodeId, SuiteLimiter>>,
}

pub struct FileRunner {
    shared: Arc<Shared>,
}

impl FileRunner {
    /// `controller` is the batch's bail gate and cancellation state
    pub fn new(
        file: CollectedFile,
        env: Arc<FileEnv>,
        settings: RunSettings,
        controller: CancellationController,
        worker_store: Arc<tokio::sync::Mutex<FixtureStore>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(file.tree),
                registry: file.registry,
                settings,
                env,
                controller,
                stores: SharedStores::new(worker_store),
                limiters: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn run(&self) -> FileOutcome {
        let shared = self.shared.clone();
        let (root, has_tests) = {
            let tree = shared.tree.lock();
            (tree.root(), !tree.tests().is_empty())
        };

        if has_tests {
            shared.clone().run_suite(root).await;
        } else {
            shared.start(root);
            shared.finish(
                root,
                TaskState::Failed,
                vec![TaskError::collection(format!(
                    "No test found in {}",
                    shared.env.filepath
                ))],
            );
        }

        shared.stores.file.lock().await.teardown_all().await;

        let tree = shared.tree.lock().clone();
        let failed = tree.state_counts().failed as u32;
        FileOutcome { tree, failed }
    }

    /// Snapshot of the tree as it is now
    pub fn tree(&self) -> TaskTree {
        self.shared.tree.lock().clone()
    }

    /// Highest number of tests of `suite` that were in flight at once
    pub fn peak_concurrency(&self, suite: NodeId) -> usize {
        self.shared
            .limiters
            .lock()
            .get(&suite)
            .map(SuiteLimiter::peak)
            .unwrap_or(0)
    }
}

impl Shared {
    fn emit(&self, update: TaskUpdate) {
        self.env.emitter.task(&self.env.filepath, update);
    }

    fn is_cancelled(&self) -> bool {
        self.controller.is_cancelled()
    }

    fn limiter(&self, suite: NodeId) -> SuiteLimiter {
        self.limiters
            .lock()
            .entry(suite)
            .or_insert_with(|| SuiteLimiter::new(self.settings.max_concurrency))
            .clone()
    }

    fn start(&self, node: NodeId) -> Option<(TaskId, String)> {
        let (id, name, at) = {
            let mut tree = self.tree.lock();
            if let Err(e) = tree.mark_running(node) {
                warn!("Cannot start task: {}", e);
                return None;
            }
            let at = tree[node]
                .result
                .as_ref()
                .and_then(|r| r.started_at)
                .unwrap_or_else(Utc::now);
            (tree[node].id.clone(), tree.full_name(node), at)
        };
        self.emit(TaskUpdate::new(id.clone(), UpdateKind::Started { at }));
        Some((id, name))
    }

    fn finish(&self, node: NodeId, state: TaskState, errors: Vec<TaskError>) -> bool {
        let update = {
            let mut tree = self.tree.lock();
            let id = tree[node].id.clone();
            match tree.mark_result(node, state, errors) {
                Ok(result) => TaskUpdate::finished(id, result.clone()),
                Err(e) => {
                    debug!("Ignoring result: {}", e);
                    return false;
                }
            }
        };
        self.emit(update);
        true
    }

    /// Finish every unfinished node at or below `node` without running it
    fn skip_subtree(&self, node: NodeId) {
        let (tests, suites) = {
            let tree = self.tree.lock();
            let mut all = vec![node];
            all.extend(tree.descendants(node));
            let pending: Vec<(NodeId, TaskState, bool)> = all
                .into_iter()
                .filter(|n| !tree[*n].is_finished())
                .map(|n| {
                    let state = if tree[n].mode == TaskMode::Todo {
                        TaskState::Todo
                    } else {
                        TaskState::Skipped
                    };
                    (n, state, tree[n].is_test())
                })
                .collect();
            let (tests, suites): (Vec<_>, Vec<_>) = pending.into_iter().partition(|p| p.2);
            (tests, suites)
        };

        for (n, state, _) in tests {
            self.finish(n, state, Vec::new());
        }
        for (n, state, _) in suites.into_iter().rev() {
            self.finish(n, state, Vec::new());
        }
    }

    /// Fail the unfinished tests below `suite` after a suite-level hook failure
    fn fail_subtree(&self, suite: NodeId, error: &TaskError) {
        let (updates, nested) = {
            let mut tree = self.tree.lock();
            let affected = tree.fail_pending(suite, error);
            let updates: Vec<TaskUpdate> = affected
                .iter()
                .filter_map(|n| {
                    let node = &tree[*n];
                    node.result
                        .clone()
                        .map(|result| TaskUpdate::finished(node.id.clone(), result))
                })
                .collect();
            let nested: Vec<NodeId> = tree
                .descendants(suite)
                .into_iter()
                .filter(|n| !tree[*n].is_test() && !tree[*n].is_finished())
                .collect();
            (updates, nested)
        };

        let failed = updates.len() as u32;
        for update in updates {
            self.emit(update);
        }
        for n in nested.into_iter().rev() {
            self.finish(n, TaskState::Failed, Vec::new());
        }
        self.count_failures(failed);
    }

    fn count_failures(&self, count: u32) {
        if let Some(reason) = self.controller.record_failures(count) {
            info!(file = %self.env.filepath, "Stopping: {}", reason);
        }
    }

    fn run_suite(self: Arc<Self>, suite: NodeId) -> BoxFuture<'static, ()> {
        async move {
            let mode = self.tree.lock()[suite].mode;
            if !mode.is_runnable() || self.is_cancelled() {
                self.skip_subtree(suite);
                return;
            }
            let Some((task_id, name)) = self.start(suite) else {
                return;
            };
            let ctx = TestContext::new(self.env.clone(), task_id, name);
            let sequence = self.settings.hooks;

            let before = {
                let tree = self.tree.lock();
                HookSchedule::for_suite(&tree, suite, HookKind::BeforeAll, sequence)
            };
            let mut errors = self.run_hooks(before, ctx.clone(), true).await;

            if let Some(first) = errors.first().cloned() {
                self.fail_subtree(suite, &first);
            } else {
                let segments = {
                    let tree = self.tree.lock();
                    partition_children(&tree, suite, self.settings.default_concurrent)
                };
                let limiter = self.limiter(suite);
                for segment in segments {
                    match segment {
                        Segment::Sequential(nodes) => {
                            for node in nodes {
                                self.clone().run_child(node, None).await;
                            }
                        }
                        Segment::Concurrent(nodes) => {
                            join_all(
                                nodes
                                    .into_iter()
                                    .map(|node| self.clone().run_child(node, Some(limiter.clone()))),
                            )
                            .await;
                        }
                    }
                }
            }

            let after = {
                let tree = self.tree.lock();
                HookSchedule::for_suite(&tree, suite, HookKind::AfterAll, sequence)
            };
            let after_errors = self.run_hooks(after, ctx, false).await;
            if let Some(first) = after_errors.first() {
                self.fail_subtree(suite, first);
            }
            errors.extend(after_errors);

            let state = suite_state(&self.tree.lock(), suite, &errors);
            self.finish(suite, state, errors);
        }
        .boxed()
    }

    fn run_child(self: Arc<Self>, child: NodeId, limiter: Option<SuiteLimiter>) -> BoxFuture<'static, ()> {
        let is_test = self.tree.lock()[child].is_test();
        if is_test {
            self.run_test(child, limiter).boxed()
        } else {
            self.run_suite(child)
        }
    }

    async fn run_test(self: Arc<Self>, test: NodeId, limiter: Option<SuiteLimiter>) {
        let _permit = match &limiter {
            Some(limiter) => limiter.acquire().await.ok(),
            None => None,
        };

        let (mode, timeout, retry) = {
            let tree = self.tree.lock();
            (
                tree[test].mode,
                tree.effective_timeout(test, self.settings.test_timeout),
                tree.effective_retry(test, self.settings.retry),
            )
        };
        match mode {
            TaskMode::Todo => {
                self.finish(test, TaskState::Todo, Vec::new());
                return;
            }
            TaskMode::Skip => {
                self.finish(test, TaskState::Skipped, Vec::new());
                return;
            }
            TaskMode::Run | TaskMode::Only => {}
        }
        if self.is_cancelled() {
            self.finish(test, TaskState::Skipped, Vec::new());
            return;
        }
        let Some((task_id, name)) = self.start(test) else {
            return;
        };

        let executor = RetryExecutor::new(retry).with_cancel(self.controller.token());
        let outcome = executor
            .execute_with_context(|attempt| {
                self.clone()
                    .run_attempt(test, task_id.clone(), name.clone(), attempt, timeout, retry.count)
            })
            .await;

        let (state, errors) = match outcome {
            Ok(_) => (TaskState::Passed, Vec::new()),
            Err(e) => (TaskState::Failed, e.into_inner()),
        };
        if self.finish(test, state, errors) && state.is_failure() {
            self.count_failures(1);
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        test: NodeId,
        task_id: TaskId,
        name: String,
        attempt: u32,
        timeout: Duration,
        retry_limit: u32,
    ) -> Result<(), Vec<TaskError>> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let sequence = self.settings.hooks;

        let (fails, requested, before, after) = {
            let tree = self.tree.lock();
            let (fails, requested) = match &tree[test].variant {
                TaskVariant::Test { fails, fixtures } => (*fails, fixtures.clone()),
                _ => (false, Vec::new()),
            };
            (
                fails,
                requested,
                HookSchedule::for_test(&tree, test, HookKind::BeforeEach, sequence),
                HookSchedule::for_test(&tree, test, HookKind::AfterEach, sequence),
            )
        };

        let mut errors = Vec::new();
        let mut test_store = FixtureStore::new();
        let fixtures = if requested.is_empty() {
            FixtureSet::default()
        } else {
            match fixtures::resolve(&self.registry.fixtures, &requested, &self.stores, &mut test_store)
                .await
            {
                Ok(set) => set,
                Err(failure) => {
                    errors.push(failure.into_task_error());
                    FixtureSet::default()
                }
            }
        };
        let ctx = TestContext::new(self.env.clone(), task_id.clone(), name)
            .with_attempt(attempt)
            .with_fixtures(fixtures);

        if errors.is_empty() {
            errors.extend(self.run_hooks(before, ctx.clone(), true).await);
            if errors.is_empty() {
                if let Some(error) = self.run_body(test, ctx.clone(), timeout, fails).await {
                    errors.push(error);
                }
            }
            errors.extend(self.run_hooks(after, ctx.clone(), false).await);
        }
        errors.extend(ctx.settle_background());
        test_store.teardown_all().await;

        let state = if errors.is_empty() {
            TaskState::Passed
        } else {
            TaskState::Failed
        };
        let record = AttemptRecord {
            attempt,
            state,
            started_at,
            duration: clock.elapsed(),
            errors: errors.clone(),
        };
        let recorded = self
            .tree
            .lock()
            .record_attempt(test, record.clone(), retry_limit);
        match recorded {
            Ok(()) => self.emit(TaskUpdate::new(task_id, UpdateKind::AttemptFinished { record })),
            Err(e) => warn!("Attempt not recorded: {}", e),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    async fn run_body(
        &self,
        test: NodeId,
        ctx: TestContext,
        timeout: Duration,
        fails: bool,
    ) -> Option<TaskError> {
        let error = match self.registry.test(test) {
            Some(body) => match run_with_deadline(timeout, body(ctx)).await {
                Ok(Ok(())) => None,
                Ok(Err(failure)) => Some(failure.into_task_error()),
                Err(e) => Some(attempt_error(e)),
            },
            None => Some(TaskError::unhandled("Test has no body")),
        };

        match (fails, error) {
            (false, error) => error,
            (true, Some(_)) => None,
            (true, None) => Some(TaskError::assertion(
                "Expected test to fail, but it passed",
            )),
        }
    }

    async fn run_hooks(
        self: &Arc<Self>,
        schedule: HookSchedule,
        ctx: TestContext,
        stop_on_failure: bool,
    ) -> Vec<TaskError> {
        let mut errors = Vec::new();
        for step in schedule {
            let Some(kind) = step.first().map(|h| h.kind) else {
                continue;
            };
            self.emit(TaskUpdate::new(
                ctx.task_id().clone(),
                UpdateKind::HookStarted { hook: kind },
            ));

            let results = join_all(step.iter().map(|hook| {
                let shared = self.clone();
                let ctx = ctx.clone();
                let hook = *hook;
                async move { shared.run_hook(hook.node, hook.kind, hook.index, ctx).await }
            }))
            .await;
            let step_errors: Vec<TaskError> = results.into_iter().flatten().collect();

            let state = if step_errors.is_empty() {
                TaskState::Passed
            } else {
                TaskState::Failed
            };
            self.emit(TaskUpdate::new(
                ctx.task_id().clone(),
                UpdateKind::HookFinished { hook: kind, state },
            ));

            let failed = !step_errors.is_empty();
            errors.extend(step_errors);
            if failed && stop_on_failure {
                break;
            }
        }
        errors
    }

    async fn run_hook(
        &self,
        node: NodeId,
        kind: HookKind,
        index: usize,
        ctx: TestContext,
    ) -> Option<TaskError> {
        let body = self.registry.hook(node, kind, index)?;
        let limit = {
            let tree = self.tree.lock();
            tree.get(node)
                .and_then(|n| {
                    n.hooks
                        .iter()
                        .find(|d| d.kind == kind && d.index == index)
                        .and_then(|d| d.timeout)
                })
                .unwrap_or(self.settings.hook_timeout)
        };

        match run_with_deadline(limit, body(ctx)).await {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(TaskError::hook_failed(kind, failure.into_task_error())),
            Err(AttemptError::TimedOut(limit)) => Some(TaskError::hook_timeout(kind, limit)),
            Err(e) => Some(TaskError::hook_failed(kind, attempt_error(e))),
        }
    }
}

fn attempt_error(error: AttemptError) -> TaskError {
    match error {
        AttemptError::TimedOut(limit) => TaskError::timeout(limit),
        AttemptError::Panicked(message) => TaskError::unhandled(format!("Panic: {}", message)),
        AttemptError::Aborted => TaskError::unhandled("Task was aborted"),
    }
}

/// Suite result derived from its own hook errors and its tests
fn suite_state(tree: &TaskTree, suite: NodeId, errors: &[TaskError]) -> TaskState {
    if !errors.is_empty() {
        return TaskState::Failed;
    }
    let states: Vec<Option<TaskState>> = tree
        .descendants(suite)
        .into_iter()
        .filter(|n| tree[*n].is_test())
        .map(|n| tree[n].state())
        .collect();
    if states.contains(&Some(TaskState::Failed)) {
        TaskState::Failed
    } else if states.contains(&Some(TaskState::Passed)) {
        TaskState::Passed
    } else {
        TaskState::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Collector, SuiteBuilder};
    use crate::context::{CommandClient, EventEmitter};
    use crate::fixtures::{FixtureDef, FixtureScope};
    use crate::loader::FnModule;
    use trellis_core::{ErrorKind, SuiteOptions, TestFailure, TestOptions};
    use trellis_ipc::{duplex_pair, OrchestratorMessage};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Harness {
        runner: FileRunner,
        messages: tokio::sync::mpsc::UnboundedReceiver<Result<OrchestratorMessage, trellis_ipc::IpcError>>,
    }

    fn harness<F>(settings: RunSettings, bail: Option<u32>, register: F) -> Harness
    where
        F: Fn(&mut SuiteBuilder) + Send + Sync + 'static,
    {
        let module = FnModule::new(register);
        let file = Collector::collect("runner.yaml", &module, None).unwrap();
        let (context_end, orchestrator_end) = duplex_pair::<OrchestratorMessage, ()>();
        let sender = context_end.sender();
        let controller = CancellationController::new(bail, Duration::ZERO);
        let env = Arc::new(FileEnv {
            filepath: "runner.yaml".to_string(),
            emitter: EventEmitter::new(sender.clone()),
            commands: CommandClient::new(sender),
            cancel: controller.token(),
            mocks: Vec::new(),
        });
        let runner = FileRunner::new(
            file,
            env,
            settings,
            controller,
            Arc::new(tokio::sync::Mutex::new(FixtureStore::new())),
        );
        let (_, messages) = orchestrator_end.split();
        Harness { runner, messages }
    }

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().push(entry.into());
    }

    fn state_of(tree: &TaskTree, name: &str) -> TaskState {
        let id = tree
            .tests()
            .into_iter()
            .find(|n| tree[*n].name == name)
            .unwrap();
        tree[id].state().unwrap()
    }

    #[tokio::test]
    async fn test_sequential_tests_start_in_declaration_order() {
        let log: Log = Arc::default();
        let l = log.clone();
        let h = harness(RunSettings::default(), None, move |s| {
            for name in ["one", "two", "three"] {
                let l = l.clone();
                s.test(name, move |_| {
                    let l = l.clone();
                    async move {
                        push(&l, name);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    }
                });
            }
        });

        let outcome = h.runner.run().await;
        assert_eq!(*log.lock(), vec!["one", "two", "three"]);
        assert_eq!(outcome.tree.state_counts().passed, 3);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn test_suite_concurrency_is_bounded() {
        let settings = RunSettings {
            max_concurrency: 2,
            ..RunSettings::default()
        };
        let h = harness(settings, None, |s| {
            s.configure(SuiteOptions::new().concurrent());
            for name in ["a", "b", "c"] {
                s.test(name, |_| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(())
                });
            }
        });

        let outcome = h.runner.run().await;
        assert_eq!(outcome.tree.state_counts().passed, 3);
        assert_eq!(h.runner.peak_concurrency(outcome.tree.root()), 2);
    }

    #[tokio::test]
    async fn test_retry_until_pass() {
        let h = harness(RunSettings::default(), None, |s| {
            s.test_with(
                "flaky",
                TestOptions::new().retry(2, Duration::from_millis(100)),
                |ctx| async move {
                    if ctx.attempt() < 3 {
                        Err(TestFailure::new(format!("attempt {}", ctx.attempt())))
                    } else {
                        Ok(())
                    }
                },
            );
        });

        let started = Instant::now();
        let outcome = h.runner.run().await;
        assert!(started.elapsed() >= Duration::from_millis(200));

        let tree = &outcome.tree;
        let test = tree.tests()[0];
        let result = tree[test].result.clone().unwrap();
        assert_eq!(result.state, TaskState::Passed);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[0].state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_stack_hooks_unwind() {
        let log: Log = Arc::default();
        let l = log.clone();
        let settings = RunSettings {
            hooks: HookSequence::Stack,
            ..RunSettings::default()
        };
        let h = harness(settings, None, move |s| {
            for label in ["1", "2"] {
                let (before, after) = (l.clone(), l.clone());
                s.before_all(move |_| {
                    let before = before.clone();
                    async move {
                        push(&before, format!("before {}", label));
                        Ok(())
                    }
                });
                s.after_all(move |_| {
                    let after = after.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        push(&after, format!("after {}", label));
                        Ok(())
                    }
                });
            }
            let l = l.clone();
            s.describe("nested", move |s| {
                let (before, after) = (l.clone(), l.clone());
                s.before_all(move |_| {
                    let before = before.clone();
                    async move {
                        push(&before, "before 3");
                        Ok(())
                    }
                });
                s.after_all(move |_| {
                    let after = after.clone();
                    async move {
                        push(&after, "after 3");
                        Ok(())
                    }
                });
                s.test("t", |_| async { Ok(()) });
            });
        });

        h.runner.run().await;
        assert_eq!(
            *log.lock(),
            vec!["before 1", "before 2", "before 3", "after 3", "after 2", "after 1"]
        );
    }

    #[tokio::test]
    async fn test_bail_skips_remaining_tests() {
        let h = harness(RunSettings::default(), Some(1), |s| {
            s.test("first", |_| async { Ok(()) });
            s.test("second", |_| async { Err(TestFailure::new("boom")) });
            s.test("third", |_| async { Ok(()) });
            s.test("fourth", |_| async { Ok(()) });
        });

        let outcome = h.runner.run().await;
        let tree = &outcome.tree;
        assert_eq!(state_of(tree, "first"), TaskState::Passed);
        assert_eq!(state_of(tree, "second"), TaskState::Failed);
        assert_eq!(state_of(tree, "third"), TaskState::Skipped);
        assert_eq!(state_of(tree, "fourth"), TaskState::Skipped);
        for name in ["third", "fourth"] {
            let id = tree.tests().into_iter().find(|n| tree[*n].name == name).unwrap();
            assert!(tree[id].result.as_ref().unwrap().started_at.is_none());
        }
    }

    #[tokio::test]
    async fn test_timeout_does_not_block_siblings() {
        let h = harness(RunSettings::default(), None, |s| {
            s.test_with(
                "hangs",
                TestOptions::new().timeout(Duration::from_millis(50)),
                |_| futures::future::pending::<Result<(), TestFailure>>(),
            );
            s.test("after", |_| async { Ok(()) });
        });

        let outcome = h.runner.run().await;
        let tree = &outcome.tree;
        let hung = tree.tests()[0];
        let result = tree[hung].result.clone().unwrap();
        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.errors[0].kind, ErrorKind::Timeout);
        assert_eq!(state_of(tree, "after"), TaskState::Passed);
    }

    #[tokio::test]
    async fn test_before_all_failure_fails_suite_but_after_all_runs() {
        let log: Log = Arc::default();
        let l = log.clone();
        let h = harness(RunSettings::default(), None, move |s| {
            s.test("outside", |_| async { Ok(()) });
            let l = l.clone();
            s.describe("broken", move |s| {
                s.before_all(|_| async { Err(TestFailure::new("db down")) });
                let l = l.clone();
                s.after_all(move |_| {
                    let l = l.clone();
                    async move {
                        push(&l, "cleanup");
                        Ok(())
                    }
                });
                s.test("a", |_| async { Ok(()) });
                s.test("b", |_| async { Ok(()) });
            });
        });

        let outcome = h.runner.run().await;
        let tree = &outcome.tree;
        assert_eq!(state_of(tree, "outside"), TaskState::Passed);
        for name in ["a", "b"] {
            assert_eq!(state_of(tree, name), TaskState::Failed);
        }
        let a = tree.tests()[1];
        let error = &tree[a].result.as_ref().unwrap().errors[0];
        assert_eq!(error.kind, ErrorKind::Hook);
        assert_eq!(error.hook, Some(HookKind::BeforeAll));
        assert_eq!(*log.lock(), vec!["cleanup"]);
    }

    #[tokio::test]
    async fn test_each_hooks_bracket_every_test() {
        let log: Log = Arc::default();
        let l = log.clone();
        let h = harness(RunSettings::default(), None, move |s| {
            let (before, after) = (l.clone(), l.clone());
            s.before_each(move |ctx| {
                let before = before.clone();
                async move {
                    push(&before, format!("before {}", ctx.name()));
                    Ok(())
                }
            });
            s.after_each(move |ctx| {
                let after = after.clone();
                async move {
                    push(&after, format!("after {}", ctx.name()));
                    Ok(())
                }
            });
            s.test("x", |_| async { Ok(()) });
            s.test("y", |_| async { Err(TestFailure::new("nope")) });
        });

        h.runner.run().await;
        assert_eq!(
            *log.lock(),
            vec!["before x", "after x", "before y", "after y"]
        );
    }

    fn explode() -> Result<(), TestFailure> {
        panic!("unreachable state")
    }

    #[tokio::test]
    async fn test_expected_failure_and_panic() {
        let h = harness(RunSettings::default(), None, |s| {
            s.test_with("inverted", TestOptions::new().fails(), |_| async {
                Err(TestFailure::new("as expected"))
            });
            s.test_with("wrongly passes", TestOptions::new().fails(), |_| async { Ok(()) });
            s.test("panics", |_| async { explode() });
        });

        let outcome = h.runner.run().await;
        let tree = &outcome.tree;
        assert_eq!(state_of(tree, "inverted"), TaskState::Passed);
        assert_eq!(state_of(tree, "wrongly passes"), TaskState::Failed);

        let panics = tree.tests()[2];
        let error = &tree[panics].result.as_ref().unwrap().errors[0];
        assert_eq!(error.kind, ErrorKind::Unhandled);
        assert!(error.message.contains("unreachable state"));
    }

    fn blow_up(message: &str) {
        panic!("{}", message)
    }

    #[tokio::test]
    async fn test_background_panics_are_not_lost() {
        let h = harness(RunSettings::default(), None, |s| {
            s.test("spawns a failing task", |ctx| async move {
                ctx.spawn(async { blow_up("worker exploded") });
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            });
            s.test("outlived by its task", |ctx| async move {
                ctx.spawn(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    blow_up("late failure");
                });
                Ok(())
            });
        });
        let Harness { runner, mut messages } = h;

        let outcome = runner.run().await;
        let tree = &outcome.tree;
        assert_eq!(state_of(tree, "spawns a failing task"), TaskState::Failed);
        let spawner = tree.tests()[0];
        let error = &tree[spawner].result.as_ref().unwrap().errors[0];
        assert_eq!(error.kind, ErrorKind::Unhandled);
        assert!(error.message.contains("worker exploded"));
        assert_eq!(state_of(tree, "outlived by its task"), TaskState::Passed);

        let late = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match messages.recv().await {
                    Some(Ok(OrchestratorMessage::UnhandledError { filepath, error })) => {
                        return (filepath, error);
                    }
                    Some(_) => continue,
                    None => panic!("link closed before the late panic was reported"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(late.0.as_deref(), Some("runner.yaml"));
        assert!(late.1.message.contains("late failure"));
    }

    #[tokio::test]
    async fn test_hook_timeout_is_separate_from_test_timeout() {
        let h = harness(RunSettings::default(), None, |s| {
            s.hook_with(HookKind::BeforeEach, Some(Duration::from_millis(20)), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            });
            s.test_with(
                "slow setup",
                TestOptions::new().timeout(Duration::from_secs(30)),
                |_| async { Ok(()) },
            );
        });

        let outcome = h.runner.run().await;
        let test = outcome.tree.tests()[0];
        let error = &outcome.tree[test].result.as_ref().unwrap().errors[0];
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.hook, Some(HookKind::BeforeEach));
    }

    #[tokio::test]
    async fn test_fixtures_are_scoped() {
        let log: Log = Arc::default();
        let l = log.clone();
        let h = harness(RunSettings::default(), None, move |s| {
            let (file_down, test_down) = (l.clone(), l.clone());
            s.fixture(
                FixtureDef::new("pool", FixtureScope::File, |_| async { Ok(10u32) })
                    .with_teardown(move |_: Arc<u32>| {
                        let file_down = file_down.clone();
                        async move { push(&file_down, "pool down") }
                    }),
            );
            s.fixture(
                FixtureDef::new("conn", FixtureScope::Test, |deps| async move {
                    let pool = deps.get::<u32>("pool").map_err(|e| TestFailure::new(e.to_string()))?;
                    Ok(*pool + 1)
                })
                .depends_on("pool")
                .with_teardown(move |_: Arc<u32>| {
                    let test_down = test_down.clone();
                    async move { push(&test_down, "conn down") }
                }),
            );
            for name in ["first", "second"] {
                s.test_with(name, TestOptions::new().uses("conn"), |ctx| async move {
                    let conn = ctx.fixture::<u32>("conn")?;
                    crate::check_eq!(*conn, 11u32);
                    crate::check!(ctx.attempt() == 1, "unexpected retry");
                    Ok(())
                });
            }
        });

        let outcome = h.runner.run().await;
        assert_eq!(outcome.tree.state_counts().passed, 2);
        assert_eq!(*log.lock(), vec!["conn down", "conn down", "pool down"]);
    }

    #[tokio::test]
    async fn test_events_are_causally_ordered() {
        let mut h = harness(RunSettings::default(), None, |s| {
            s.test("only", |_| async { Ok(()) });
        });
        let outcome = h.runner.run().await;
        let test_id = outcome.tree[outcome.tree.tests()[0]].id.clone();

        let mut kinds = Vec::new();
        while let Ok(Ok(OrchestratorMessage::TaskEvent { update, .. })) = h.messages.try_recv() {
            if update.task_id == test_id {
                kinds.push(match update.kind {
                    UpdateKind::Started { .. } => "started",
                    UpdateKind::AttemptFinished { .. } => "attempt",
                    UpdateKind::Finished { .. } => "finished",
                    _ => "hook",
                });
            }
        }
        assert_eq!(kinds, vec!["started", "attempt", "finished"]);
    }

    #[tokio::test]
    async fn test_empty_file_is_an_error() {
        let h = harness(RunSettings::default(), None, |_| {});
        let outcome = h.runner.run().await;
        let root = outcome.tree.root();
        let result = outcome.tree[root].result.clone().unwrap();
        assert_eq!(result.state, TaskState::Failed);
        assert_eq!(result.errors[0].kind, ErrorKind::Collection);
    }
}
