//! Collection: turning a loaded module into a task tree plus callbacks
//!
//! The module declares its suites, tests, hooks and fixtures through a
//! [`SuiteBuilder`]. Declarations go into a [`TaskTree`] (the data) and a
//! [`Registry`] (the callbacks keyed by node). Nothing runs during
//! collection; a panic or invalid declaration becomes a collection error for
//! the whole file.

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use trellis_core::{
    HookKind, NodeId, SourceLocation, SuiteOptions, TaskMode, TaskTree, TaskVariant,
    TestFailure, TestOptions,
};
use trellis_resilience::timeout::panic_message;

use crate::context::TestContext;
use crate::error::LoadError;
use crate::fixtures::{FixtureDef, FixtureRegistry};
use crate::loader::ExecutableModule;

/// Body of a test or hook
pub type TaskFn =
    Arc<dyn Fn(TestContext) -> BoxFuture<'static, Result<(), TestFailure>> + Send + Sync>;

fn boxed<F, Fut>(f: F) -> TaskFn
where
    F: Fn(TestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Callbacks of one file, keyed by tree node
#[derive(Clone, Default)]
pub struct Registry {
    tests: HashMap<NodeId, TaskFn>,
    hooks: HashMap<(NodeId, HookKind), Vec<TaskFn>>,
    pub fixtures: FixtureRegistry,
}

impl Registry {
    pub fn test(&self, node: NodeId) -> Option<TaskFn> {
        self.tests.get(&node).cloned()
    }

    /// Hooks of `kind` on `node`, in registration order
    pub fn hooks(&self, node: NodeId, kind: HookKind) -> &[TaskFn] {
        self.hooks
            .get(&(node, kind))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn hook(&self, node: NodeId, kind: HookKind, index: usize) -> Option<TaskFn> {
        self.hooks(node, kind).get(index).cloned()
    }
}

/// Declaration API handed to [`ExecutableModule::register`]
pub struct SuiteBuilder {
    tree: TaskTree,
    registry: Registry,
    current: NodeId,
    errors: Vec<String>,
}

impl SuiteBuilder {
    pub fn new(filepath: &str) -> Self {
        let tree = TaskTree::new_file(filepath);
        let current = tree.root();
        Self {
            tree,
            registry: Registry::default(),
            current,
            errors: Vec::new(),
        }
    }

    /// Apply options to the suite (or file) being declared
    pub fn configure(&mut self, options: SuiteOptions) -> &mut Self {
        if let Some(node) = self.tree.get_mut(self.current) {
            if options.concurrent.is_some() {
                node.concurrent = options.concurrent;
            }
            node.sequential |= options.sequential;
            if options.timeout.is_some() {
                node.timeout = options.timeout;
            }
            if options.retry.is_some() {
                node.retry = options.retry;
            }
            if options.mode != TaskMode::default() {
                node.mode = options.mode;
            }
        }
        self
    }

    #[track_caller]
    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.test_with(name, TestOptions::new(), body)
    }

    #[track_caller]
    pub fn test_with<F, Fut>(
        &mut self,
        name: impl Into<String>,
        mut options: TestOptions,
        body: F,
    ) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        if options.location.is_none() {
            options.location = Some(SourceLocation::caller());
        }
        match self.tree.add_test(self.current, name, options) {
            Ok(id) => {
                self.registry.tests.insert(id, boxed(body));
            }
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    /// A placeholder test reported as `todo`
    #[track_caller]
    pub fn todo(&mut self, name: impl Into<String>) -> &mut Self {
        self.test_with(name, TestOptions::new().todo(), |_| async { Ok(()) })
    }

    #[track_caller]
    pub fn describe<F>(&mut self, name: impl Into<String>, declare: F) -> &mut Self
    where
        F: FnOnce(&mut SuiteBuilder),
    {
        self.describe_with(name, SuiteOptions::new(), declare)
    }

    #[track_caller]
    pub fn describe_with<F>(
        &mut self,
        name: impl Into<String>,
        mut options: SuiteOptions,
        declare: F,
    ) -> &mut Self
    where
        F: FnOnce(&mut SuiteBuilder),
    {
        if options.location.is_none() {
            options.location = Some(SourceLocation::caller());
        }
        match self.tree.add_suite(self.current, name, options) {
            Ok(id) => {
                let parent = self.current;
                self.current = id;
                declare(self);
                self.current = parent;
            }
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    pub fn before_all<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.hook_with(HookKind::BeforeAll, None, hook)
    }

    pub fn after_all<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.hook_with(HookKind::AfterAll, None, hook)
    }

    pub fn before_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.hook_with(HookKind::BeforeEach, None, hook)
    }

    pub fn after_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.hook_with(HookKind::AfterEach, None, hook)
    }

    /// Register a hook with its own timeout
    pub fn hook_with<F, Fut>(
        &mut self,
        kind: HookKind,
        timeout: Option<Duration>,
        hook: F,
    ) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        match self.tree.add_hook(self.current, kind, timeout) {
            Ok(_) => self
                .registry
                .hooks
                .entry((self.current, kind))
                .or_default()
                .push(boxed(hook)),
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    /// Fixtures are file-wide regardless of the suite they are declared in
    pub fn fixture(&mut self, def: FixtureDef) -> &mut Self {
        if let Err(e) = self.registry.fixtures.register(def) {
            self.errors.push(e.to_string());
        }
        self
    }

    /// Record a declaration problem found by the module itself
    pub fn invalid(&mut self, message: impl Into<String>) -> &mut Self {
        self.errors.push(message.into());
        self
    }

    fn finish(self) -> Result<(TaskTree, Registry), LoadError> {
        if self.errors.is_empty() {
            Ok((self.tree, self.registry))
        } else {
            Err(LoadError::Registration(self.errors.join("; ")))
        }
    }
}

/// A collected file, ready to run
#[derive(Clone)]
pub struct CollectedFile {
    pub tree: TaskTree,
    pub registry: Registry,
}

pub struct Collector;

impl Collector {
    /// Register `module`, validate its fixture graph and interpret modes
    pub fn collect(
        filepath: &str,
        module: &dyn ExecutableModule,
        name_pattern: Option<&Regex>,
    ) -> Result<CollectedFile, LoadError> {
        let mut builder = SuiteBuilder::new(filepath);
        std::panic::catch_unwind(AssertUnwindSafe(|| module.register(&mut builder))).map_err(
            |payload| {
                LoadError::Registration(format!(
                    "panic during registration: {}",
                    panic_message(payload)
                ))
            },
        )?;
        let (mut tree, registry) = builder.finish()?;

        let requests: Vec<(String, Vec<String>)> = tree
            .tests()
            .into_iter()
            .filter_map(|id| match &tree[id].variant {
                TaskVariant::Test { fixtures, .. } if !fixtures.is_empty() => {
                    Some((tree.full_name(id), fixtures.clone()))
                }
                _ => None,
            })
            .collect();
        registry.fixtures.validate(
            requests
                .iter()
                .map(|(name, fixtures)| (name.as_str(), fixtures.as_slice())),
        )?;

        tree.interpret_modes(name_pattern);
        debug!(
            file = filepath,
            tests = tree.tests().len(),
            "Collected file"
        );
        Ok(CollectedFile { tree, registry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::FixtureScope;
    use crate::loader::FnModule;
    use trellis_core::TaskKind;

    #[test]
    fn test_collects_nested_declarations() {
        let module = FnModule::new(|s: &mut SuiteBuilder| {
            s.before_all(|_| async { Ok(()) });
            s.test("top", |_| async { Ok(()) });
            s.describe("math", |s| {
                s.before_each(|_| async { Ok(()) });
                s.test("adds", |_| async { Ok(()) });
                s.todo("divides");
            });
        });

        let file = Collector::collect("math.yaml", &module, None).unwrap();
        let tree = &file.tree;
        let tests = tree.tests();
        assert_eq!(tests.len(), 3);
        assert_eq!(tree.full_name(tests[1]), "math > adds");
        assert_eq!(tree[tests[2]].mode, TaskMode::Todo);
        assert!(file.registry.test(tests[0]).is_some());

        let suite = tree[tree.root()].children[1];
        assert_eq!(tree[suite].kind(), TaskKind::Suite);
        assert_eq!(file.registry.hooks(suite, HookKind::BeforeEach).len(), 1);
        assert_eq!(file.registry.hooks(tree.root(), HookKind::BeforeAll).len(), 1);
        assert!(tree[tests[0]]
            .location
            .as_ref()
            .unwrap()
            .file
            .ends_with("collector.rs"));
    }

    #[test]
    fn test_registration_panic_is_collection_error() {
        let module = FnModule::new(|s: &mut SuiteBuilder| {
            s.test("fine", |_| async { Ok(()) });
            panic!("syntax error on line 3");
        });
        let err = Collector::collect("broken.yaml", &module, None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("syntax error on line 3"));
    }

    #[test]
    fn test_fixture_cycle_rejected_before_running() {
        let module = FnModule::new(|s: &mut SuiteBuilder| {
            s.fixture(FixtureDef::value("a", FixtureScope::Test, 1u8).depends_on("b"));
            s.fixture(FixtureDef::value("b", FixtureScope::Test, 2u8).depends_on("a"));
            s.test_with("uses", TestOptions::new().uses("a"), |_| async { Ok(()) });
        });
        let err = Collector::collect("cycle.yaml", &module, None).err().unwrap();
        assert!(matches!(
            err,
            LoadError::Fixture(crate::error::FixtureError::Cycle(_))
        ));
    }

    #[test]
    fn test_unknown_fixture_request_rejected() {
        let module = FnModule::new(|s: &mut SuiteBuilder| {
            s.test_with("uses", TestOptions::new().uses("db"), |_| async { Ok(()) });
        });
        assert!(Collector::collect("nofix.yaml", &module, None).is_err());
    }

    #[test]
    fn test_configure_sets_file_options() {
        let module = FnModule::new(|s: &mut SuiteBuilder| {
            s.configure(SuiteOptions::new().concurrent().timeout(Duration::from_secs(1)));
            s.test("a", |_| async { Ok(()) });
        });
        let file = Collector::collect("opts.yaml", &module, None).unwrap();
        let root = file.tree.root();
        assert_eq!(file.tree[root].concurrent, Some(true));
        assert_eq!(file.tree[root].timeout, Some(Duration::from_secs(1)));
    }
}
