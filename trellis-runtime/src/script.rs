//! Scripted spec files
//!
//! A [`ScriptLoader`] turns a YAML document into an executable module, so
//! whole runs can be driven without a language-specific loader. A document is
//! the file-level suite:
//!
//! ```yaml
//! timeout: 2s
//! imports: [./clock]
//! fixtures:
//!   - { name: db, scope: file, value: { url: "mem://" } }
//! hooks:
//!   - { kind: before_each, steps: [{ log: setting up }] }
//! children:
//!   - test: { name: adds, steps: [pass] }
//!   - describe:
//!       name: nested
//!       concurrent: true
//!       children:
//!         - test: { name: slow, steps: [{ sleep: 50ms }] }
//!   - todo: later
//! ```
//!
//! Step words are `pass`, `hang` and `checkpoint`; step maps hold exactly one
//! of `log`, `error`, `sleep`, `block`, `fail`, `panic`, `fail_until_attempt`,
//! `inject`, `mock`, `fixture` or `import`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use trellis_core::{HookKind, RetryPolicy, SuiteOptions, TaskMode, TestFailure, TestOptions};
use trellis_ipc::{MockIntent, MockReplacement};

use crate::collector::SuiteBuilder;
use crate::context::TestContext;
use crate::error::LoadError;
use crate::fixtures::{FixtureDef, FixtureScope};
use crate::loader::{ExecutableModule, LoadRequest, ModuleLoader};

type Imports = Arc<BTreeMap<String, JsonValue>>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SuiteSpec {
    name: String,
    mode: Option<TaskMode>,
    concurrent: Option<bool>,
    sequential: bool,
    #[serde(with = "humantime_serde")]
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    imports: Vec<String>,
    fixtures: Vec<FixtureSpec>,
    hooks: Vec<HookSpec>,
    children: Vec<ChildSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TestSpec {
    name: String,
    mode: Option<TaskMode>,
    concurrent: Option<bool>,
    sequential: bool,
    #[serde(with = "humantime_serde")]
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    fails: bool,
    uses: Vec<String>,
    steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ChildSpec {
    test: Option<TestSpec>,
    describe: Option<SuiteSpec>,
    todo: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HookSpec {
    kind: HookKind,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureSpec {
    name: String,
    #[serde(default)]
    scope: FixtureScope,
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StepSpec {
    Word(String),
    Map(StepMap),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StepMap {
    log: Option<String>,
    error: Option<String>,
    #[serde(with = "humantime_serde")]
    sleep: Option<Duration>,
    #[serde(with = "humantime_serde")]
    block: Option<Duration>,
    fail: Option<String>,
    panic: Option<String>,
    fail_until_attempt: Option<u32>,
    inject: Option<ValueCheck>,
    mock: Option<String>,
    fixture: Option<ValueCheck>,
    import: Option<ValueCheck>,
}

/// Look something up by key and optionally compare it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueCheck {
    pub key: String,
    #[serde(default)]
    pub equals: Option<JsonValue>,
}

/// One executable instruction of a test or hook body
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Pass,
    /// Never completes
    Hang,
    /// Fail if the run is being cancelled
    Checkpoint,
    Log(String),
    Error(String),
    /// Asynchronous wait
    Sleep(Duration),
    /// Synchronous wait that holds the context's thread
    Block(Duration),
    Fail(String),
    Panic(String),
    /// Fail every attempt before the given one
    FailUntilAttempt(u32),
    Inject(ValueCheck),
    /// Require a mock intent for the specifier
    Mock(String),
    Fixture(ValueCheck),
    Import(ValueCheck),
}

impl TryFrom<&StepSpec> for Step {
    type Error = String;

    fn try_from(spec: &StepSpec) -> Result<Self, String> {
        let map = match spec {
            StepSpec::Word(word) => {
                return match word.as_str() {
                    "pass" => Ok(Step::Pass),
                    "hang" => Ok(Step::Hang),
                    "checkpoint" => Ok(Step::Checkpoint),
                    other => Err(format!("unknown step '{}'", other)),
                }
            }
            StepSpec::Map(map) => map.clone(),
        };

        let mut steps = Vec::new();
        steps.extend(map.log.map(Step::Log));
        steps.extend(map.error.map(Step::Error));
        steps.extend(map.sleep.map(Step::Sleep));
        steps.extend(map.block.map(Step::Block));
        steps.extend(map.fail.map(Step::Fail));
        steps.extend(map.panic.map(Step::Panic));
        steps.extend(map.fail_until_attempt.map(Step::FailUntilAttempt));
        steps.extend(map.inject.map(Step::Inject));
        steps.extend(map.mock.map(Step::Mock));
        steps.extend(map.fixture.map(Step::Fixture));
        steps.extend(map.import.map(Step::Import));

        match steps.len() {
            1 => Ok(steps.remove(0)),
            0 => Err("empty step".to_string()),
            n => Err(format!("a step holds exactly one instruction, found {}", n)),
        }
    }
}

fn compile(specs: &[StepSpec]) -> Result<Vec<Step>, String> {
    specs.iter().map(Step::try_from).collect()
}

/// A parsed spec file with its imports resolved
#[derive(Debug, Clone)]
pub struct ScriptModule {
    path: String,
    spec: SuiteSpec,
    imports: Imports,
}

impl ScriptModule {
    pub fn parse(path: &str, source: &str, mocks: &[MockIntent]) -> Result<Self, LoadError> {
        let spec: SuiteSpec = serde_yaml::from_str(source).map_err(|e| LoadError::Parse {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        let mut imports = BTreeMap::new();
        for specifier in &spec.imports {
            let value = match mocks.iter().find(|m| &m.specifier == specifier) {
                Some(intent) => match &intent.replacement {
                    MockReplacement::Value { value } => value.clone(),
                    MockReplacement::Module { path } => json!({ "module": path }),
                    MockReplacement::Automock => json!({ "automock": specifier }),
                },
                None => json!({ "module": specifier }),
            };
            imports.insert(specifier.clone(), value);
        }
        for intent in mocks {
            if !imports.contains_key(&intent.specifier) {
                debug!(file = %path, "Mock for '{}' matches no import", intent.specifier);
            }
        }

        Ok(Self {
            path: path.to_string(),
            spec,
            imports: Arc::new(imports),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Value bound to an import after mocks were applied
    pub fn import(&self, specifier: &str) -> Option<&JsonValue> {
        self.imports.get(specifier)
    }
}

impl ExecutableModule for ScriptModule {
    fn register(&self, suite: &mut SuiteBuilder) {
        suite.configure(suite_options(&self.spec));
        register_suite(suite, &self.spec, &self.imports);
    }
}

fn suite_options(spec: &SuiteSpec) -> SuiteOptions {
    SuiteOptions {
        mode: spec.mode.unwrap_or_default(),
        concurrent: spec.concurrent,
        sequential: spec.sequential,
        timeout: spec.timeout,
        retry: spec.retry,
        ..SuiteOptions::new()
    }
}

fn test_options(spec: &TestSpec) -> TestOptions {
    TestOptions {
        mode: spec.mode.unwrap_or_default(),
        concurrent: spec.concurrent,
        sequential: spec.sequential,
        timeout: spec.timeout,
        retry: spec.retry,
        fails: spec.fails,
        fixtures: spec.uses.clone(),
        ..TestOptions::new()
    }
}

fn register_suite(builder: &mut SuiteBuilder, spec: &SuiteSpec, imports: &Imports) {
    for fixture in &spec.fixtures {
        let mut def = FixtureDef::value(fixture.name.clone(), fixture.scope, fixture.value.clone());
        for dependency in &fixture.depends_on {
            def = def.depends_on(dependency.clone());
        }
        builder.fixture(def);
    }

    for hook in &spec.hooks {
        match compile(&hook.steps) {
            Ok(steps) => {
                builder.hook_with(hook.kind, hook.timeout, body(steps, imports.clone()));
            }
            Err(e) => {
                builder.invalid(format!("{} hook: {}", hook.kind, e));
            }
        }
    }

    for child in &spec.children {
        match (&child.test, &child.describe, &child.todo) {
            (Some(test), None, None) => match compile(&test.steps) {
                Ok(steps) => {
                    builder.test_with(test.name.clone(), test_options(test), body(steps, imports.clone()));
                }
                Err(e) => {
                    builder.invalid(format!("test '{}': {}", test.name, e));
                }
            },
            (None, Some(describe), None) => {
                builder.describe_with(describe.name.clone(), suite_options(describe), |nested| {
                    register_suite(nested, describe, imports)
                });
            }
            (None, None, Some(name)) => {
                builder.todo(name.clone());
            }
            _ => {
                builder.invalid("each child needs exactly one of test, describe or todo");
            }
        }
    }
}

fn body(
    steps: Vec<Step>,
    imports: Imports,
) -> impl Fn(TestContext) -> BoxFuture<'static, Result<(), TestFailure>> + Send + Sync + 'static {
    let steps = Arc::new(steps);
    move |ctx| run_steps(steps.clone(), imports.clone(), ctx).boxed()
}

async fn run_steps(steps: Arc<Vec<Step>>, imports: Imports, ctx: TestContext) -> Result<(), TestFailure> {
    for step in steps.iter() {
        match step {
            Step::Pass => {}
            Step::Hang => futures::future::pending::<()>().await,
            Step::Checkpoint => ctx.check_cancelled()?,
            Step::Log(line) => ctx.log(line.clone()),
            Step::Error(line) => ctx.error(line.clone()),
            Step::Sleep(duration) => tokio::time::sleep(*duration).await,
            Step::Block(duration) => std::thread::sleep(*duration),
            Step::Fail(message) => return Err(TestFailure::new(message.clone())),
            Step::Panic(message) => panic!("{}", message),
            Step::FailUntilAttempt(attempt) => {
                if ctx.attempt() < *attempt {
                    return Err(TestFailure::new(format!(
                        "attempt {} fails until attempt {}",
                        ctx.attempt(),
                        attempt
                    )));
                }
            }
            Step::Inject(check) => {
                let value = ctx.inject(&check.key).await?;
                compare(&check.key, check.equals.as_ref(), value.as_ref())?;
            }
            Step::Mock(specifier) => {
                if ctx.mock(specifier).is_none() {
                    return Err(TestFailure::new(format!("'{}' is not mocked", specifier)));
                }
            }
            Step::Fixture(check) => {
                let value = ctx.fixture::<JsonValue>(&check.key)?;
                compare(&check.key, check.equals.as_ref(), Some(&*value))?;
            }
            Step::Import(check) => {
                compare(&check.key, check.equals.as_ref(), imports.get(&check.key))?;
            }
        }
    }
    Ok(())
}

#[track_caller]
fn compare(key: &str, expected: Option<&JsonValue>, actual: Option<&JsonValue>) -> Result<(), TestFailure> {
    match (expected, actual) {
        (_, None) => Err(TestFailure::new(format!("no value for '{}'", key))),
        (None, Some(_)) => Ok(()),
        (Some(expected), Some(actual)) if expected == actual => Ok(()),
        (Some(expected), Some(actual)) => {
            Err(TestFailure::new(format!("unexpected value for '{}'", key)).with_diff(expected, actual))
        }
    }
}

/// Loads `*.yaml` spec files from disk
#[derive(Debug, Clone, Default)]
pub struct ScriptLoader {
    root: Option<PathBuf>,
}

impl ScriptLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) if Path::new(path).is_relative() => root.join(path),
            _ => PathBuf::from(path),
        }
    }
}

#[async_trait]
impl ModuleLoader for ScriptLoader {
    async fn load(&self, request: &LoadRequest) -> Result<Arc<dyn ExecutableModule>, LoadError> {
        let resolved = self.resolve(&request.path);
        let source = tokio::fs::read_to_string(&resolved).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(resolved.display().to_string())
            } else {
                LoadError::Io(e)
            }
        })?;
        debug!(file = %request.path, mocks = request.mocks.len(), "Loaded spec file");
        Ok(Arc::new(ScriptModule::parse(&request.path, &source, &request.mocks)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use trellis_core::TaskVariant;

    const SPEC: &str = r#"
timeout: 2s
imports: [./clock, ./db]
fixtures:
  - { name: config, scope: file, value: { retries: 3 } }
hooks:
  - { kind: before_all, timeout: 1s, steps: [{ log: booting }] }
children:
  - test:
      name: first
      uses: [config]
      steps: [pass, { fixture: { key: config, equals: { retries: 3 } } }]
  - describe:
      name: group
      concurrent: true
      retry: { count: 2, delay: 10ms }
      children:
        - test: { name: flaky, steps: [{ fail_until_attempt: 2 }] }
        - test: { name: skipped, mode: skip, steps: [hang] }
  - todo: later
"#;

    #[test]
    fn test_parse_builds_the_tree() {
        let module = ScriptModule::parse("suite.yaml", SPEC, &[]).unwrap();
        let file = Collector::collect("suite.yaml", &module, None).unwrap();
        let tree = &file.tree;

        let names: Vec<String> = tree.tests().into_iter().map(|n| tree.full_name(n)).collect();
        assert_eq!(names, vec!["first", "group > flaky", "group > skipped", "later"]);

        let root = tree.root();
        assert_eq!(tree[root].timeout, Some(Duration::from_secs(2)));
        assert_eq!(tree[root].hook_count(HookKind::BeforeAll), 1);

        let flaky = tree.tests()[1];
        assert_eq!(
            tree.effective_retry(flaky, RetryPolicy::default()),
            RetryPolicy::new(2, Duration::from_millis(10))
        );
        assert!(tree.effective_concurrent(flaky, false));

        let first = tree.tests()[0];
        match &tree[first].variant {
            TaskVariant::Test { fixtures, .. } => assert_eq!(fixtures, &vec!["config".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_step_words_and_maps() {
        let steps: Vec<StepSpec> =
            serde_yaml::from_str("[pass, hang, { sleep: 50ms }, { fail: nope }]").unwrap();
        assert_eq!(
            compile(&steps).unwrap(),
            vec![
                Step::Pass,
                Step::Hang,
                Step::Sleep(Duration::from_millis(50)),
                Step::Fail("nope".to_string())
            ]
        );

        let bad: Vec<StepSpec> = serde_yaml::from_str("[{ log: a, fail: b }]").unwrap();
        assert!(compile(&bad).is_err());
        let unknown: Vec<StepSpec> = serde_yaml::from_str("[explode]").unwrap();
        assert!(compile(&unknown).is_err());
    }

    #[test]
    fn test_bad_step_fails_collection() {
        let source = "children:\n  - test: { name: broken, steps: [teleport] }\n";
        let module = ScriptModule::parse("bad.yaml", source, &[]).unwrap();
        match Collector::collect("bad.yaml", &module, None) {
            Err(LoadError::Registration(message)) => assert!(message.contains("teleport")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unknown_field_is_a_parse_error() {
        let err = ScriptModule::parse("typo.yaml", "childs: []\n", &[]).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    fn test_mocks_replace_imports() {
        let mocks = vec![MockIntent {
            specifier: "./clock".to_string(),
            replacement: MockReplacement::Value { value: json!(1000) },
        }];
        let module = ScriptModule::parse("suite.yaml", SPEC, &mocks).unwrap();
        assert_eq!(module.import("./clock"), Some(&json!(1000)));
        assert_eq!(module.import("./db"), Some(&json!({ "module": "./db" })));
    }

    #[tokio::test]
    async fn test_loader_reads_from_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), SPEC).unwrap();
        let loader = ScriptLoader::with_root(dir.path());

        let module = loader.load(&LoadRequest::new("a.yaml")).await.unwrap();
        let file = Collector::collect("a.yaml", module.as_ref(), None).unwrap();
        assert_eq!(file.tree.tests().len(), 4);

        let missing = loader.load(&LoadRequest::new("nope.yaml")).await;
        assert!(matches!(missing, Err(LoadError::NotFound(_))));
    }
}
