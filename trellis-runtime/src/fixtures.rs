//! Scoped fixtures
//!
//! A fixture is a named value provider that tests (and other fixtures) ask
//! for by name. Definitions are registered at collection time and the whole
//! dependency graph is checked before any test runs. Values live in a
//! [`FixtureStore`] for their scope: a fresh store per test attempt, one per
//! file, and one per execution context for `worker` fixtures. Stores tear
//! down their values in reverse creation order.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use trellis_core::TestFailure;

use crate::error::FixtureError;

pub type FixtureValue = Arc<dyn Any + Send + Sync>;
pub type SetupFn =
    Arc<dyn Fn(FixtureSet) -> BoxFuture<'static, Result<FixtureValue, TestFailure>> + Send + Sync>;
pub type TeardownFn = Arc<dyn Fn(FixtureValue) -> BoxFuture<'static, ()> + Send + Sync>;

/// Lifetime of a fixture value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    /// Created before and torn down after each test attempt
    #[default]
    Test,
    /// Shared by all tests of one file
    File,
    /// Shared by every file an execution context runs, unless isolated
    Worker,
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureScope::Test => write!(f, "test"),
            FixtureScope::File => write!(f, "file"),
            FixtureScope::Worker => write!(f, "worker"),
        }
    }
}

/// Definition of one fixture
#[derive(Clone)]
pub struct FixtureDef {
    pub name: String,
    pub scope: FixtureScope,
    pub depends_on: Vec<String>,
    setup: SetupFn,
    teardown: Option<TeardownFn>,
}

impl FixtureDef {
    pub fn new<T, F, Fut>(name: impl Into<String>, scope: FixtureScope, setup: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(FixtureSet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TestFailure>> + Send + 'static,
    {
        let setup: SetupFn = Arc::new(move |deps| {
            setup(deps)
                .map(|result| result.map(|value| Arc::new(value) as FixtureValue))
                .boxed()
        });
        Self {
            name: name.into(),
            scope,
            depends_on: Vec::new(),
            setup,
            teardown: None,
        }
    }

    /// A fixture holding a constant value
    pub fn value<T>(name: impl Into<String>, scope: FixtureScope, value: T) -> Self
    where
        T: Any + Send + Sync + Clone,
    {
        Self::new(name, scope, move |_| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_teardown<T, F, Fut>(mut self, teardown: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let teardown = Arc::new(teardown);
        self.teardown = Some(Arc::new(move |value: FixtureValue| {
            let teardown = teardown.clone();
            async move {
                if let Ok(typed) = value.downcast::<T>() {
                    teardown(typed).await;
                }
            }
            .boxed()
        }));
        self
    }
}

impl fmt::Debug for FixtureDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDef")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Read-only view of resolved fixture values
#[derive(Clone, Default)]
pub struct FixtureSet {
    values: Arc<HashMap<String, FixtureValue>>,
}

impl FixtureSet {
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, FixtureError> {
        let value = self
            .values
            .get(name)
            .cloned()
            .ok_or_else(|| FixtureError::Missing(name.to_string()))?;
        value
            .downcast::<T>()
            .map_err(|_| FixtureError::WrongType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// All fixture definitions of a file
#[derive(Debug, Clone, Default)]
pub struct FixtureRegistry {
    defs: HashMap<String, FixtureDef>,
}

impl FixtureRegistry {
    pub fn register(&mut self, def: FixtureDef) -> Result<(), FixtureError> {
        if self.defs.contains_key(&def.name) {
            return Err(FixtureError::Duplicate(def.name));
        }
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FixtureDef> {
        self.defs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Check dependencies, scopes and cycles of the whole graph plus the
    /// fixtures each test asks for
    pub fn validate<'a>(
        &self,
        requests: impl IntoIterator<Item = (&'a str, &'a [String])>,
    ) -> Result<(), FixtureError> {
        let mut names: Vec<&String> = self.defs.keys().collect();
        names.sort();
        for name in names {
            self.resolution_order(std::slice::from_ref(name))?;
            let def = &self.defs[name];
            for dependency in &def.depends_on {
                let dep = self.defs.get(dependency).ok_or_else(|| FixtureError::Unknown {
                    fixture: dependency.clone(),
                    requested_by: def.name.clone(),
                })?;
                if dep.scope < def.scope {
                    return Err(FixtureError::ScopeMismatch {
                        fixture: def.name.clone(),
                        scope: def.scope,
                        dependency: dep.name.clone(),
                        dependency_scope: dep.scope,
                    });
                }
            }
        }

        for (task, requested) in requests {
            for name in requested {
                if !self.defs.contains_key(name) {
                    return Err(FixtureError::Unknown {
                        fixture: name.clone(),
                        requested_by: task.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Requested fixtures plus their transitive dependencies, dependencies first
    pub fn resolution_order(&self, requested: &[String]) -> Result<Vec<String>, FixtureError> {
        let mut order = Vec::new();
        let mut path = Vec::new();
        for name in requested {
            self.visit(name, "test", &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        requested_by: &str,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), FixtureError> {
        if order.iter().any(|done| done == name) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|p| p == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_string());
            return Err(FixtureError::Cycle(cycle));
        }
        let def = self.defs.get(name).ok_or_else(|| FixtureError::Unknown {
            fixture: name.to_string(),
            requested_by: requested_by.to_string(),
        })?;

        path.push(name.to_string());
        for dependency in &def.depends_on {
            self.visit(dependency, name, path, order)?;
        }
        path.pop();
        order.push(name.to_string());
        Ok(())
    }
}

/// Live values of one scope, torn down in reverse creation order
#[derive(Default)]
pub struct FixtureStore {
    created: Vec<(String, FixtureValue, Option<TeardownFn>)>,
}

impl FixtureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<FixtureValue> {
        self.created
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, value, _)| value.clone())
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Return the existing value or run the fixture's setup
    pub async fn get_or_setup(
        &mut self,
        def: &FixtureDef,
        resolved: &HashMap<String, FixtureValue>,
    ) -> Result<FixtureValue, TestFailure> {
        if let Some(value) = self.get(&def.name) {
            return Ok(value);
        }
        let deps = FixtureSet {
            values: Arc::new(resolved.clone()),
        };
        debug!(fixture = %def.name, scope = %def.scope, "Setting up fixture");
        let value = (def.setup)(deps).await?;
        self.created
            .push((def.name.clone(), value.clone(), def.teardown.clone()));
        Ok(value)
    }

    pub async fn teardown_all(&mut self) {
        while let Some((name, value, teardown)) = self.created.pop() {
            if let Some(teardown) = teardown {
                debug!(fixture = %name, "Tearing down fixture");
                teardown(value).await;
            }
        }
    }
}

/// Stores of the scopes above a single test
#[derive(Clone)]
pub struct SharedStores {
    pub file: Arc<tokio::sync::Mutex<FixtureStore>>,
    pub worker: Arc<tokio::sync::Mutex<FixtureStore>>,
}

impl SharedStores {
    pub fn new(worker: Arc<tokio::sync::Mutex<FixtureStore>>) -> Self {
        Self {
            file: Arc::new(tokio::sync::Mutex::new(FixtureStore::new())),
            worker,
        }
    }
}

/// Resolve `requested` for one test attempt; test-scoped values go to `test_store`
pub async fn resolve(
    registry: &FixtureRegistry,
    requested: &[String],
    stores: &SharedStores,
    test_store: &mut FixtureStore,
) -> Result<FixtureSet, TestFailure> {
    let order = registry
        .resolution_order(requested)
        .map_err(|e| TestFailure::new(e.to_string()))?;

    let mut resolved: HashMap<String, FixtureValue> = HashMap::new();
    for name in order {
        let def = registry
            .get(&name)
            .ok_or_else(|| TestFailure::new(FixtureError::Missing(name.clone()).to_string()))?;
        let value = match def.scope {
            FixtureScope::Test => test_store.get_or_setup(def, &resolved).await?,
            FixtureScope::File => stores.file.lock().await.get_or_setup(def, &resolved).await?,
            FixtureScope::Worker => {
                stores
                    .worker
                    .lock()
                    .await
                    .get_or_setup(def, &resolved)
                    .await?
            }
        };
        resolved.insert(name, value);
    }

    Ok(FixtureSet {
        values: Arc::new(resolved),
    })
}
