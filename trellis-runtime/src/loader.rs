//! Module loading seam
//!
//! Turning a source file into something runnable is the job of a
//! [`ModuleLoader`]. The execution context only asks for an
//! [`ExecutableModule`] and lets it register its suites and tests. Loaded
//! modules are kept in an explicit [`ModuleCache`] owned by the context;
//! it is cleared between files when isolation is requested.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use trellis_ipc::MockIntent;

use crate::collector::SuiteBuilder;
use crate::error::LoadError;

/// What a context asks its loader for
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub path: String,
    /// Replacements the loader applies while loading `path`
    pub mocks: Vec<MockIntent>,
}

impl LoadRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mocks: Vec::new(),
        }
    }

    pub fn with_mocks(mut self, mocks: Vec<MockIntent>) -> Self {
        self.mocks = mocks;
        self
    }
}

/// A loaded file that can declare its tasks
pub trait ExecutableModule: Send + Sync {
    fn register(&self, suite: &mut SuiteBuilder);
}

/// Loader of executable modules
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, request: &LoadRequest) -> Result<Arc<dyn ExecutableModule>, LoadError>;
}

/// A module defined by a registration closure
pub struct FnModule<F> {
    register: F,
}

impl<F> FnModule<F>
where
    F: Fn(&mut SuiteBuilder) + Send + Sync + 'static,
{
    pub fn new(register: F) -> Self {
        Self { register }
    }
}

impl<F> ExecutableModule for FnModule<F>
where
    F: Fn(&mut SuiteBuilder) + Send + Sync + 'static,
{
    fn register(&self, suite: &mut SuiteBuilder) {
        (self.register)(suite)
    }
}

/// Loader over a fixed path -> module table
#[derive(Default, Clone)]
pub struct StaticLoader {
    modules: HashMap<String, Arc<dyn ExecutableModule>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, path: impl Into<String>, module: Arc<dyn ExecutableModule>) -> Self {
        self.modules.insert(path.into(), module);
        self
    }

    /// Shorthand for a module built from a registration closure
    pub fn with_fn<F>(self, path: impl Into<String>, register: F) -> Self
    where
        F: Fn(&mut SuiteBuilder) + Send + Sync + 'static,
    {
        self.with_module(path, Arc::new(FnModule::new(register)))
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.modules.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl ModuleLoader for StaticLoader {
    async fn load(&self, request: &LoadRequest) -> Result<Arc<dyn ExecutableModule>, LoadError> {
        self.modules
            .get(&request.path)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(request.path.clone()))
    }
}

/// Per-context cache of loaded modules
#[derive(Clone, Default)]
pub struct ModuleCache {
    entries: Arc<Mutex<HashMap<String, Arc<dyn ExecutableModule>>>>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load through the cache; requests carrying mocks always hit the loader
    pub async fn get_or_load(
        &self,
        loader: &dyn ModuleLoader,
        request: &LoadRequest,
    ) -> Result<Arc<dyn ExecutableModule>, LoadError> {
        if request.mocks.is_empty() {
            if let Some(module) = self.entries.lock().get(&request.path).cloned() {
                debug!(path = %request.path, "Module cache hit");
                return Ok(module);
            }
        }

        let module = loader.load(request).await?;
        if request.mocks.is_empty() {
            self.entries
                .lock()
                .insert(request.path.clone(), module.clone());
        }
        Ok(module)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            debug!(modules = entries.len(), "Clearing module cache");
        }
        entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use trellis_ipc::MockReplacement;

    struct CountingLoader {
        inner: StaticLoader,
        loads: AtomicU32,
    }

    #[async_trait]
    impl ModuleLoader for CountingLoader {
        async fn load(
            &self,
            request: &LoadRequest,
        ) -> Result<Arc<dyn ExecutableModule>, LoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.load(request).await
        }
    }

    fn loader() -> CountingLoader {
        CountingLoader {
            inner: StaticLoader::new().with_fn("a.yaml", |s| {
                s.test("noop", |_| async { Ok(()) });
            }),
            loads: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn test_cache_reuses_until_cleared() {
        let loader = loader();
        let cache = ModuleCache::new();
        let request = LoadRequest::new("a.yaml");

        cache.get_or_load(&loader, &request).await.unwrap();
        cache.get_or_load(&loader, &request).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        cache.clear();
        assert!(cache.is_empty());
        cache.get_or_load(&loader, &request).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mocked_requests_bypass_cache() {
        let loader = loader();
        let cache = ModuleCache::new();
        let request = LoadRequest::new("a.yaml").with_mocks(vec![MockIntent {
            specifier: "./clock".to_string(),
            replacement: MockReplacement::Automock,
        }]);

        cache.get_or_load(&loader, &request).await.unwrap();
        cache.get_or_load(&loader, &request).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_missing_module() {
        let err = StaticLoader::new()
            .load(&LoadRequest::new("nope.yaml"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::NotFound(path) if path == "nope.yaml"));
    }
}
