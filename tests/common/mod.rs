//! Shared helpers for orchestrator-level tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trellis_config::{PoolConfig, PoolKind, RunConfig};
use trellis_core::{TaskKind, TaskResult, UpdateKind};
use trellis_execution::{spawner_for, ChannelReporter, Orchestrator, ReporterEvent, RunSummary};
use trellis_runtime::ModuleLoader;

/// Ordered record of what test code observed
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }
}

/// Tracks how many bodies are in flight at once
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub fn config(kind: PoolKind) -> RunConfig {
    RunConfig {
        pool: PoolConfig {
            kind,
            max_workers: 2,
            heartbeat_interval: Duration::from_millis(25),
            grace_period: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub struct Outcome {
    pub summary: RunSummary,
    pub events: Vec<ReporterEvent>,
}

impl Outcome {
    /// Final result of the test whose full name is `name`
    pub fn result(&self, name: &str) -> Option<&TaskResult> {
        self.events.iter().rev().find_map(|event| match event {
            ReporterEvent::Task { task, update, .. }
                if task.kind == TaskKind::Test && task.name == name =>
            {
                match &update.kind {
                    UpdateKind::Finished { result } => Some(result),
                    _ => None,
                }
            }
            _ => None,
        })
    }

    /// Tests in the order their `Started` updates arrived
    pub fn started(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ReporterEvent::Task { task, update, .. }
                    if task.kind == TaskKind::Test
                        && matches!(update.kind, UpdateKind::Started { .. }) =>
                {
                    Some(task.name.clone())
                }
                _ => None,
            })
            .collect()
    }
}

pub async fn run(config: RunConfig, loader: impl ModuleLoader + 'static, files: &[&str]) -> Outcome {
    let loader: Arc<dyn ModuleLoader> = Arc::new(loader);
    let spawner = spawner_for(&config.pool, loader).unwrap();
    let (reporter, mut rx) = ChannelReporter::new();
    let summary = Orchestrator::new(config, spawner)
        .with_reporter(Arc::new(reporter))
        .run(files.iter().map(|f| f.to_string()).collect())
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    Outcome { summary, events }
}
