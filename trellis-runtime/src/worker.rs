//! Execution context service loop
//!
//! An [`ExecutionContext`] sits on one end of a [`ContextLink`]. It announces
//! itself with `Ready`, then serves the orchestrator until `Shutdown` or until
//! the link closes: at most one batch runs at a time, while cancellation,
//! command responses and pings are handled concurrently with it. Heartbeats
//! carry the set of running tasks so the orchestrator can detect a wedged
//! context.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use regex::Regex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use trellis_config::RunConfig;
use trellis_core::TaskError;
use trellis_ipc::{
    ContextError, ContextLink, ContextMessage, ContextStatus, FileBatch, OrchestratorMessage,
    StdioTransport,
};
use trellis_resilience::timeout::panic_message;
use trellis_resilience::CancellationController;
use uuid::Uuid;

use crate::collector::Collector;
use crate::context::{CommandClient, EventEmitter, FileEnv};
use crate::error::{LoadError, RuntimeError};
use crate::fixtures::FixtureStore;
use crate::loader::{LoadRequest, ModuleCache, ModuleLoader};
use crate::runner::{FileRunner, RunSettings};

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

/// Process context entry point: serve the orchestrator over stdin/stdout
pub async fn worker_main(context_id: String, loader: Arc<dyn ModuleLoader>) -> Result<(), RuntimeError> {
    info!("Starting execution context: {}", context_id);

    let link: ContextLink = StdioTransport::attach()?;
    ExecutionContext::new(context_id.clone(), loader).run(link).await?;

    info!("Execution context {} shutting down", context_id);
    Ok(())
}

/// State that outlives individual batches
struct Inner {
    context_id: String,
    loader: Arc<dyn ModuleLoader>,
    cache: ModuleCache,
    worker_fixtures: Arc<tokio::sync::Mutex<FixtureStore>>,
    status: Mutex<ContextStatus>,
}

struct ActiveBatch {
    batch_id: Uuid,
    controller: CancellationController,
    future: BoxFuture<'static, ()>,
}

pub struct ExecutionContext {
    inner: Arc<Inner>,
    heartbeat_interval: Duration,
}

impl ExecutionContext {
    pub fn new(context_id: String, loader: Arc<dyn ModuleLoader>) -> Self {
        let status = ContextStatus::new(context_id.clone(), std::process::id());
        Self {
            inner: Arc::new(Inner {
                context_id,
                loader,
                cache: ModuleCache::default(),
                worker_fixtures: Arc::new(tokio::sync::Mutex::new(FixtureStore::new())),
                status: Mutex::new(status),
            }),
            heartbeat_interval: DEFAULT_HEARTBEAT,
        }
    }

    /// Interval used until a dispatch brings its own configuration
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn context_id(&self) -> &str {
        &self.inner.context_id
    }

    /// Module cache shared by every file this context runs
    pub fn cache(&self) -> &ModuleCache {
        &self.inner.cache
    }

    /// Serve `link` until shutdown or disconnect
    pub async fn run(self, mut link: ContextLink) -> Result<(), RuntimeError> {
        let sender = link.sender();
        let emitter = EventEmitter::new(sender.clone());
        let commands = CommandClient::new(sender.clone());

        sender.send(OrchestratorMessage::Ready {
            context_id: self.inner.context_id.clone(),
            pid: std::process::id(),
        })?;

        let mut current: Option<ActiveBatch> = None;
        let mut heartbeat = heartbeat_timer(self.heartbeat_interval);

        loop {
            tokio::select! {
                message = link.recv() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!("Bad message from orchestrator: {}", e);
                            emitter.send(OrchestratorMessage::Error {
                                error: ContextError::MessageParseError { error: e.to_string() },
                            });
                            if e.is_fatal() {
                                break;
                            }
                            continue;
                        }
                        None => {
                            info!("Orchestrator link closed");
                            break;
                        }
                    };
                    self.inner.status.lock().update_activity();

                    match message {
                        ContextMessage::Dispatch { batch, config, failed_tests } => {
                            if let Some(active) = &current {
                                warn!(busy_with = %active.batch_id, "Rejecting dispatch of batch {}", batch.batch_id);
                                emitter.send(OrchestratorMessage::Error {
                                    error: ContextError::Busy { batch_id: batch.batch_id },
                                });
                                continue;
                            }
                            heartbeat = heartbeat_timer(config.pool.heartbeat_interval);
                            let controller = CancellationController::with_base_failures(
                                config.execution.bail_threshold(),
                                config.pool.grace_period,
                                failed_tests,
                            );
                            debug!(batch = %batch.batch_id, files = batch.files.len(), "Batch dispatched");
                            current = Some(ActiveBatch {
                                batch_id: batch.batch_id,
                                controller: controller.clone(),
                                future: run_batch(
                                    self.inner.clone(),
                                    batch,
                                    *config,
                                    controller,
                                    emitter.clone(),
                                    commands.clone(),
                                )
                                .boxed(),
                            });
                        }
                        ContextMessage::Cancel { reason } => match &current {
                            Some(active) => {
                                if active.controller.cancel(reason.clone()) {
                                    info!("Batch {} cancelled: {}", active.batch_id, reason);
                                }
                            }
                            None => debug!("Cancel with no batch running"),
                        },
                        ContextMessage::CommandResponse { correlation_id, result } => {
                            commands.resolve(correlation_id, result);
                        }
                        ContextMessage::Ping { correlation_id } => {
                            let status = self.status(&emitter);
                            emitter.send(OrchestratorMessage::Pong { correlation_id, status });
                        }
                        ContextMessage::Shutdown => {
                            info!("Received shutdown signal");
                            break;
                        }
                    }
                }
                _ = drive(&mut current), if current.is_some() => {
                    current = None;
                }
                _ = heartbeat.tick() => {
                    let status = self.status(&emitter);
                    emitter.send(OrchestratorMessage::Heartbeat { status });
                }
            }
        }

        commands.abandon_all();
        self.inner.worker_fixtures.lock().await.teardown_all().await;
        Ok(())
    }

    fn status(&self, emitter: &EventEmitter) -> ContextStatus {
        let mut status = self.inner.status.lock().clone();
        status.running = emitter.running();
        status.memory_usage_mb = current_memory_mb();
        status
    }
}

fn heartbeat_timer(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval(period.max(Duration::from_millis(10)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn drive(current: &mut Option<ActiveBatch>) {
    match current {
        Some(active) => (&mut active.future).await,
        None => futures::future::pending().await,
    }
}

/// Collect and run every file of one batch, in order
async fn run_batch(
    inner: Arc<Inner>,
    batch: FileBatch,
    config: RunConfig,
    controller: CancellationController,
    emitter: EventEmitter,
    commands: CommandClient,
) {
    let pattern = config
        .execution
        .test_name_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| LoadError::Pattern(e).to_string());
    let settings = RunSettings::from_config(&config);

    for filepath in &batch.files {
        let collected = match &pattern {
            Ok(pattern) => collect(&inner, filepath, &batch, pattern.as_ref()).await,
            Err(message) => Err(message.clone()),
        };
        let file = match collected {
            Ok(file) => file,
            Err(message) => {
                warn!(file = %filepath, "Collection failed: {}", message);
                emitter.send(OrchestratorMessage::CollectionFailed {
                    batch_id: batch.batch_id,
                    filepath: filepath.clone(),
                    error: TaskError::collection(message),
                });
                inner.status.lock().record_file(0);
                continue;
            }
        };
        emitter.send(OrchestratorMessage::Collected {
            batch_id: batch.batch_id,
            tree: file.tree.clone(),
        });

        let env = Arc::new(FileEnv {
            filepath: filepath.clone(),
            emitter: emitter.clone(),
            commands: commands.clone(),
            cancel: controller.token(),
            mocks: batch.mocks.clone(),
        });
        let runner = FileRunner::new(
            file,
            env,
            settings.clone(),
            controller.clone(),
            inner.worker_fixtures.clone(),
        );

        controller.unit_started();
        let failed = match AssertUnwindSafe(runner.run()).catch_unwind().await {
            Ok(outcome) => outcome.failed,
            Err(payload) => {
                let message = panic_message(payload);
                error!(file = %filepath, "Panic outside of any task: {}", message);
                emitter.send(OrchestratorMessage::UnhandledError {
                    filepath: Some(filepath.clone()),
                    error: TaskError::unhandled(message),
                });
                runner.tree().state_counts().failed as u32
            }
        };
        controller.unit_finished();
        inner.status.lock().record_file(u64::from(failed));

        if config.pool.isolate {
            inner.cache.clear();
            inner.worker_fixtures.lock().await.teardown_all().await;
        }
    }

    emitter.send(OrchestratorMessage::BatchFinished {
        batch_id: batch.batch_id,
        memory_usage_mb: current_memory_mb(),
    });
}

async fn collect(
    inner: &Inner,
    filepath: &str,
    batch: &FileBatch,
    pattern: Option<&Regex>,
) -> Result<crate::collector::CollectedFile, String> {
    let request = LoadRequest::new(filepath).with_mocks(batch.mocks.clone());
    let module = inner
        .cache
        .get_or_load(inner.loader.as_ref(), &request)
        .await
        .map_err(|e| e.to_string())?;
    Collector::collect(filepath, module.as_ref(), pattern).map_err(|e| e.to_string())
}

/// Resident memory of this process in MiB
pub fn current_memory_mb() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|p| p.memory() / (1024 * 1024))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticLoader;
    use trellis_core::{CancelReason, TaskId, TaskState, TestFailure, UpdateKind};
    use trellis_ipc::{duplex_pair, Command, CommandResult, OrchestratorLink};

    fn loader() -> Arc<dyn ModuleLoader> {
        Arc::new(
            StaticLoader::new()
                .with_fn("ok.yaml", |s| {
                    s.test("passes", |_| async { Ok(()) });
                })
                .with_fn("slow.yaml", |s| {
                    for name in ["first", "second", "third"] {
                        s.test(name, |_| async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(())
                        });
                    }
                })
                .with_fn("inject.yaml", |s| {
                    s.test("reads provided value", |ctx| async move {
                        match ctx.inject("answer").await? {
                            Some(value) if value == serde_json::json!(42) => Ok(()),
                            other => Err(TestFailure::new(format!("got {:?}", other))),
                        }
                    });
                }),
        )
    }

    fn start() -> (OrchestratorLink, tokio::task::JoinHandle<Result<(), RuntimeError>>) {
        let (orchestrator, context) = duplex_pair::<ContextMessage, OrchestratorMessage>();
        let ctx = ExecutionContext::new("ctx-1".to_string(), loader())
            .with_heartbeat_interval(Duration::from_secs(60));
        let handle = tokio::spawn(ctx.run(context));
        (orchestrator, handle)
    }

    fn dispatch(files: &[&str]) -> ContextMessage {
        ContextMessage::Dispatch {
            batch: FileBatch::new(files.iter().map(|f| f.to_string()).collect()),
            config: Box::new(RunConfig::default()),
            failed_tests: 0,
        }
    }

    async fn next(link: &mut OrchestratorLink) -> OrchestratorMessage {
        loop {
            match link.recv().await.unwrap().unwrap() {
                OrchestratorMessage::Heartbeat { .. } => continue,
                message => return message,
            }
        }
    }

    /// Read until the batch finishes, returning everything seen
    async fn until_finished(link: &mut OrchestratorLink) -> Vec<OrchestratorMessage> {
        let mut seen = Vec::new();
        loop {
            let message = next(link).await;
            let done = matches!(message, OrchestratorMessage::BatchFinished { .. });
            seen.push(message);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_ready_dispatch_and_shutdown() {
        let (mut link, handle) = start();
        assert!(matches!(next(&mut link).await, OrchestratorMessage::Ready { .. }));

        link.send(dispatch(&["ok.yaml"])).unwrap();
        let seen = until_finished(&mut link).await;
        assert!(matches!(seen[0], OrchestratorMessage::Collected { .. }));
        let passed = seen.iter().any(|m| {
            matches!(m, OrchestratorMessage::TaskEvent { update, .. }
                if matches!(&update.kind, UpdateKind::Finished { result } if result.state == TaskState::Passed))
        });
        assert!(passed);

        link.send(ContextMessage::Shutdown).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_collection_failure() {
        let (mut link, _handle) = start();
        next(&mut link).await;

        link.send(dispatch(&["missing.yaml", "ok.yaml"])).unwrap();
        let seen = until_finished(&mut link).await;
        match &seen[0] {
            OrchestratorMessage::CollectionFailed { filepath, error, .. } => {
                assert_eq!(filepath, "missing.yaml");
                assert_eq!(error.kind, trellis_core::ErrorKind::Collection);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(seen[1], OrchestratorMessage::Collected { .. }));
    }

    #[tokio::test]
    async fn test_second_dispatch_is_rejected_while_busy() {
        let (mut link, _handle) = start();
        next(&mut link).await;

        link.send(dispatch(&["slow.yaml"])).unwrap();
        link.send(dispatch(&["ok.yaml"])).unwrap();

        let seen = until_finished(&mut link).await;
        assert!(seen.iter().any(|m| matches!(
            m,
            OrchestratorMessage::Error { error: ContextError::Busy { .. } }
        )));
    }

    #[tokio::test]
    async fn test_cancel_skips_unstarted_tests() {
        let (mut link, _handle) = start();
        next(&mut link).await;

        link.send(dispatch(&["slow.yaml"])).unwrap();
        // first test started
        loop {
            if let OrchestratorMessage::TaskEvent { update, .. } = next(&mut link).await {
                if matches!(update.kind, UpdateKind::Started { .. }) && update.task_id != TaskId::for_file("slow.yaml") {
                    break;
                }
            }
        }
        link.send(ContextMessage::Cancel { reason: CancelReason::Operator }).unwrap();

        let seen = until_finished(&mut link).await;
        let states: Vec<TaskState> = seen
            .iter()
            .filter_map(|m| match m {
                OrchestratorMessage::TaskEvent { update, .. } => match &update.kind {
                    UpdateKind::Finished { result } => Some(result.state),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(states.iter().filter(|s| **s == TaskState::Passed).count(), 1);
        assert_eq!(states.iter().filter(|s| **s == TaskState::Skipped).count(), 2);
    }

    #[tokio::test]
    async fn test_command_round_trip_and_ping() {
        let (mut link, _handle) = start();
        next(&mut link).await;

        let correlation_id = Uuid::new_v4();
        link.send(ContextMessage::Ping { correlation_id }).unwrap();
        match next(&mut link).await {
            OrchestratorMessage::Pong { correlation_id: id, status } => {
                assert_eq!(id, correlation_id);
                assert_eq!(status.context_id, "ctx-1");
            }
            other => panic!("unexpected {:?}", other),
        }

        link.send(dispatch(&["inject.yaml"])).unwrap();
        let mut passed = false;
        loop {
            match next(&mut link).await {
                OrchestratorMessage::CommandRequest { correlation_id, command } => {
                    assert_eq!(command, Command::Provided { key: "answer".to_string() });
                    link.send(ContextMessage::CommandResponse {
                        correlation_id,
                        result: CommandResult::Value { value: Some(serde_json::json!(42)) },
                    })
                    .unwrap();
                }
                OrchestratorMessage::TaskEvent { update, .. } => {
                    if let UpdateKind::Finished { result } = &update.kind {
                        passed |= result.state == TaskState::Passed && update.task_id != TaskId::for_file("inject.yaml");
                    }
                }
                OrchestratorMessage::BatchFinished { .. } => break,
                _ => {}
            }
        }
        assert!(passed);
    }
}
