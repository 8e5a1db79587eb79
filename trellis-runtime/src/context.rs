//! What test and hook bodies see of their execution context

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};
use trellis_core::{SourceLocation, TaskError, TaskId, TaskUpdate, TestFailure, UpdateKind};
use trellis_ipc::{
    Command, CommandResult, ConsoleEntry, ConsoleStream, IpcError, LinkSender, MockIntent,
    MockReplacement, OrchestratorMessage,
};
use trellis_resilience::timeout::panic_message;
use trellis_resilience::CancelToken;
use uuid::Uuid;

use crate::fixtures::FixtureSet;

/// Outbound side of a context: task events, console lines, errors
#[derive(Clone)]
pub struct EventEmitter {
    sender: LinkSender<OrchestratorMessage>,
    running: Arc<Mutex<BTreeSet<TaskId>>>,
}

impl EventEmitter {
    pub fn new(sender: LinkSender<OrchestratorMessage>) -> Self {
        Self {
            sender,
            running: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn send(&self, message: OrchestratorMessage) {
        if let Err(e) = self.sender.send(message) {
            debug!("Dropping outbound message: {}", e);
        }
    }

    /// Emit a task update, keeping the running set current
    pub fn task(&self, filepath: &str, update: TaskUpdate) {
        match &update.kind {
            UpdateKind::Started { .. } => {
                self.running.lock().insert(update.task_id.clone());
            }
            UpdateKind::Finished { .. } => {
                self.running.lock().remove(&update.task_id);
            }
            _ => {}
        }
        self.send(OrchestratorMessage::TaskEvent {
            filepath: filepath.to_string(),
            update,
        });
    }

    /// Tasks started but not yet finished
    pub fn running(&self) -> Vec<TaskId> {
        self.running.lock().iter().cloned().collect()
    }

    pub fn sender(&self) -> LinkSender<OrchestratorMessage> {
        self.sender.clone()
    }
}

/// Synchronous call-outs to the orchestrator
#[derive(Clone)]
pub struct CommandClient {
    sender: LinkSender<OrchestratorMessage>,
    pending: Arc<Mutex<HashMap<Uuid, oneshot::Sender<CommandResult>>>>,
}

impl CommandClient {
    pub fn new(sender: LinkSender<OrchestratorMessage>) -> Self {
        Self {
            sender,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send `command` and wait for the matching response
    pub async fn request(&self, command: Command) -> Result<CommandResult, IpcError> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);

        if let Err(e) = self.sender.send(OrchestratorMessage::CommandRequest {
            correlation_id,
            command,
        }) {
            self.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        rx.await.map_err(|_| IpcError::LinkClosed)
    }

    /// Hand a response to its waiter; false if nobody is waiting
    pub fn resolve(&self, correlation_id: Uuid, result: CommandResult) -> bool {
        match self.pending.lock().remove(&correlation_id) {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                warn!(%correlation_id, "Response for unknown command request");
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every outstanding request
    pub fn abandon_all(&self) {
        self.pending.lock().clear();
    }
}

/// Per-file environment shared by all task contexts of that file
pub struct FileEnv {
    pub filepath: String,
    pub emitter: EventEmitter,
    pub commands: CommandClient,
    pub cancel: CancelToken,
    pub mocks: Vec<MockIntent>,
}

/// Handle passed to every test, hook and fixture body
#[derive(Clone)]
pub struct TestContext {
    env: Arc<FileEnv>,
    task_id: TaskId,
    name: String,
    attempt: u32,
    fixtures: FixtureSet,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TestContext {
    pub fn new(env: Arc<FileEnv>, task_id: TaskId, name: impl Into<String>) -> Self {
        Self {
            env,
            task_id,
            name: name.into(),
            attempt: 1,
            fixtures: FixtureSet::default(),
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_fixtures(mut self, fixtures: FixtureSet) -> Self {
        self.fixtures = fixtures;
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-indexed attempt of the running test
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn filepath(&self) -> &str {
        &self.env.filepath
    }

    /// Write a captured stdout line attributed to this task
    #[track_caller]
    pub fn log(&self, content: impl Into<String>) {
        self.console(ConsoleStream::Stdout, content.into(), SourceLocation::caller());
    }

    /// Write a captured stderr line attributed to this task
    #[track_caller]
    pub fn error(&self, content: impl Into<String>) {
        self.console(ConsoleStream::Stderr, content.into(), SourceLocation::caller());
    }

    fn console(&self, stream: ConsoleStream, content: String, location: SourceLocation) {
        self.env.emitter.send(OrchestratorMessage::Console {
            entry: ConsoleEntry {
                filepath: self.env.filepath.clone(),
                task_id: Some(self.task_id.clone()),
                stream,
                content,
                location: Some(location),
                timestamp: Utc::now(),
            },
        });
    }

    /// A fixture value this test asked for
    #[track_caller]
    pub fn fixture<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, TestFailure> {
        let location = SourceLocation::caller();
        self.fixtures.get::<T>(name).map_err(|e| TestFailure {
            message: e.to_string(),
            diff: None,
            location: Some(location),
        })
    }

    /// Value the orchestrator provides under `key`
    pub async fn inject(&self, key: &str) -> Result<Option<JsonValue>, TestFailure> {
        let result = self
            .env
            .commands
            .request(Command::Provided {
                key: key.to_string(),
            })
            .await
            .map_err(|e| TestFailure::new(format!("inject({}) failed: {}", key, e)))?;
        match result {
            CommandResult::Value { value } => Ok(value),
            CommandResult::Error { message } => Err(TestFailure::new(message)),
            other => Err(TestFailure::new(format!(
                "unexpected response to inject({}): {:?}",
                key, other
            ))),
        }
    }

    /// Failed tests in the whole run so far
    pub async fn failed_test_count(&self) -> Result<u32, TestFailure> {
        match self.env.commands.request(Command::FailedTestCount).await {
            Ok(CommandResult::Count { value }) => Ok(value),
            Ok(CommandResult::Error { message }) => Err(TestFailure::new(message)),
            Ok(other) => Err(TestFailure::new(format!("unexpected response: {:?}", other))),
            Err(e) => Err(TestFailure::new(e.to_string())),
        }
    }

    /// Replacement registered for a module specifier in this batch
    pub fn mock(&self, specifier: &str) -> Option<&MockReplacement> {
        self.env
            .mocks
            .iter()
            .find(|m| m.specifier == specifier)
            .map(|m| &m.replacement)
    }

    pub fn is_cancelled(&self) -> bool {
        self.env.cancel.is_cancelled()
    }

    /// Run `future` in the background on behalf of this task
    ///
    /// A panic inside it fails the task when it has happened by the time the
    /// task's attempt ends. Later panics are reported against the file.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.background.lock().push(handle);
    }

    /// Collect panics of finished background work and hand the rest to a
    /// watcher that reports them as unhandled errors of the file
    pub(crate) fn settle_background(&self) -> Vec<TaskError> {
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        let mut errors = Vec::new();
        for handle in handles {
            if !handle.is_finished() {
                let env = self.env.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle.await {
                        if let Some(error) = background_error(e) {
                            warn!(file = %env.filepath, "{}", error.message);
                            env.emitter.send(OrchestratorMessage::UnhandledError {
                                filepath: Some(env.filepath.clone()),
                                error,
                            });
                        }
                    }
                });
                continue;
            }
            if let Some(Err(e)) = handle.now_or_never() {
                errors.extend(background_error(e));
            }
        }
        errors
    }

    /// Fail early when the run is being cancelled
    #[track_caller]
    pub fn check_cancelled(&self) -> Result<(), TestFailure> {
        match self.env.cancel.reason() {
            Some(reason) => Err(TestFailure::new(format!("run cancelled: {}", reason))),
            None => Ok(()),
        }
    }
}

fn background_error(error: JoinError) -> Option<TaskError> {
    error.is_panic().then(|| {
        TaskError::unhandled(format!(
            "Panic in background task: {}",
            panic_message(error.into_panic())
        ))
    })
}
