//! Execution context spawning
//!
//! A [`ContextSpawner`] starts one execution context and returns a
//! [`ContextHandle`] once the context has announced itself with `Ready`.
//! Three isolation strategies are provided:
//!
//! * [`ProcessSpawner`] starts a worker process and speaks JSON lines over
//!   its stdin/stdout. Its stderr is re-emitted as debug logs.
//! * [`ThreadSpawner`] runs the context on a dedicated native thread with its
//!   own single-threaded runtime.
//! * [`SandboxSpawner`] runs the context as a task on the host runtime.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, warn};
use trellis_config::{PoolConfig, PoolKind, RunConfig};
use trellis_core::CancelReason;
use trellis_ipc::{
    attach_stream, duplex_pair, CommandResult, ContextMessage, FileBatch, IpcError,
    OrchestratorLink, OrchestratorMessage,
};
use trellis_runtime::{ExecutionContext, ModuleLoader};
use uuid::Uuid;

use crate::error::ExecutionError;

const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Starts execution contexts of one isolation strategy
#[async_trait]
pub trait ContextSpawner: Send + Sync {
    fn kind(&self) -> PoolKind;

    /// Start a context and wait until it is ready for work
    async fn spawn(&self, context_id: &str) -> Result<ContextHandle, ExecutionError>;
}

/// Pick the spawner matching `pool.kind`
///
/// Thread and sandboxed contexts load modules in this process through
/// `loader`; process contexts load them in the worker program.
pub fn spawner_for(
    pool: &PoolConfig,
    loader: Arc<dyn ModuleLoader>,
) -> Result<Arc<dyn ContextSpawner>, ExecutionError> {
    Ok(match pool.kind {
        PoolKind::Process => Arc::new(ProcessSpawner::from_config(pool)?),
        PoolKind::Thread => {
            Arc::new(ThreadSpawner::new(loader).with_heartbeat_interval(pool.heartbeat_interval))
        }
        PoolKind::Sandboxed => {
            Arc::new(SandboxSpawner::new(loader).with_heartbeat_interval(pool.heartbeat_interval))
        }
    })
}

enum ContextRuntime {
    Process(Child),
    Thread(std::thread::JoinHandle<()>),
    Task(tokio::task::JoinHandle<()>),
}

/// Orchestrator-side handle of one running execution context
pub struct ContextHandle {
    id: String,
    kind: PoolKind,
    pid: u32,
    link: OrchestratorLink,
    runtime: Option<ContextRuntime>,
}

impl ContextHandle {
    fn new(id: &str, kind: PoolKind, pid: u32, link: OrchestratorLink, runtime: ContextRuntime) -> Self {
        Self {
            id: id.to_string(),
            kind,
            pid,
            link,
            runtime: Some(runtime),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Process id reported by the context
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Hand a batch to the context; events arrive through [`recv`](Self::recv)
    pub fn dispatch(
        &self,
        batch: FileBatch,
        config: &RunConfig,
        failed_tests: u32,
    ) -> Result<(), ExecutionError> {
        debug!(context = %self.id, batch = %batch.batch_id, "Dispatching {:?}", batch.files);
        self.link.send(ContextMessage::Dispatch {
            batch,
            config: Box::new(config.clone()),
            failed_tests,
        })?;
        Ok(())
    }

    /// Ask the context to stop starting tests
    pub fn cancel(&self, reason: CancelReason) -> Result<(), ExecutionError> {
        self.link.send(ContextMessage::Cancel { reason })?;
        Ok(())
    }

    /// Answer a command request
    pub fn respond(&self, correlation_id: Uuid, result: CommandResult) -> Result<(), ExecutionError> {
        self.link.send(ContextMessage::CommandResponse {
            correlation_id,
            result,
        })?;
        Ok(())
    }

    pub fn ping(&self) -> Result<Uuid, ExecutionError> {
        let correlation_id = Uuid::new_v4();
        self.link.send(ContextMessage::Ping { correlation_id })?;
        Ok(correlation_id)
    }

    /// Next message from the context; `None` once its link is gone
    pub async fn recv(&mut self) -> Option<Result<OrchestratorMessage, IpcError>> {
        self.link.recv().await
    }

    /// Wait for `Ready`, terminating the context if it never comes
    async fn ready(mut self, timeout: Duration) -> Result<Self, ExecutionError> {
        let outcome = match tokio::time::timeout(timeout, self.link.recv()).await {
            Ok(Some(Ok(OrchestratorMessage::Ready { pid, .. }))) => {
                self.pid = pid;
                Ok(())
            }
            Ok(Some(Ok(other))) => Err(ExecutionError::UnexpectedMessage {
                context_id: self.id.clone(),
                message: other.label(),
            }),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Err(ExecutionError::NotReady(self.id.clone())),
            Err(_) => Err(ExecutionError::StartupTimeout {
                context_id: self.id.clone(),
                timeout,
            }),
        };

        match outcome {
            Ok(()) => {
                debug!(context = %self.id, pid = self.pid, "Execution context ready");
                Ok(self)
            }
            Err(e) => {
                self.terminate().await;
                Err(e)
            }
        }
    }

    /// Ask the context to exit, forcing it after `grace`
    pub async fn shutdown(mut self, grace: Duration) {
        debug!("Stopping execution context: {}", self.id);
        // The context may already be gone
        let _ = self.link.send(ContextMessage::Shutdown);

        match self.runtime.take() {
            Some(ContextRuntime::Process(mut child)) => {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!("Context {} exited: {}", self.id, status),
                    Ok(Err(e)) => debug!("Context {} wait failed: {}", self.id, e),
                    Err(_) => {
                        debug!("Context {} ignored shutdown, force killing", self.id);
                        if let Err(e) = child.kill().await {
                            debug!("Failed to kill context {}: {}", self.id, e);
                        }
                    }
                }
            }
            Some(ContextRuntime::Thread(thread)) => {
                let deadline = tokio::time::Instant::now() + grace;
                while !thread.is_finished() && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                if thread.is_finished() {
                    if thread.join().is_err() {
                        warn!("Thread context {} panicked", self.id);
                    }
                } else {
                    warn!("Thread context {} did not stop; abandoning it", self.id);
                }
            }
            Some(ContextRuntime::Task(mut task)) => {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    debug!("Sandboxed context {} ignored shutdown, aborting", self.id);
                    task.abort();
                }
            }
            None => {}
        }
    }

    /// Stop the context now
    ///
    /// Processes are killed and tasks aborted. A native thread cannot be
    /// killed: it is abandoned, and exits once it notices its link is gone.
    pub async fn terminate(mut self) {
        match self.runtime.take() {
            Some(ContextRuntime::Process(mut child)) => {
                debug!("Killing process context {}", self.id);
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill context {}: {}", self.id, e);
                }
            }
            Some(ContextRuntime::Thread(_)) => {
                warn!("Abandoning thread context {}", self.id);
            }
            Some(ContextRuntime::Task(task)) => {
                debug!("Aborting sandboxed context {}", self.id);
                task.abort();
            }
            None => {}
        }
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        // Processes are spawned with kill_on_drop
        if let Some(ContextRuntime::Task(task)) = &self.runtime {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .finish()
    }
}

/// Spawns worker processes
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    ready_timeout: Duration,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ready_timeout: READY_TIMEOUT,
        }
    }

    /// Arguments placed before `--worker-id <id>`
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Use `pool.worker_program`, falling back to the current executable
    pub fn from_config(pool: &PoolConfig) -> Result<Self, ExecutionError> {
        let program = match &pool.worker_program {
            Some(program) => PathBuf::from(program),
            None => std::env::current_exe().map_err(|e| {
                ExecutionError::ConfigurationError(format!("cannot locate current executable: {}", e))
            })?,
        };
        Ok(Self::new(program).with_args(pool.worker_args.clone()))
    }
}

#[async_trait]
impl ContextSpawner for ProcessSpawner {
    fn kind(&self) -> PoolKind {
        PoolKind::Process
    }

    async fn spawn(&self, context_id: &str) -> Result<ContextHandle, ExecutionError> {
        debug!("Spawning process context {}: {:?}", context_id, self.program);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--worker-id")
            .arg(context_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::spawn(context_id, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::spawn(context_id, "stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::spawn(context_id, "stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(context_id.to_string(), stderr));
        }

        let link: OrchestratorLink = attach_stream(stdout, stdin);
        let pid = child.id().unwrap_or(0);
        ContextHandle::new(context_id, PoolKind::Process, pid, link, ContextRuntime::Process(child))
            .ready(self.ready_timeout)
            .await
    }
}

/// Re-emit a worker's stderr as debug logs tagged with its id
async fn forward_stderr(context_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(context = %context_id, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("Failed to read stderr of context {}: {}", context_id, e);
                break;
            }
        }
    }
}

/// Runs contexts on dedicated native threads
#[derive(Clone)]
pub struct ThreadSpawner {
    loader: Arc<dyn ModuleLoader>,
    heartbeat_interval: Duration,
    ready_timeout: Duration,
}

impl ThreadSpawner {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            heartbeat_interval: Duration::from_secs(1),
            ready_timeout: READY_TIMEOUT,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[async_trait]
impl ContextSpawner for ThreadSpawner {
    fn kind(&self) -> PoolKind {
        PoolKind::Thread
    }

    async fn spawn(&self, context_id: &str) -> Result<ContextHandle, ExecutionError> {
        let (orchestrator_end, context_end) = duplex_pair::<ContextMessage, OrchestratorMessage>();
        let context = ExecutionContext::new(context_id.to_string(), self.loader.clone())
            .with_heartbeat_interval(self.heartbeat_interval);
        let thread_id = context_id.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("trellis-{}", context_id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to build runtime for context {}: {}", thread_id, e);
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(context.run(context_end)) {
                    warn!("Thread context {} stopped: {}", thread_id, e);
                }
            })
            .map_err(|e| ExecutionError::spawn(context_id, e))?;

        ContextHandle::new(
            context_id,
            PoolKind::Thread,
            std::process::id(),
            orchestrator_end,
            ContextRuntime::Thread(thread),
        )
        .ready(self.ready_timeout)
        .await
    }
}

/// Runs contexts as tasks on the host runtime
#[derive(Clone)]
pub struct SandboxSpawner {
    loader: Arc<dyn ModuleLoader>,
    heartbeat_interval: Duration,
}

impl SandboxSpawner {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            heartbeat_interval: Duration::from_secs(1),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[async_trait]
impl ContextSpawner for SandboxSpawner {
    fn kind(&self) -> PoolKind {
        PoolKind::Sandboxed
    }

    async fn spawn(&self, context_id: &str) -> Result<ContextHandle, ExecutionError> {
        let (orchestrator_end, context_end) = duplex_pair::<ContextMessage, OrchestratorMessage>();
        let context = ExecutionContext::new(context_id.to_string(), self.loader.clone())
            .with_heartbeat_interval(self.heartbeat_interval);
        let task_id = context_id.to_string();

        let task = tokio::spawn(async move {
            if let Err(e) = context.run(context_end).await {
                warn!("Sandboxed context {} stopped: {}", task_id, e);
            }
        });

        ContextHandle::new(
            context_id,
            PoolKind::Sandboxed,
            std::process::id(),
            orchestrator_end,
            ContextRuntime::Task(task),
        )
        .ready(READY_TIMEOUT)
        .await
    }
}
