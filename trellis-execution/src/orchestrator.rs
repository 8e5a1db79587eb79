//! Run orchestration
//!
//! An [`Orchestrator`] drives one run. Files wait in a shared queue and a
//! fixed number of pool slots take them one at a time, each slot keeping at
//! most one execution context alive. While a file runs, its slot mirrors
//! every event into the [`ResultAggregator`], answers command requests and
//! watches the context:
//!
//! * a context that has been silent for a few heartbeats while one of its
//!   tests is past its deadline gets a synthesised timeout for that test;
//! * a context silent for longer than the longest running deadline plus the
//!   grace period is killed, everything pending on it is failed as
//!   `terminated`, and the crash policy decides whether it is replaced.
//!
//! Bail and operator cancellation go through the run's
//! [`CancellationController`]: slots stop taking files, running contexts are
//! asked to cancel, and contexts still busy when the grace period ends are
//! force-terminated.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use trellis_config::{CrashPolicy, PoolKind, RunConfig};
use trellis_core::{CancelReason, TaskError, TaskKind, TaskUpdate};
use trellis_ipc::{Command, CommandResult, FileBatch, OrchestratorMessage};
use trellis_resilience::{BackoffCalculator, CancelSignal, CancellationController};

use crate::aggregator::{ResultAggregator, RunSummary};
use crate::error::ExecutionError;
use crate::reporter::{Reporter, ReporterEvent, Reporters, TaskInfo};
use crate::spawner::{ContextHandle, ContextSpawner};

const WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// Heartbeats a context may miss before it counts as silent
const MISSED_HEARTBEATS: u32 = 3;

/// Operator-side cancellation of a running orchestrator
#[derive(Clone)]
pub struct CancelHandle {
    controller: CancellationController,
}

impl CancelHandle {
    /// Stop scheduling; returns false if the run was already cancelled
    pub fn cancel(&self) -> bool {
        self.controller.cancel(CancelReason::Operator)
    }

    pub fn is_cancelled(&self) -> bool {
        self.controller.is_cancelled()
    }
}

/// Runs a set of files across a pool of execution contexts
pub struct Orchestrator {
    config: Arc<RunConfig>,
    spawner: Arc<dyn ContextSpawner>,
    reporters: Reporters,
    controller: CancellationController,
}

impl Orchestrator {
    /// The configuration is frozen for the lifetime of the orchestrator
    pub fn new(config: RunConfig, spawner: Arc<dyn ContextSpawner>) -> Self {
        let controller = CancellationController::new(
            config.execution.bail_threshold(),
            config.pool.grace_period,
        );
        Self {
            config: Arc::new(config),
            spawner,
            reporters: Reporters::new(),
            controller,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            controller: self.controller.clone(),
        }
    }

    /// Run `files` to completion and summarise the outcome
    pub async fn run(&self, files: Vec<String>) -> Result<RunSummary, ExecutionError> {
        if files.is_empty() {
            return Err(ExecutionError::NoTestFiles);
        }
        self.config.validate_all()?;

        let started = Instant::now();
        let pool = &self.config.pool;
        let workers = pool.effective_workers().min(files.len());
        info!(
            "Running {} files on {} {:?} contexts",
            files.len(),
            workers,
            self.spawner.kind()
        );
        if pool.memory_limit_mb.is_some() && self.spawner.kind() != PoolKind::Process {
            warn!("pool.memory_limit_mb only applies to process contexts");
        }

        let state = Arc::new(RunState {
            config: self.config.clone(),
            spawner: self.spawner.clone(),
            reporters: self.reporters.clone(),
            controller: self.controller.clone(),
            aggregator: Mutex::new(ResultAggregator::new(&files, &self.config.execution)),
            queue: Mutex::new(files.iter().cloned().collect()),
            restarts: AtomicU32::new(0),
            backoff: BackoffCalculator::from_config(&pool.restart_backoff),
        });
        state.report(ReporterEvent::RunStarted {
            files: files.clone(),
            workers,
            pool: self.spawner.kind(),
        });

        // Force-terminate contexts that outlive the grace period after a cancel
        let escalation = {
            let controller = self.controller.clone();
            let mut token = controller.token();
            tokio::spawn(async move {
                let reason = token.cancelled().await;
                debug!("Escalation armed: {}", reason);
                if let Err(e) = controller.escalate().await {
                    warn!("Cancellation did not drain: {}", e);
                }
            })
        };

        let slots = (0..workers).map(|index| tokio::spawn(Slot::new(index, state.clone()).run()));
        for (index, result) in join_all(slots).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!("Pool slot {} failed: {}", index, e);
            }
        }
        escalation.abort();

        let leftover: Vec<String> = state.queue.lock().drain(..).collect();
        let cancelled = self.controller.reason();
        for filepath in leftover {
            match &cancelled {
                Some(reason) => {
                    debug!("{} not run: {}", filepath, reason);
                    state.aggregator.lock().not_run(&filepath);
                }
                None => {
                    let error = TaskError::terminated("No execution context left to run this file");
                    state.aggregator.lock().fail_unrun(&filepath, error.clone());
                    state.report(ReporterEvent::Error {
                        filepath: Some(filepath),
                        error,
                    });
                }
            }
        }

        let summary = state.aggregator.lock().summary(
            started.elapsed(),
            cancelled,
            state.restarts.load(Ordering::SeqCst),
        );
        info!(
            "Run finished in {}ms: {} passed, {} failed, {} skipped",
            summary.duration_ms, summary.counts.passed, summary.counts.failed, summary.counts.skipped
        );
        state.report(ReporterEvent::RunFinished {
            summary: summary.clone(),
        });
        Ok(summary)
    }
}

/// State shared by every slot of one run
struct RunState {
    config: Arc<RunConfig>,
    spawner: Arc<dyn ContextSpawner>,
    reporters: Reporters,
    controller: CancellationController,
    aggregator: Mutex<ResultAggregator>,
    queue: Mutex<VecDeque<String>>,
    restarts: AtomicU32,
    backoff: BackoffCalculator,
}

impl RunState {
    fn report(&self, event: ReporterEvent) {
        self.reporters.on_event(&event);
    }

    fn next_file(&self) -> Option<String> {
        self.queue.lock().pop_front()
    }

    fn count_failures(&self, count: u32) {
        if let Some(reason) = self.controller.record_failures(count) {
            warn!("Stopping run: {}", reason);
        }
    }

    /// Report finished tasks produced on this side of the link
    fn report_finished(&self, filepath: &str, updates: Vec<(TaskInfo, TaskUpdate)>) {
        let failed = updates
            .iter()
            .filter(|(task, _)| task.kind == TaskKind::Test)
            .count() as u32;
        for (task, update) in updates {
            self.report(ReporterEvent::Task {
                filepath: filepath.to_string(),
                task,
                update,
            });
        }
        self.count_failures(failed);
    }

    /// Fail whatever `filepath` still had pending
    fn terminate_file(&self, filepath: &str, error: TaskError) {
        let had_tree = self.aggregator.lock().tree(filepath).is_some();
        let updates = self.aggregator.lock().terminate_file(filepath, error.clone());
        if !had_tree {
            self.report(ReporterEvent::Error {
                filepath: Some(filepath.to_string()),
                error,
            });
        }
        self.report_finished(filepath, updates);
    }

    /// Deadline after which a silent context is considered hung
    fn hang_limit(&self, filepath: &str) -> Duration {
        let execution = &self.config.execution;
        let longest = self.aggregator.lock().longest_timeout(filepath);
        longest.max(execution.hook_timeout) + self.config.pool.grace_period
    }

    fn answer(&self, command: &Command) -> CommandResult {
        match command {
            Command::FailedTestCount => CommandResult::Count {
                value: self.controller.failed_count(),
            },
            Command::Provided { key } => CommandResult::Value {
                value: self.config.provide.get(key).cloned(),
            },
        }
    }

    fn handle_message(&self, context: &ContextHandle, message: OrchestratorMessage) {
        match message {
            OrchestratorMessage::Collected { tree, .. } => {
                let filepath = tree.filepath().to_string();
                debug!(context = context.id(), "Collected {} ({} tasks)", filepath, tree.len());
                self.aggregator.lock().collected(tree.clone());
                self.report(ReporterEvent::FileCollected { filepath, tree });
            }
            OrchestratorMessage::CollectionFailed { filepath, error, .. } => {
                warn!("Collection of {} failed: {}", filepath, error.message);
                self.aggregator.lock().file_error(&filepath, error.clone());
                self.report(ReporterEvent::Error {
                    filepath: Some(filepath),
                    error,
                });
            }
            OrchestratorMessage::TaskEvent { filepath, update } => {
                let applied = self.aggregator.lock().apply_update(&filepath, &update);
                if let Some(applied) = applied {
                    if applied.failed {
                        self.count_failures(1);
                    }
                    self.report(ReporterEvent::Task {
                        filepath,
                        task: applied.task,
                        update,
                    });
                }
            }
            OrchestratorMessage::Console { entry } => {
                self.report(ReporterEvent::Console { entry });
            }
            OrchestratorMessage::CommandRequest {
                correlation_id,
                command,
            } => {
                let result = self.answer(&command);
                if let Err(e) = context.respond(correlation_id, result) {
                    debug!("Command response to {} not delivered: {}", context.id(), e);
                }
            }
            OrchestratorMessage::UnhandledError { filepath, error } => {
                warn!("Unhandled error in {}: {}", context.id(), error.message);
                self.aggregator.lock().unhandled(filepath.as_deref(), error.clone());
                self.report(ReporterEvent::Error { filepath, error });
            }
            OrchestratorMessage::Heartbeat { status } | OrchestratorMessage::Pong { status, .. } => {
                debug!(
                    context = context.id(),
                    running = status.running.len(),
                    memory_mb = ?status.memory_usage_mb,
                    "Context alive"
                );
            }
            OrchestratorMessage::Error { error } => {
                warn!("Execution context {} reported: {}", context.id(), error);
            }
            OrchestratorMessage::Ready { .. } | OrchestratorMessage::BatchFinished { .. } => {
                debug!("Unexpected {} from {}", message.label(), context.id());
            }
        }
    }
}

/// How one file ended on its context
#[derive(Debug)]
enum FileRun {
    Finished { memory_mb: Option<u64> },
    /// Link failure or a hung context
    Crashed(String),
    /// Killed by escalation after a cancel
    Forced,
}

/// One place in the pool
struct Slot {
    index: usize,
    generation: u32,
    state: Arc<RunState>,
    context: Option<ContextHandle>,
    signals: broadcast::Receiver<CancelSignal>,
    restart_delay: Option<Duration>,
}

impl Slot {
    fn new(index: usize, state: Arc<RunState>) -> Self {
        let signals = state.controller.subscribe();
        Self {
            index,
            generation: 0,
            state,
            context: None,
            signals,
            restart_delay: None,
        }
    }

    async fn run(mut self) {
        let grace = self.state.config.pool.grace_period;

        loop {
            if self.state.controller.is_cancelled() {
                break;
            }
            let Some(filepath) = self.state.next_file() else {
                break;
            };

            if let Err(e) = self.ensure_context().await {
                error!("Slot {} could not start a context: {}", self.index, e);
                self.state.terminate_file(
                    &filepath,
                    TaskError::terminated(format!("Failed to start execution context: {}", e)),
                );
                if self.after_crash() {
                    continue;
                }
                break;
            }

            self.state.controller.unit_started();
            let outcome = self.run_file(&filepath).await;

            let keep_going = match outcome {
                FileRun::Finished { memory_mb } => {
                    self.state.aggregator.lock().file_finished(&filepath);
                    if self.should_retire(memory_mb) {
                        if let Some(context) = self.context.take() {
                            context.shutdown(grace).await;
                        }
                    }
                    true
                }
                FileRun::Crashed(reason) => {
                    let context_id = self.context_id();
                    warn!("Execution context {} failed running {}: {}", context_id, filepath, reason);
                    self.state.report(ReporterEvent::ContextCrashed {
                        context_id,
                        filepath: filepath.clone(),
                        reason: reason.clone(),
                    });
                    self.state.terminate_file(
                        &filepath,
                        TaskError::terminated(format!("Execution context terminated: {}", reason)),
                    );
                    if let Some(context) = self.context.take() {
                        context.terminate().await;
                    }
                    self.after_crash()
                }
                FileRun::Forced => {
                    warn!("Force-terminating context {} after cancellation", self.context_id());
                    self.state.terminate_file(
                        &filepath,
                        TaskError::terminated("Execution context force-terminated after cancellation"),
                    );
                    if let Some(context) = self.context.take() {
                        context.terminate().await;
                    }
                    false
                }
            };
            self.state.controller.unit_finished();

            if !keep_going {
                break;
            }
        }

        if let Some(context) = self.context.take() {
            context.shutdown(grace).await;
        }
        debug!("Pool slot {} done", self.index);
    }

    fn context_id(&self) -> String {
        self.context
            .as_ref()
            .map(|c| c.id().to_string())
            .unwrap_or_else(|| format!("context-{}-{}", self.index, self.generation))
    }

    async fn ensure_context(&mut self) -> Result<(), ExecutionError> {
        if self.context.is_some() {
            return Ok(());
        }
        if let Some(delay) = self.restart_delay.take() {
            debug!("Slot {} waiting {}ms before replacing its context", self.index, delay.as_millis());
            tokio::time::sleep(delay).await;
        }
        self.generation += 1;
        let context_id = format!("context-{}-{}", self.index, self.generation);
        self.context = Some(self.state.spawner.spawn(&context_id).await?);
        Ok(())
    }

    /// Apply the crash policy; returns whether the slot keeps going
    fn after_crash(&mut self) -> bool {
        let pool = &self.state.config.pool;
        match pool.crash_policy {
            CrashPolicy::FailRemaining => {
                info!("Slot {} closed after a context failure", self.index);
                false
            }
            CrashPolicy::Restart => {
                let max = pool.max_restarts;
                match self
                    .state
                    .restarts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
                {
                    Ok(previous) => {
                        self.restart_delay = Some(self.state.backoff.calculate_delay(previous + 1));
                        true
                    }
                    Err(_) => {
                        error!("Context restart budget of {} exhausted", max);
                        self.state
                            .controller
                            .cancel(CancelReason::RestartBudgetExhausted);
                        false
                    }
                }
            }
        }
    }

    fn should_retire(&self, memory_mb: Option<u64>) -> bool {
        let pool = &self.state.config.pool;
        let kind = self.state.spawner.kind();
        if pool.isolate && kind != PoolKind::Sandboxed {
            return true;
        }
        match (pool.memory_limit_mb, memory_mb) {
            (Some(limit), Some(used)) if kind == PoolKind::Process && used > limit => {
                info!(
                    "Retiring context {}: {} MiB used, limit {} MiB",
                    self.context_id(),
                    used,
                    limit
                );
                true
            }
            _ => false,
        }
    }

    async fn run_file(&mut self, filepath: &str) -> FileRun {
        let state = self.state.clone();
        let signals = &mut self.signals;
        let Some(context) = self.context.as_mut() else {
            return FileRun::Crashed("no execution context".to_string());
        };

        let batch = FileBatch::new(vec![filepath.to_string()]);
        if let Err(e) = context.dispatch(batch, &state.config, state.controller.failed_count()) {
            return FileRun::Crashed(e.to_string());
        }
        state.aggregator.lock().file_dispatched(filepath, context.id());

        let heartbeat = state.config.pool.heartbeat_interval;
        let silent_after = heartbeat.saturating_mul(MISSED_HEARTBEATS);
        let mut watchdog = tokio::time::interval(heartbeat.min(WATCHDOG_TICK));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();
        let mut signals_open = true;

        loop {
            tokio::select! {
                message = context.recv() => {
                    last_seen = Instant::now();
                    match message {
                        Some(Ok(OrchestratorMessage::BatchFinished { memory_usage_mb, .. })) => {
                            return FileRun::Finished { memory_mb: memory_usage_mb };
                        }
                        Some(Ok(message)) => state.handle_message(context, message),
                        Some(Err(e)) if e.is_fatal() => {
                            return FileRun::Crashed(format!("unusable link: {}", e));
                        }
                        Some(Err(e)) => warn!("Bad message from {}: {}", context.id(), e),
                        None => return FileRun::Crashed("link closed".to_string()),
                    }
                }
                signal = signals.recv(), if signals_open => match signal {
                    Ok(CancelSignal::Cooperative(reason)) => {
                        debug!("Cancelling {} on {}: {}", filepath, context.id(), reason);
                        if let Err(e) = context.cancel(reason) {
                            debug!("Cancel not delivered to {}: {}", context.id(), e);
                        }
                    }
                    Ok(CancelSignal::Forced) => return FileRun::Forced,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Slot missed {} cancel signals", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => signals_open = false,
                },
                _ = watchdog.tick() => {
                    let silent = last_seen.elapsed();
                    if silent < silent_after {
                        continue;
                    }
                    let synthesized = state
                        .aggregator
                        .lock()
                        .synthesize_timeouts(filepath, Instant::now());
                    for (task, _) in &synthesized {
                        warn!("{} timed out while {} was unresponsive", task.name, context.id());
                    }
                    state.report_finished(filepath, synthesized);

                    let limit = state.hang_limit(filepath);
                    if silent >= limit {
                        return FileRun::Crashed(format!(
                            "no response for {}ms",
                            silent.as_millis()
                        ));
                    }
                }
            }
        }
    }
}
