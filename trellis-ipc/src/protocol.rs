//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use trellis_config::RunConfig;
use trellis_core::{CancelReason, SourceLocation, TaskError, TaskId, TaskTree, TaskUpdate};
use uuid::Uuid;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Replacement applied by the loader for a mocked module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MockReplacement {
    /// Replace every export with a fixed value
    Value { value: JsonValue },
    /// Load another module in place of the specifier
    Module { path: String },
    /// Let the loader generate a stub
    Automock,
}

/// A mock request, sent as data and applied inside the target context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockIntent {
    pub specifier: String,
    pub replacement: MockReplacement,
}

/// Files handed to one context in one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBatch {
    pub batch_id: Uuid,
    pub files: Vec<String>,
    #[serde(default)]
    pub mocks: Vec<MockIntent>,
}

impl FileBatch {
    pub fn new(files: Vec<String>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            files,
            mocks: Vec::new(),
        }
    }

    pub fn with_mocks(mut self, mocks: Vec<MockIntent>) -> Self {
        self.mocks = mocks;
        self
    }
}

/// Call-outs a context makes to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Failed tests across the whole run so far
    FailedTestCount,
    /// A value from the run's `provide` map
    Provided { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResult {
    Count { value: u32 },
    Value { value: Option<JsonValue> },
    Error { message: String },
}

/// Messages sent from the orchestrator to an execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextMessage {
    /// Run a batch of files
    Dispatch {
        batch: FileBatch,
        config: Box<RunConfig>,
        /// Run-wide failure count when the batch was handed out
        failed_tests: u32,
    },

    /// Stop starting new tests; in-flight tests finish their hooks
    Cancel { reason: CancelReason },

    /// Answer to a `CommandRequest`
    CommandResponse {
        correlation_id: Uuid,
        result: CommandResult,
    },

    /// Health check ping
    Ping { correlation_id: Uuid },

    /// Shutdown signal
    Shutdown,
}

/// Messages sent from an execution context to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    /// Context ready for work
    Ready { context_id: String, pid: u32 },

    /// A file was loaded and its task tree built
    Collected { batch_id: Uuid, tree: TaskTree },

    /// A file could not be loaded or registered
    CollectionFailed {
        batch_id: Uuid,
        filepath: String,
        error: TaskError,
    },

    /// State transition of one task
    TaskEvent { filepath: String, update: TaskUpdate },

    /// Captured output line
    Console { entry: ConsoleEntry },

    /// Synchronous call-out; answered by `CommandResponse`
    CommandRequest {
        correlation_id: Uuid,
        command: Command,
    },

    Heartbeat { status: ContextStatus },

    Pong {
        correlation_id: Uuid,
        status: ContextStatus,
    },

    /// Error that escaped user code outside of any running task
    UnhandledError {
        filepath: Option<String>,
        error: TaskError,
    },

    /// Every file of the batch reached a terminal state
    BatchFinished {
        batch_id: Uuid,
        memory_usage_mb: Option<u64>,
    },

    /// Context-level failure
    Error { error: ContextError },
}

impl OrchestratorMessage {
    /// Short label for logging
    pub fn label(&self) -> &'static str {
        match self {
            OrchestratorMessage::Ready { .. } => "ready",
            OrchestratorMessage::Collected { .. } => "collected",
            OrchestratorMessage::CollectionFailed { .. } => "collection_failed",
            OrchestratorMessage::TaskEvent { .. } => "task_event",
            OrchestratorMessage::Console { .. } => "console",
            OrchestratorMessage::CommandRequest { .. } => "command_request",
            OrchestratorMessage::Heartbeat { .. } => "heartbeat",
            OrchestratorMessage::Pong { .. } => "pong",
            OrchestratorMessage::UnhandledError { .. } => "unhandled_error",
            OrchestratorMessage::BatchFinished { .. } => "batch_finished",
            OrchestratorMessage::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// One captured log line with its origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub filepath: String,
    pub task_id: Option<TaskId>,
    pub stream: ConsoleStream,
    pub content: String,
    pub location: Option<SourceLocation>,
    pub timestamp: DateTime<Utc>,
}

/// Context status information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextStatus {
    pub context_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub files_run: u64,
    pub tests_failed: u64,
    /// Tests currently between `Started` and `Finished`
    #[serde(default)]
    pub running: Vec<TaskId>,
    pub memory_usage_mb: Option<u64>,
}

impl ContextStatus {
    pub fn new(context_id: String, pid: u32) -> Self {
        let now = Utc::now();
        Self {
            context_id,
            pid,
            started_at: now,
            last_activity: now,
            files_run: 0,
            tests_failed: 0,
            running: Vec::new(),
            memory_usage_mb: None,
        }
    }

    /// Update activity timestamp
    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn record_file(&mut self, failed_tests: u64) {
        self.files_run += 1;
        self.tests_failed += failed_tests;
        self.update_activity();
    }
}

/// Context-level error types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ContextError {
    /// Context initialization failed
    InitializationFailed { error: String },

    /// Communication error
    CommunicationError { error: String },

    /// A message could not be parsed
    MessageParseError { error: String },

    /// A dispatch arrived while another batch was still running
    Busy { batch_id: Uuid },
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::InitializationFailed { error } => {
                write!(f, "Context initialization failed: {}", error)
            }
            ContextError::CommunicationError { error } => {
                write!(f, "Communication error: {}", error)
            }
            ContextError::MessageParseError { error } => {
                write!(f, "Message parse error: {}", error)
            }
            ContextError::Busy { batch_id } => {
                write!(f, "Context busy with batch {}", batch_id)
            }
        }
    }
}

impl std::error::Error for ContextError {}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    /// Per-direction sequence number, strictly increasing
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(seq: u64, message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            seq,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
