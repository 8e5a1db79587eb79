//! Inter-context communication for Trellis
//!
//! This crate provides the message protocol exchanged between the
//! orchestrator and its execution contexts, the versioned envelope wrapped
//! around every message, and the transports that carry them: JSON lines over
//! a byte stream for process contexts and in-memory channels for thread and
//! sandboxed contexts.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    Command, CommandResult, ConsoleEntry, ConsoleStream, ContextError, ContextMessage,
    ContextStatus, FileBatch, MessageEnvelope, MockIntent, MockReplacement, OrchestratorMessage,
    IPC_PROTOCOL_VERSION,
};
pub use transport::{
    attach_stream, duplex_pair, ContextLink, Duplex, JsonLinesReader, JsonLinesWriter,
    LineFramer, LinkSender, OrchestratorLink, StdioTransport,
};
