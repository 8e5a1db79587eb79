//! IPC error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Cannot encode message: {0}")]
    Encode(String),

    /// A line that is not a valid envelope
    #[error("Malformed message line: {0}")]
    Malformed(String),

    #[error("Link I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// End of stream
    #[error("Link closed")]
    LinkClosed,

    #[error("Peer speaks protocol v{actual}, expected v{expected}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Message {actual} arrived after message {previous}")]
    OutOfOrder { previous: u64, actual: u64 },

    /// The receiving half was dropped
    #[error("Peer is gone")]
    PeerGone,
}

impl IpcError {
    /// Whether the link is unusable after this error
    ///
    /// Only a local encoding failure leaves the link intact; anything the
    /// peer sends that cannot be decoded means its stream is corrupt.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IpcError::Encode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_encoding_failures_are_recoverable() {
        assert!(IpcError::Malformed("not json".to_string()).is_fatal());
        assert!(!IpcError::Encode("map key".to_string()).is_fatal());
        assert!(IpcError::VersionMismatch { expected: 1, actual: 2 }.is_fatal());
        assert!(IpcError::OutOfOrder { previous: 3, actual: 3 }.is_fatal());
        assert!(IpcError::LinkClosed.is_fatal());
    }
}
