//! AtomWeave Error Types

use thiserror::Error;

/// Result type alias for AtomWeave operations
pub type Result<T> = std::result::Result<T, Error>;

/// AtomWeave error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Local store errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Atom not found: {0}")]
    AtomNotFound(String),

    #[error("Conflicting concurrent change to atom {atom_id}")]
    Conflict { atom_id: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Node {0} is unreachable")]
    Unreachable(String),

    #[error("Unexpected reply from {node}: expected {expected}")]
    UnexpectedReply { node: String, expected: &'static str },

    #[error("Peer {node} rejected request: {reason}")]
    Rejected { node: String, reason: String },

    #[error("Wire serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),

    // Lifecycle errors
    #[error("Invalid lifecycle transition: expected {expected}, store is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Startup failed: {0}")]
    Startup(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::Unreachable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("node-2".into()).is_retryable());
        assert!(Error::Unreachable("node-2".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::Conflict { atom_id: "a".into() }.is_retryable());
        assert!(!Error::UnexpectedReply { node: "n".into(), expected: "Ack" }.is_retryable());
    }
}
