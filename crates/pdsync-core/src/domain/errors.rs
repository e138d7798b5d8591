//! Domain error types
//!
//! Validation failures for domain newtypes and persisted representations.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid local path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid remote path format
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid node identifier
    #[error("Invalid node uid: {0}")]
    InvalidNodeUid(String),

    /// Invalid content hash (expected 40 hex characters)
    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    /// Invalid change token (expected "<mtime_ms>:<size>")
    #[error("Invalid change token: {0}")]
    InvalidChangeToken(String),

    /// Unknown persisted enum tag (event kind, job state, signal)
    #[error("Unknown {what} variant: {value}")]
    UnknownVariant {
        /// Which enum the tag belongs to
        what: &'static str,
        /// The offending stored value
        value: String,
    },

    /// Invalid state transition attempt
    #[error("Invalid job state transition from {from} to {to}")]
    InvalidTransition {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },
}
