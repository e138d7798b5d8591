//! Authentication port (driven/secondary port)
//!
//! The login handshake and key decryption are external collaborators: the
//! engine only needs something that yields an authenticated
//! [`DriveClient`](super::drive_client::DriveClient). Connection failures
//! are distinguished so startup can retry them with backoff; every other
//! failure is fatal.

use std::sync::Arc;

use thiserror::Error;

use super::drive_client::DriveClient;

/// Failure to produce an authenticated client.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The backend could not be reached; startup retries with backoff
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials, key material or protocol failure; fatal to startup
    #[error("authentication failed: {0}")]
    Fatal(String),
}

/// Port trait for obtaining an authenticated drive client.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    /// Perform the login handshake and return a ready client.
    async fn connect(&self) -> Result<Arc<dyn DriveClient>, AuthError>;
}
