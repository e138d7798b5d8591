//! Remote drive port (driven/secondary port)
//!
//! The capability set the processor needs from an end-to-end-encrypted
//! drive backend. The real client (HTTP transport, block encryption,
//! key management) lives outside this repository; tests use in-memory
//! implementations.
//!
//! ## Design Notes
//!
//! - Every operation returns a typed [`DriveError`] so the processor can
//!   classify failures at a single point per job. Adapters map transport
//!   errors into these variants and apply their own request timeouts
//!   (30 s for metadata calls, 60 s for content transfer), surfacing
//!   expiry as [`DriveError::Timeout`].
//! - `iterate_children` is paginated. When a caller searches a folder by
//!   name it must drain every page, so the adapter can mark its folder
//!   listing cache complete.
//! - Byte payloads are streamed via `AsyncRead` so large files never sit
//!   in memory whole.

use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncRead;

use crate::domain::newtypes::{ContentHash, NodeUid};

/// Boxed byte stream handed to upload operations.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

// ============================================================================
// Errors
// ============================================================================

/// Typed failure from a drive operation.
///
/// The processor maps these onto retry classes; adapters must pick the
/// most specific variant they can.
#[derive(Debug, Clone, Error)]
pub enum DriveError {
    /// Connection-level failure (reset, refused, DNS, 5xx)
    #[error("network error: {0}")]
    Network(String),

    /// The request exceeded the adapter's deadline
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The server asked us to back off (429)
    #[error("rate limited")]
    RateLimited {
        /// Server-provided wait hint, if any
        retry_after: Option<Duration>,
    },

    /// Uploaded content failed the server-side integrity check
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// The targeted revision is no longer the active one
    #[error("revision conflict: {0}")]
    RevisionConflict(String),

    /// The remote object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The object was already in the trash
    #[error("already trashed: {0}")]
    AlreadyTrashed(String),

    /// Content could not be decrypted with the available keys
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Any other definitive rejection (4xx)
    #[error("permanent failure (status {status}): {message}")]
    Permanent {
        /// HTTP-ish status code from the backend
        status: u16,
        /// Server-provided description
        message: String,
    },
}

// ============================================================================
// DTOs
// ============================================================================

/// Whether a remote node is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Regular file node
    File,
    /// Folder node
    Folder,
}

/// Metadata of a file node's active revision.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevisionInfo {
    /// SHA-1 of the revision's plaintext, absent for legacy files
    pub sha1: Option<ContentHash>,
}

/// One child entry from a folder listing.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    /// Stable identifier, survives relocates
    pub uid: NodeUid,
    /// Decrypted node name
    pub name: String,
    /// File or folder
    pub kind: NodeKind,
    /// Active revision metadata (files only)
    pub active_revision: Option<RevisionInfo>,
}

/// One page of a folder listing.
#[derive(Debug, Clone)]
pub struct ChildPage {
    /// Nodes on this page
    pub nodes: Vec<RemoteNode>,
    /// Opaque cursor for the next page; `None` on the last page
    pub next: Option<String>,
}

/// Metadata accompanying an upload.
#[derive(Debug, Clone)]
pub struct FileMeta {
    /// Plaintext size in bytes
    pub size: u64,
    /// Local modification time, epoch millis
    pub mtime_ms: i64,
    /// SHA-1 of the plaintext, when precomputed
    pub sha1: Option<ContentHash>,
}

/// Target of a relocate operation. At least one field must be set.
#[derive(Debug, Clone, Default)]
pub struct RelocateRequest {
    /// New parent folder; `None` keeps the current parent
    pub new_parent: Option<NodeUid>,
    /// New node name; `None` keeps the current name
    pub new_name: Option<String>,
}

// ============================================================================
// DriveClient trait
// ============================================================================

/// Port trait for remote drive operations.
///
/// All methods are idempotency-friendly: callers tolerate
/// [`DriveError::NotFound`] on deletes and [`DriveError::AlreadyTrashed`]
/// on trash operations.
#[async_trait::async_trait]
pub trait DriveClient: Send + Sync {
    /// Resolve the uid of the drive's root folder.
    async fn get_root_folder(&self) -> Result<NodeUid, DriveError>;

    /// List one page of a folder's children.
    ///
    /// Pass `cursor = None` for the first page. Callers searching by name
    /// MUST keep requesting pages until `next` is `None`.
    async fn iterate_children(
        &self,
        parent: &NodeUid,
        cursor: Option<String>,
    ) -> Result<ChildPage, DriveError>;

    /// Create a folder under `parent`; returns the new node's uid.
    async fn create_folder(
        &self,
        parent: &NodeUid,
        name: &str,
        mtime_ms: Option<i64>,
    ) -> Result<NodeUid, DriveError>;

    /// Upload a new file into `parent`; returns the new node's uid.
    async fn upload_file(
        &self,
        parent: &NodeUid,
        name: &str,
        meta: FileMeta,
        stream: ByteStream,
    ) -> Result<NodeUid, DriveError>;

    /// Upload a new revision of an existing file node.
    async fn upload_revision(
        &self,
        uid: &NodeUid,
        meta: FileMeta,
        stream: ByteStream,
    ) -> Result<NodeUid, DriveError>;

    /// Rename and/or reparent a node.
    async fn relocate(&self, uid: &NodeUid, request: RelocateRequest) -> Result<(), DriveError>;

    /// Move nodes to the trash; per-item results.
    async fn trash(&self, uids: &[NodeUid]) -> Vec<(NodeUid, Result<(), DriveError>)>;

    /// Permanently delete (trashed) nodes; per-item results.
    async fn delete(&self, uids: &[NodeUid]) -> Vec<(NodeUid, Result<(), DriveError>)>;
}
