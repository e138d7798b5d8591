//! Local-directory drive backend
//!
//! Implements the `DriveClient` port on top of a plain directory. There is
//! no encryption and no network: this backend exists so the daemon can be
//! exercised end-to-end (and integration-tested) without credentials for
//! the real service, the same way a "local remote" ships in other sync
//! tools.
//!
//! Node uids are allocated sequentially and persisted in a JSON sidecar
//! (`.pdsync-nodes.json`) inside the backend root, so mappings stay valid
//! across daemon restarts. Trashed nodes live under `.trash/<uid>` until
//! deleted.

mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use pdsync_core::domain::newtypes::{ContentHash, NodeUid};
use pdsync_core::ports::auth_provider::{AuthError, AuthProvider};
use pdsync_core::ports::drive_client::{
    ByteStream, ChildPage, DriveClient, DriveError, FileMeta, NodeKind, RelocateRequest,
    RemoteNode, RevisionInfo,
};

use registry::Registry;

/// Sidecar file holding the uid registry.
const REGISTRY_FILE: &str = ".pdsync-nodes.json";

/// Directory trashed nodes are parked in.
const TRASH_DIR: &str = ".trash";

fn io_error(path: &Path, err: std::io::Error) -> DriveError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DriveError::NotFound(path.display().to_string())
    } else {
        DriveError::Network(format!("{}: {err}", path.display()))
    }
}

fn sha1_hex(data: &[u8]) -> ContentHash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    // 20 digest bytes always hex-encode to 40 valid characters.
    ContentHash::new(hex::encode(hasher.finalize())).expect("sha1 digest is valid hex")
}

/// Drive backend over a local directory.
pub struct LocalDirDrive {
    root: PathBuf,
    registry: Mutex<Registry>,
}

impl LocalDirDrive {
    /// Open (or initialize) a backend at `root`.
    pub async fn open(root: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        tokio::fs::create_dir_all(root.join(TRASH_DIR)).await?;
        let registry = Registry::load(&root.join(REGISTRY_FILE)).await?;
        Ok(Self {
            root: root.to_path_buf(),
            registry: Mutex::new(registry),
        })
    }

    fn abs(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    async fn persist(&self, registry: &Registry) {
        if let Err(e) = registry.save(&self.root.join(REGISTRY_FILE)).await {
            // The registry rebuilds lazily from disk on the next open, so
            // a failed save degrades mappings, not data.
            tracing::warn!(error = %e, "Failed to save node registry");
        }
    }
}

#[async_trait]
impl DriveClient for LocalDirDrive {
    async fn get_root_folder(&self) -> Result<NodeUid, DriveError> {
        let registry = self.registry.lock().await;
        Ok(registry.root_uid())
    }

    async fn iterate_children(
        &self,
        parent: &NodeUid,
        _cursor: Option<String>,
    ) -> Result<ChildPage, DriveError> {
        let mut registry = self.registry.lock().await;
        let parent_rel = registry
            .path_of(parent)
            .ok_or_else(|| DriveError::NotFound(parent.to_string()))?;
        let dir = self.abs(&parent_rel);

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        let mut nodes = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if parent_rel.is_empty() && (name == REGISTRY_FILE || name == TRASH_DIR) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let rel = if parent_rel.is_empty() {
                name.clone()
            } else {
                format!("{parent_rel}/{name}")
            };
            let uid = registry.uid_for(&rel);

            if metadata.is_dir() {
                nodes.push(RemoteNode {
                    uid,
                    name,
                    kind: NodeKind::Folder,
                    active_revision: None,
                });
            } else if metadata.is_file() {
                let data = tokio::fs::read(entry.path())
                    .await
                    .map_err(|e| io_error(&entry.path(), e))?;
                nodes.push(RemoteNode {
                    uid,
                    name,
                    kind: NodeKind::File,
                    active_revision: Some(RevisionInfo {
                        sha1: Some(sha1_hex(&data)),
                    }),
                });
            }
        }

        self.persist(&registry).await;
        // A directory listing fits in one page here.
        Ok(ChildPage { nodes, next: None })
    }

    async fn create_folder(
        &self,
        parent: &NodeUid,
        name: &str,
        _mtime_ms: Option<i64>,
    ) -> Result<NodeUid, DriveError> {
        let mut registry = self.registry.lock().await;
        let parent_rel = registry
            .path_of(parent)
            .ok_or_else(|| DriveError::NotFound(parent.to_string()))?;
        let rel = if parent_rel.is_empty() {
            name.to_string()
        } else {
            format!("{parent_rel}/{name}")
        };
        let path = self.abs(&rel);
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        let uid = registry.uid_for(&rel);
        self.persist(&registry).await;
        debug!(path = %path.display(), uid = %uid, "Created folder");
        Ok(uid)
    }

    async fn upload_file(
        &self,
        parent: &NodeUid,
        name: &str,
        meta: FileMeta,
        stream: ByteStream,
    ) -> Result<NodeUid, DriveError> {
        let mut registry = self.registry.lock().await;
        let parent_rel = registry
            .path_of(parent)
            .ok_or_else(|| DriveError::NotFound(parent.to_string()))?;
        let rel = if parent_rel.is_empty() {
            name.to_string()
        } else {
            format!("{parent_rel}/{name}")
        };
        let path = self.abs(&rel);

        write_verified(&path, meta, stream).await?;

        let uid = registry.uid_for(&rel);
        self.persist(&registry).await;
        debug!(path = %path.display(), uid = %uid, "Uploaded file");
        Ok(uid)
    }

    async fn upload_revision(
        &self,
        uid: &NodeUid,
        meta: FileMeta,
        stream: ByteStream,
    ) -> Result<NodeUid, DriveError> {
        let registry = self.registry.lock().await;
        let rel = registry
            .path_of(uid)
            .ok_or_else(|| DriveError::NotFound(uid.to_string()))?;
        let path = self.abs(&rel);
        if !path.is_file() {
            return Err(DriveError::NotFound(uid.to_string()));
        }

        write_verified(&path, meta, stream).await?;
        debug!(path = %path.display(), uid = %uid, "Uploaded revision");
        Ok(uid.clone())
    }

    async fn relocate(&self, uid: &NodeUid, request: RelocateRequest) -> Result<(), DriveError> {
        let mut registry = self.registry.lock().await;
        let old_rel = registry
            .path_of(uid)
            .ok_or_else(|| DriveError::NotFound(uid.to_string()))?;

        let parent_rel = match &request.new_parent {
            Some(parent) => registry
                .path_of(parent)
                .ok_or_else(|| DriveError::NotFound(parent.to_string()))?,
            None => match old_rel.rsplit_once('/') {
                Some((parent, _)) => parent.to_string(),
                None => String::new(),
            },
        };
        let name = match &request.new_name {
            Some(name) => name.clone(),
            None => old_rel.rsplit('/').next().unwrap_or(&old_rel).to_string(),
        };
        let new_rel = if parent_rel.is_empty() {
            name
        } else {
            format!("{parent_rel}/{name}")
        };

        let from = self.abs(&old_rel);
        let to = self.abs(&new_rel);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| io_error(&from, e))?;

        registry.relocate(&old_rel, &new_rel);
        self.persist(&registry).await;
        debug!(from = %from.display(), to = %to.display(), "Relocated node");
        Ok(())
    }

    async fn trash(&self, uids: &[NodeUid]) -> Vec<(NodeUid, Result<(), DriveError>)> {
        let mut registry = self.registry.lock().await;
        let mut results = Vec::with_capacity(uids.len());

        for uid in uids {
            let result = match registry.path_of(uid) {
                None => Err(DriveError::NotFound(uid.to_string())),
                Some(rel) if rel.starts_with(TRASH_DIR) => {
                    Err(DriveError::AlreadyTrashed(uid.to_string()))
                }
                Some(rel) => {
                    let parked = format!("{TRASH_DIR}/{uid}");
                    let from = self.abs(&rel);
                    let to = self.abs(&parked);
                    match tokio::fs::rename(&from, &to).await {
                        Ok(()) => {
                            registry.relocate(&rel, &parked);
                            Ok(())
                        }
                        Err(e) => Err(io_error(&from, e)),
                    }
                }
            };
            results.push((uid.clone(), result));
        }

        self.persist(&registry).await;
        results
    }

    async fn delete(&self, uids: &[NodeUid]) -> Vec<(NodeUid, Result<(), DriveError>)> {
        let mut registry = self.registry.lock().await;
        let mut results = Vec::with_capacity(uids.len());

        for uid in uids {
            let result = match registry.path_of(uid) {
                None => Err(DriveError::NotFound(uid.to_string())),
                Some(rel) => {
                    let path = self.abs(&rel);
                    let outcome = if path.is_dir() {
                        tokio::fs::remove_dir_all(&path).await
                    } else {
                        tokio::fs::remove_file(&path).await
                    };
                    match outcome {
                        Ok(()) => {
                            registry.remove_subtree(&rel);
                            Ok(())
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            registry.remove_subtree(&rel);
                            Ok(())
                        }
                        Err(e) => Err(io_error(&path, e)),
                    }
                }
            };
            results.push((uid.clone(), result));
        }

        self.persist(&registry).await;
        results
    }
}

/// Stream to a temp file, verify the declared SHA-1 if present, then
/// rename into place (atomic on the same filesystem).
async fn write_verified(path: &Path, meta: FileMeta, mut stream: ByteStream) -> Result<(), DriveError> {
    let mut data = Vec::with_capacity(meta.size as usize);
    stream
        .read_to_end(&mut data)
        .await
        .map_err(|e| DriveError::Network(format!("upload stream: {e}")))?;

    if let Some(expected) = &meta.sha1 {
        let actual = sha1_hex(&data);
        if &actual != expected {
            return Err(DriveError::IntegrityMismatch(format!(
                "declared {expected}, got {actual}"
            )));
        }
    }

    let tmp = {
        let mut p = path.as_os_str().to_owned();
        p.push(".partial");
        PathBuf::from(p)
    };
    tokio::fs::write(&tmp, &data)
        .await
        .map_err(|e| io_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| io_error(path, e))?;
    Ok(())
}

// ============================================================================
// Auth provider
// ============================================================================

/// Auth provider that "logs in" by opening the backend directory.
pub struct LocalDirAuthProvider {
    path: PathBuf,
}

impl LocalDirAuthProvider {
    /// Back the drive by `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl AuthProvider for LocalDirAuthProvider {
    async fn connect(&self) -> Result<Arc<dyn DriveClient>, AuthError> {
        let drive = LocalDirDrive::open(&self.path)
            .await
            .map_err(|e| AuthError::ConnectionFailed(format!("{e:#}")))?;
        Ok(Arc::new(drive))
    }
}

// ============================================================================
// Tests
// ============================================================================
