//! In-memory drive backend for integration tests.
//!
//! Models the remote as a flat uid-keyed node table with parent links,
//! supports scripted per-operation failures, and paginates folder listings
//! in small pages so by-name searches exercise the full-drain requirement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use pdsync_core::domain::newtypes::{ContentHash, NodeUid};
use pdsync_core::ports::auth_provider::{AuthError, AuthProvider};
use pdsync_core::ports::drive_client::{
    ByteStream, ChildPage, DriveClient, DriveError, FileMeta, NodeKind, RelocateRequest,
    RemoteNode, RevisionInfo,
};
use pdsync_engine::hash::sha1_of_bytes;

const PAGE_SIZE: usize = 2;
const ROOT_UID: &str = "root";

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<String>,
    kind: NodeKind,
    data: Vec<u8>,
    sha1: Option<ContentHash>,
    trashed: bool,
}

#[derive(Default)]
struct Failures {
    queued: HashMap<&'static str, VecDeque<DriveError>>,
}

/// Scriptable in-memory drive.
pub struct MockDrive {
    nodes: Mutex<HashMap<String, Node>>,
    next_uid: AtomicU64,
    failures: Mutex<Failures>,
    uploads: AtomicU64,
}

impl MockDrive {
    pub fn new() -> Arc<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_UID.to_string(),
            Node {
                name: String::new(),
                parent: None,
                kind: NodeKind::Folder,
                data: Vec::new(),
                sha1: None,
                trashed: false,
            },
        );
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            next_uid: AtomicU64::new(1),
            failures: Mutex::new(Failures::default()),
            uploads: AtomicU64::new(0),
        })
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: &'static str, err: DriveError) {
        self.failures
            .lock()
            .unwrap()
            .queued
            .entry(op)
            .or_default()
            .push_back(err);
    }

    fn take_failure(&self, op: &'static str) -> Option<DriveError> {
        self.failures
            .lock()
            .unwrap()
            .queued
            .get_mut(op)
            .and_then(VecDeque::pop_front)
    }

    fn alloc_uid(&self) -> String {
        format!("node-{}", self.next_uid.fetch_add(1, Ordering::SeqCst))
    }

    /// Total uploads (new files plus revisions) performed so far.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Walk a remote path like `/backup/docs/a.txt` to its uid.
    pub fn uid_of_path(&self, path: &str) -> Option<String> {
        let nodes = self.nodes.lock().unwrap();
        let mut current = ROOT_UID.to_string();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child = nodes.iter().find(|(_, n)| {
                n.parent.as_deref() == Some(current.as_str()) && n.name == segment && !n.trashed
            })?;
            current = child.0.clone();
        }
        Some(current)
    }

    /// Plaintext bytes of a file node.
    pub fn content_of(&self, uid: &str) -> Option<Vec<u8>> {
        self.nodes.lock().unwrap().get(uid).map(|n| n.data.clone())
    }

    /// Number of live (non-trashed) nodes, root excluded.
    pub fn live_node_count(&self) -> usize {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| !n.trashed && n.parent.is_some())
            .count()
    }
}

async fn read_stream(mut stream: ByteStream) -> Result<Vec<u8>, DriveError> {
    let mut data = Vec::new();
    stream
        .read_to_end(&mut data)
        .await
        .map_err(|e| DriveError::Network(format!("stream read failed: {e}")))?;
    Ok(data)
}

#[async_trait]
impl DriveClient for MockDrive {
    async fn get_root_folder(&self) -> Result<NodeUid, DriveError> {
        if let Some(err) = self.take_failure("get_root_folder") {
            return Err(err);
        }
        Ok(NodeUid::new(ROOT_UID.to_string()).unwrap())
    }

    async fn iterate_children(
        &self,
        parent: &NodeUid,
        cursor: Option<String>,
    ) -> Result<ChildPage, DriveError> {
        if let Some(err) = self.take_failure("iterate_children") {
            return Err(err);
        }
        let nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(parent.as_str()) {
            return Err(DriveError::NotFound(parent.to_string()));
        }

        let mut children: Vec<(String, Node)> = nodes
            .iter()
            .filter(|(_, n)| n.parent.as_deref() == Some(parent.as_str()) && !n.trashed)
            .map(|(uid, n)| (uid.clone(), n.clone()))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let page: Vec<RemoteNode> = children
            .iter()
            .skip(offset)
            .take(PAGE_SIZE)
            .map(|(uid, n)| RemoteNode {
                uid: NodeUid::new(uid.clone()).unwrap(),
                name: n.name.clone(),
                kind: n.kind,
                active_revision: match n.kind {
                    NodeKind::File => Some(RevisionInfo {
                        sha1: n.sha1.clone(),
                    }),
                    NodeKind::Folder => None,
                },
            })
            .collect();

        let next = (offset + PAGE_SIZE < children.len()).then(|| (offset + PAGE_SIZE).to_string());
        Ok(ChildPage { nodes: page, next })
    }

    async fn create_folder(
        &self,
        parent: &NodeUid,
        name: &str,
        _mtime_ms: Option<i64>,
    ) -> Result<NodeUid, DriveError> {
        if let Some(err) = self.take_failure("create_folder") {
            return Err(err);
        }
        let uid = self.alloc_uid();
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(parent.as_str()) {
            return Err(DriveError::NotFound(parent.to_string()));
        }
        nodes.insert(
            uid.clone(),
            Node {
                name: name.to_string(),
                parent: Some(parent.as_str().to_string()),
                kind: NodeKind::Folder,
                data: Vec::new(),
                sha1: None,
                trashed: false,
            },
        );
        Ok(NodeUid::new(uid).unwrap())
    }

    async fn upload_file(
        &self,
        parent: &NodeUid,
        name: &str,
        _meta: FileMeta,
        stream: ByteStream,
    ) -> Result<NodeUid, DriveError> {
        if let Some(err) = self.take_failure("upload_file") {
            return Err(err);
        }
        let data = read_stream(stream).await?;
        let sha1 = sha1_of_bytes(&data);
        let uid = self.alloc_uid();
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let mut nodes = self.nodes.lock().unwrap();
        nodes.insert(
            uid.clone(),
            Node {
                name: name.to_string(),
                parent: Some(parent.as_str().to_string()),
                kind: NodeKind::File,
                data,
                sha1: Some(sha1),
                trashed: false,
            },
        );
        Ok(NodeUid::new(uid).unwrap())
    }

    async fn upload_revision(
        &self,
        uid: &NodeUid,
        _meta: FileMeta,
        stream: ByteStream,
    ) -> Result<NodeUid, DriveError> {
        if let Some(err) = self.take_failure("upload_revision") {
            return Err(err);
        }
        let data = read_stream(stream).await?;
        let sha1 = sha1_of_bytes(&data);
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(uid.as_str())
            .ok_or_else(|| DriveError::NotFound(uid.to_string()))?;
        node.data = data;
        node.sha1 = Some(sha1);
        Ok(uid.clone())
    }

    async fn relocate(&self, uid: &NodeUid, request: RelocateRequest) -> Result<(), DriveError> {
        if let Some(err) = self.take_failure("relocate") {
            return Err(err);
        }
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(parent) = &request.new_parent {
            if !nodes.contains_key(parent.as_str()) {
                return Err(DriveError::NotFound(parent.to_string()));
            }
        }
        let node = nodes
            .get_mut(uid.as_str())
            .ok_or_else(|| DriveError::NotFound(uid.to_string()))?;
        if let Some(name) = request.new_name {
            node.name = name;
        }
        if let Some(parent) = request.new_parent {
            node.parent = Some(parent.as_str().to_string());
        }
        Ok(())
    }

    async fn trash(&self, uids: &[NodeUid]) -> Vec<(NodeUid, Result<(), DriveError>)> {
        let mut nodes = self.nodes.lock().unwrap();
        uids.iter()
            .map(|uid| {
                let result = match nodes.get_mut(uid.as_str()) {
                    Some(node) if node.trashed => {
                        Err(DriveError::AlreadyTrashed(uid.to_string()))
                    }
                    Some(node) => {
                        node.trashed = true;
                        Ok(())
                    }
                    None => Err(DriveError::NotFound(uid.to_string())),
                };
                (uid.clone(), result)
            })
            .collect()
    }

    async fn delete(&self, uids: &[NodeUid]) -> Vec<(NodeUid, Result<(), DriveError>)> {
        let mut nodes = self.nodes.lock().unwrap();
        uids.iter()
            .map(|uid| {
                let result = if nodes.remove(uid.as_str()).is_some() {
                    // Deleting a folder takes its subtree with it.
                    let mut doomed: Vec<String> = vec![uid.as_str().to_string()];
                    while let Some(parent) = doomed.pop() {
                        let children: Vec<String> = nodes
                            .iter()
                            .filter(|(_, n)| n.parent.as_deref() == Some(parent.as_str()))
                            .map(|(child_uid, _)| child_uid.clone())
                            .collect();
                        for child in children {
                            nodes.remove(&child);
                            doomed.push(child);
                        }
                    }
                    Ok(())
                } else {
                    Err(DriveError::NotFound(uid.to_string()))
                };
                (uid.clone(), result)
            })
            .collect()
    }
}

/// Auth provider over a [`MockDrive`], with scriptable connection failures.
pub struct MockAuth {
    drive: Arc<MockDrive>,
    connect_failures: Mutex<VecDeque<AuthError>>,
}

impl MockAuth {
    pub fn new(drive: Arc<MockDrive>) -> Arc<Self> {
        Arc::new(Self {
            drive,
            connect_failures: Mutex::new(VecDeque::new()),
        })
    }

    #[allow(dead_code)]
    pub fn fail_next(&self, err: AuthError) {
        self.connect_failures.lock().unwrap().push_back(err);
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    async fn connect(&self) -> Result<Arc<dyn DriveClient>, AuthError> {
        if let Some(err) = self.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(Arc::clone(&self.drive) as Arc<dyn DriveClient>)
    }
}
