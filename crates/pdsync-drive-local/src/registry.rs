//! Node uid registry for the local-directory backend
//!
//! Maps sequential uids to paths relative to the backend root. Persisted
//! as a JSON sidecar so uids (and therefore the daemon's node mappings)
//! stay stable across restarts. Entries for paths that appear on disk
//! without a uid are allocated lazily during listings.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use pdsync_core::domain::newtypes::NodeUid;

/// Uid of the backend root folder.
const ROOT_UID: &str = "node-0";

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Registry {
    next_id: u64,
    /// uid -> path relative to the backend root ("" is the root itself)
    nodes: HashMap<String, String>,
}

impl Registry {
    /// Load the sidecar, or start fresh when it is absent or unreadable.
    pub(crate) async fn load(path: &Path) -> anyhow::Result<Self> {
        let mut registry = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Self::default(),
        };
        registry
            .nodes
            .entry(ROOT_UID.to_string())
            .or_insert_with(String::new);
        if registry.next_id == 0 {
            registry.next_id = 1;
        }
        Ok(registry)
    }

    /// Persist the sidecar.
    pub(crate) async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    pub(crate) fn root_uid(&self) -> NodeUid {
        NodeUid::new(ROOT_UID.to_string()).expect("root uid is non-empty")
    }

    /// Relative path of a uid, if known.
    pub(crate) fn path_of(&self, uid: &NodeUid) -> Option<String> {
        self.nodes.get(uid.as_str()).cloned()
    }

    /// Uid for a relative path, allocating one when unseen.
    pub(crate) fn uid_for(&mut self, rel: &str) -> NodeUid {
        if let Some((uid, _)) = self.nodes.iter().find(|(_, p)| p.as_str() == rel) {
            return NodeUid::new(uid.clone()).expect("registry uids are non-empty");
        }
        let uid = format!("node-{}", self.next_id);
        self.next_id += 1;
        self.nodes.insert(uid.clone(), rel.to_string());
        NodeUid::new(uid).expect("allocated uid is non-empty")
    }

    /// Rewrite a path (and its subtree) after a rename or move.
    pub(crate) fn relocate(&mut self, old_rel: &str, new_rel: &str) {
        let prefix = format!("{old_rel}/");
        for path in self.nodes.values_mut() {
            if path == old_rel {
                *path = new_rel.to_string();
            } else if let Some(rest) = path.strip_prefix(&prefix) {
                *path = format!("{new_rel}/{rest}");
            }
        }
    }

    /// Drop a path and every descendant from the registry.
    pub(crate) fn remove_subtree(&mut self, rel: &str) {
        let prefix = format!("{rel}/");
        self.nodes
            .retain(|_, path| path != rel && !path.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_allocation_is_stable() {
        let mut registry = Registry::default();
        registry.nodes.insert(ROOT_UID.to_string(), String::new());
        registry.next_id = 1;

        let first = registry.uid_for("docs/a.txt");
        let again = registry.uid_for("docs/a.txt");
        assert_eq!(first, again);

        let other = registry.uid_for("docs/b.txt");
        assert_ne!(first, other);
    }

    #[test]
    fn test_relocate_rewrites_subtree() {
        let mut registry = Registry::default();
        registry.next_id = 1;
        registry.nodes.insert(ROOT_UID.to_string(), String::new());
        let dir = registry.uid_for("old");
        let child = registry.uid_for("old/a.txt");

        registry.relocate("old", "new");

        assert_eq!(registry.path_of(&dir).unwrap(), "new");
        assert_eq!(registry.path_of(&child).unwrap(), "new/a.txt");
    }

    #[test]
    fn test_remove_subtree() {
        let mut registry = Registry::default();
        registry.next_id = 1;
        registry.nodes.insert(ROOT_UID.to_string(), String::new());
        let dir = registry.uid_for("old");
        let child = registry.uid_for("old/a.txt");
        let sibling = registry.uid_for("older.txt");

        registry.remove_subtree("old");

        assert!(registry.path_of(&dir).is_none());
        assert!(registry.path_of(&child).is_none());
        assert!(registry.path_of(&sibling).is_some());
    }
}
