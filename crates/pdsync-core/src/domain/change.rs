//! Filesystem change records
//!
//! A [`FileChange`] is the watcher's output: one observation about one
//! path, produced either by the scan-diff pass or by a settled live event.
//! The classifier turns batches of these into jobs.

use super::newtypes::{ChangeToken, LocalPath};

/// One observed change under a sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// The sync root the path belongs to
    pub root: LocalPath,
    /// Absolute local path of the changed entry
    pub path: LocalPath,
    /// Whether the entry currently exists on disk
    pub exists: bool,
    /// For existing entries: whether the path was previously unknown.
    /// `false` means the change token differed from the stored one.
    pub is_new: bool,
    /// Whether the entry is a directory. For deletions the type is
    /// unknown; the processor resolves the ambiguity via the node mapping.
    pub is_directory: bool,
    /// Current change token (`None` for deletions)
    pub token: Option<ChangeToken>,
}

impl FileChange {
    /// An entry that exists on disk, new or modified.
    #[must_use]
    pub fn present(
        root: LocalPath,
        path: LocalPath,
        is_new: bool,
        is_directory: bool,
        token: ChangeToken,
    ) -> Self {
        Self {
            root,
            path,
            exists: true,
            is_new,
            is_directory,
            token: Some(token),
        }
    }

    /// An entry that was tracked but is gone from disk.
    #[must_use]
    pub fn missing(root: LocalPath, path: LocalPath) -> Self {
        Self {
            root,
            path,
            exists: false,
            is_new: false,
            is_directory: false,
            token: None,
        }
    }

    /// Size recorded in the change token, when present.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.token.map(|t| t.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_present_and_missing_constructors() {
        let root = LocalPath::new(PathBuf::from("/sync")).unwrap();
        let path = LocalPath::new(PathBuf::from("/sync/a.txt")).unwrap();

        let change = FileChange::present(
            root.clone(),
            path.clone(),
            true,
            false,
            ChangeToken::new(1000, 5),
        );
        assert!(change.exists);
        assert!(change.is_new);
        assert_eq!(change.size(), Some(5));

        let gone = FileChange::missing(root, path);
        assert!(!gone.exists);
        assert_eq!(gone.token, None);
        assert_eq!(gone.size(), None);
    }
}
