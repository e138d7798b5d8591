//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the values the sync engine persists and keys
//! on. Each newtype validates at construction time so the rest of the code
//! never sees a relative local path, an uppercase hash or a malformed
//! change token.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// LocalPath
// ============================================================================

/// A canonical absolute path on the local filesystem.
///
/// All persisted state (`file_state`, `file_hashes`, `node_mapping`,
/// `sync_jobs`) is keyed by these. The path is:
/// - Absolute
/// - Normalized (no `.` or `..` components)
///
/// Symlink resolution happens where the path enters the system (config
/// load, watcher); normalization here only removes lexical noise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct LocalPath(PathBuf);

impl LocalPath {
    /// Create a new `LocalPath`, validating it is absolute.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is relative or
    /// escapes the root via `..`.
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }
        Ok(Self(Self::normalize(&path)?))
    }

    /// Get the inner path reference.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// The path as a UTF-8 string, lossy where the OS string is not UTF-8.
    ///
    /// Persisted keys use this representation.
    #[must_use]
    pub fn as_key(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }

    /// Join a single relative component, refusing traversal.
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.contains("..") || component.starts_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {component}"
            )));
        }
        Self::new(self.0.join(component))
    }

    /// The parent directory, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// Final path component as a string.
    #[must_use]
    pub fn file_name(&self) -> Option<String> {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// The path relative to `root`.
    ///
    /// # Errors
    /// Returns an error if this path is not under `root`.
    pub fn relative_to(&self, root: &LocalPath) -> Result<PathBuf, DomainError> {
        self.0
            .strip_prefix(&root.0)
            .map(Path::to_path_buf)
            .map_err(|_| {
                DomainError::InvalidPath(format!(
                    "{} is not within {}",
                    self.0.display(),
                    root.0.display()
                ))
            })
    }

    /// Whether this path equals `dir` or lies inside it.
    ///
    /// String-prefix semantics match the store's subtree queries:
    /// `/a/b` is under `/a` but `/a/bc` is not.
    #[must_use]
    pub fn is_under(&self, dir: &LocalPath) -> bool {
        self.0 == dir.0 || self.0.starts_with(&dir.0)
    }

    fn normalize(path: &Path) -> Result<PathBuf, DomainError> {
        use std::path::Component;

        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "Path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }
        Ok(normalized)
    }
}

impl Display for LocalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for LocalPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<LocalPath> for PathBuf {
    fn from(path: LocalPath) -> Self {
        path.0
    }
}

impl AsRef<Path> for LocalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

// ============================================================================
// RemotePath
// ============================================================================

/// A remote drive path, `/`-rooted with `/`-separated segments.
///
/// Remote paths are derived, never scanned: they exist so jobs carry a
/// stable human-readable target and so the processor knows which ancestor
/// folders to walk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Create a new `RemotePath`.
    ///
    /// # Errors
    /// Returns an error if the path does not start with `/`, contains
    /// empty segments, or contains `..`.
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must start with '/': {path}"
            )));
        }
        if path.len() > 1 && path.contains("//") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains empty segment: {path}"
            )));
        }
        if path.split('/').any(|seg| seg == "..") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains traversal: {path}"
            )));
        }
        Ok(Self(path))
    }

    /// The root path `/`.
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Get the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one segment.
    pub fn join(&self, segment: &str) -> Result<Self, DomainError> {
        if segment.is_empty() || segment.contains('/') || segment == ".." {
            return Err(DomainError::InvalidRemotePath(format!(
                "Invalid path segment: {segment}"
            )));
        }
        let joined = if self.0 == "/" {
            format!("/{segment}")
        } else {
            format!("{}/{segment}", self.0)
        };
        Self::new(joined)
    }

    /// The parent path; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Final segment; `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.0 == "/" {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Iterate the path's segments in order, root excluded.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

// ============================================================================
// NodeUid
// ============================================================================

/// Opaque, stable identifier of a remote object.
///
/// Survives renames and moves; the engine never inspects its contents
/// beyond non-emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeUid(String);

impl NodeUid {
    /// Create a new `NodeUid`.
    ///
    /// # Errors
    /// Returns an error if the uid is empty.
    pub fn new(uid: String) -> Result<Self, DomainError> {
        if uid.is_empty() {
            return Err(DomainError::InvalidNodeUid(
                "Node uid cannot be empty".to_string(),
            ));
        }
        Ok(Self(uid))
    }

    /// Get the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeUid {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for NodeUid {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<NodeUid> for String {
    fn from(uid: NodeUid) -> Self {
        uid.0
    }
}

// ============================================================================
// ContentHash
// ============================================================================

/// SHA-1 digest of a file's bytes, stored as lowercase hex.
///
/// Used to suppress uploads whose content is unchanged and to correlate
/// delete-then-create pairs as renames. Input is accepted case-insensitively
/// (remote revision hashes may be uppercase) and normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hex length of a SHA-1 digest.
    const HEX_LEN: usize = 40;

    /// Create a new `ContentHash` from a hex string.
    ///
    /// # Errors
    /// Returns an error unless the input is exactly 40 hex characters.
    pub fn new(hash: String) -> Result<Self, DomainError> {
        if hash.len() != Self::HEX_LEN {
            return Err(DomainError::InvalidHash(format!(
                "Expected {} hex chars, got {}",
                Self::HEX_LEN,
                hash.len()
            )));
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::InvalidHash(format!(
                "Hash is not hex: {hash}"
            )));
        }
        Ok(Self(hash.to_ascii_lowercase()))
    }

    /// Get the inner string reference (lowercase hex).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

// ============================================================================
// ChangeToken
// ============================================================================

/// Cheap staleness check for a local path: `"<mtime_ms>:<size>"`.
///
/// Two observations of a path with equal tokens are treated as unchanged
/// without reading the file's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeToken {
    /// Modification time in milliseconds since the Unix epoch
    pub mtime_ms: i64,
    /// File size in bytes (0 for directories)
    pub size: u64,
}

impl ChangeToken {
    /// Create a token from its parts.
    #[must_use]
    pub fn new(mtime_ms: i64, size: u64) -> Self {
        Self { mtime_ms, size }
    }
}

impl Display for ChangeToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mtime_ms, self.size)
    }
}

impl FromStr for ChangeToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mtime, size) = s
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidChangeToken(s.to_string()))?;
        let mtime_ms = mtime
            .parse::<i64>()
            .map_err(|_| DomainError::InvalidChangeToken(s.to_string()))?;
        let size = size
            .parse::<u64>()
            .map_err(|_| DomainError::InvalidChangeToken(s.to_string()))?;
        Ok(Self { mtime_ms, size })
    }
}

impl TryFrom<String> for ChangeToken {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChangeToken> for String {
    fn from(token: ChangeToken) -> Self {
        token.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod local_path_tests {
        use super::*;

        #[test]
        fn test_new_absolute_path() {
            let path = LocalPath::new(PathBuf::from("/home/user/sync")).unwrap();
            assert_eq!(path.to_string(), "/home/user/sync");
        }

        #[test]
        fn test_new_relative_path_fails() {
            assert!(LocalPath::new(PathBuf::from("relative/path")).is_err());
        }

        #[test]
        fn test_normalization_removes_dot_components() {
            let path = LocalPath::new(PathBuf::from("/home/./user/../user/sync")).unwrap();
            assert_eq!(path.to_string(), "/home/user/sync");
        }

        #[test]
        fn test_join_traversal_fails() {
            let root = LocalPath::new(PathBuf::from("/home/user")).unwrap();
            assert!(root.join("../outside").is_err());
        }

        #[test]
        fn test_relative_to() {
            let root = LocalPath::new(PathBuf::from("/home/user/sync")).unwrap();
            let child = LocalPath::new(PathBuf::from("/home/user/sync/docs/a.txt")).unwrap();
            assert_eq!(child.relative_to(&root).unwrap(), PathBuf::from("docs/a.txt"));
        }

        #[test]
        fn test_is_under_respects_component_boundary() {
            let dir = LocalPath::new(PathBuf::from("/a")).unwrap();
            let inside = LocalPath::new(PathBuf::from("/a/b")).unwrap();
            let sibling = LocalPath::new(PathBuf::from("/ab")).unwrap();
            assert!(inside.is_under(&dir));
            assert!(dir.is_under(&dir));
            assert!(!sibling.is_under(&dir));
        }
    }

    mod remote_path_tests {
        use super::*;

        #[test]
        fn test_new_valid() {
            let path = RemotePath::new("/Documents/file.txt".to_string()).unwrap();
            assert_eq!(path.as_str(), "/Documents/file.txt");
        }

        #[test]
        fn test_no_leading_slash_fails() {
            assert!(RemotePath::new("Documents/file.txt".to_string()).is_err());
        }

        #[test]
        fn test_double_slash_fails() {
            assert!(RemotePath::new("/Documents//file.txt".to_string()).is_err());
        }

        #[test]
        fn test_traversal_fails() {
            assert!(RemotePath::new("/Documents/../file.txt".to_string()).is_err());
        }

        #[test]
        fn test_join_and_parent() {
            let path = RemotePath::root().join("docs").unwrap().join("a.txt").unwrap();
            assert_eq!(path.as_str(), "/docs/a.txt");
            assert_eq!(path.parent().unwrap().as_str(), "/docs");
            assert_eq!(path.parent().unwrap().parent().unwrap().as_str(), "/");
            assert!(RemotePath::root().parent().is_none());
        }

        #[test]
        fn test_segments() {
            let path = RemotePath::new("/a/b/c".to_string()).unwrap();
            let segs: Vec<&str> = path.segments().collect();
            assert_eq!(segs, vec!["a", "b", "c"]);
            assert_eq!(RemotePath::root().segments().count(), 0);
        }
    }

    mod content_hash_tests {
        use super::*;

        #[test]
        fn test_lowercases_input() {
            let hash =
                ContentHash::new("DA39A3EE5E6B4B0D3255BFEF95601890AFD80709".to_string()).unwrap();
            assert_eq!(hash.as_str(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
        }

        #[test]
        fn test_wrong_length_fails() {
            assert!(ContentHash::new("abcd".to_string()).is_err());
        }

        #[test]
        fn test_non_hex_fails() {
            assert!(ContentHash::new("z".repeat(40)).is_err());
        }

        #[test]
        fn test_case_insensitive_equality() {
            let a = ContentHash::new("da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string()).unwrap();
            let b = ContentHash::new("DA39A3EE5E6B4B0D3255BFEF95601890AFD80709".to_string()).unwrap();
            assert_eq!(a, b);
        }
    }

    mod change_token_tests {
        use super::*;

        #[test]
        fn test_display_format() {
            let token = ChangeToken::new(1717000000123, 42);
            assert_eq!(token.to_string(), "1717000000123:42");
        }

        #[test]
        fn test_parse_roundtrip() {
            let token: ChangeToken = "1717000000123:42".parse().unwrap();
            assert_eq!(token, ChangeToken::new(1717000000123, 42));
        }

        #[test]
        fn test_parse_invalid() {
            assert!("not-a-token".parse::<ChangeToken>().is_err());
            assert!("123".parse::<ChangeToken>().is_err());
            assert!("abc:def".parse::<ChangeToken>().is_err());
        }
    }

    mod node_uid_tests {
        use super::*;

        #[test]
        fn test_empty_fails() {
            assert!(NodeUid::new(String::new()).is_err());
        }

        #[test]
        fn test_opaque_contents_accepted() {
            let uid = NodeUid::new("vol1:node_AbC-123==".to_string()).unwrap();
            assert_eq!(uid.as_str(), "vol1:node_AbC-123==");
        }
    }
}
