//! Streaming SHA-1 content hashing
//!
//! The drive identifies file revisions by the SHA-1 of their plaintext, so
//! the same digest doubles as the local skip-on-identical check and the
//! rename-correlation key. Files are read in chunks; nothing is buffered
//! whole.

use std::path::Path;

use anyhow::Context;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use pdsync_core::domain::newtypes::ContentHash;

/// Read buffer size for hashing.
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the SHA-1 digest of a file's bytes, lowercase hex.
pub async fn compute_sha1(path: &Path) -> anyhow::Result<ContentHash> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;

    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read {} while hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    ContentHash::new(hex::encode(digest)).map_err(Into::into)
}

/// Compute the SHA-1 digest of an in-memory buffer, lowercase hex.
#[must_use]
pub fn sha1_of_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    // 20 digest bytes always hex-encode to 40 valid characters.
    ContentHash::new(hex::encode(hasher.finalize())).expect("sha1 digest is valid hex")
}
