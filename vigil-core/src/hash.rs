use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::types::ContentHash;

/// Bytes read from disk together with their content hash.
#[derive(Clone)]
pub struct HashedContent {
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
}

impl HashedContent {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Lossy UTF-8 view used by text validators and the keyword scan.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

impl std::fmt::Debug for HashedContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashedContent")
            .field("hash", &self.hash)
            .field("byte_len", &self.bytes.len())
            .finish()
    }
}

pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash::new(hex::encode(hasher.finalize()))
}

/// Read and hash a file. `Ok(None)` means the path no longer resolves.
pub async fn read_and_hash(path: &Path) -> Result<Option<HashedContent>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(HashedContent {
            hash: hash_bytes(&bytes),
            bytes,
        })),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PipelineError::Io(err)),
    }
}
