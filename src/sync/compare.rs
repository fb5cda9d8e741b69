use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::cache::FingerprintCache;
use crate::error::DriveError;
use crate::transfer::checksum::hash_file;

use super::tree::FileEntry;

/// Decides whether a local and a remote file hold the same content.
///
/// Local hashes come from the fingerprint cache when the file's size and
/// mtime still match, and are computed and cached otherwise.
pub struct ChangeComparer {
    cache: Arc<FingerprintCache>,
    local_root: PathBuf,
}

impl ChangeComparer {
    pub fn new(cache: Arc<FingerprintCache>, local_root: &Path) -> Self {
        Self {
            cache,
            local_root: local_root.to_path_buf(),
        }
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Absolute local path of an entry.
    pub fn absolute(&self, entry: &FileEntry) -> PathBuf {
        self.local_root.join(&entry.path)
    }

    /// Content hash of a local file.
    pub fn local_hash(&self, local: &FileEntry) -> Result<String, DriveError> {
        let path = self.absolute(local);
        let mtime = SystemTime::from(local.modified);
        if let Some(hash) = self.cache.lookup(&path, local.size, mtime) {
            return Ok(hash);
        }
        let hash = hash_file(&path)?;
        tracing::trace!(path = %local.path, "Hashed local file");
        self.cache.store(&path, local.size, mtime, &hash);
        Ok(hash)
    }

    /// True if both files have the same size and content hash.
    ///
    /// Different sizes short-circuit without hashing. A remote file without
    /// a hash is never equal; directories are never compared by content.
    pub fn equal(&self, local: &FileEntry, remote: &FileEntry) -> Result<bool, DriveError> {
        if local.is_dir || remote.is_dir {
            return Ok(false);
        }
        if local.size != remote.size {
            return Ok(false);
        }
        let Some(remote_hash) = remote.content_hash.as_deref() else {
            return Ok(false);
        };
        Ok(self.local_hash(local)? == remote_hash)
    }
}
