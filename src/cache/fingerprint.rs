use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::DriveError;

/// On-disk format version of the cache file.
const CACHE_VERSION: u32 = 1;

/// Content hash of a local file, valid while its size and mtime match.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    mtime_secs: i64,
    mtime_nanos: u32,
    hash: String,
}

/// The state both sides agreed on the last time a path was synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub hash: String,
    pub remote_id: String,
    pub synced_at: DateTime<Utc>,
}

/// A remote folder that `sync` has been run against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRoot {
    pub local: String,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FingerprintRecord {
    path: String,
    size: u64,
    mtime_secs: i64,
    mtime_nanos: u32,
    hash: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    fingerprints: Vec<FingerprintRecord>,
    #[serde(default)]
    markers: BTreeMap<String, SyncMarker>,
    /// Sync roots by remote folder id.
    #[serde(default)]
    roots: BTreeMap<String, SyncRoot>,
}

impl CacheFile {
    fn read(path: &Path) -> Result<Option<Self>, DriveError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DriveError::from_io(e, path)),
        };
        match serde_json::from_str::<CacheFile>(&contents) {
            Ok(file) if file.version == CACHE_VERSION => Ok(Some(file)),
            Ok(file) => {
                tracing::warn!(
                    version = file.version,
                    "Unsupported {} version, starting fresh",
                    path.display()
                );
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Corrupted {}, starting fresh: {}", path.display(), e);
                Ok(None)
            }
        }
    }
}

/// Sync roots recorded in the cache file at `path`, without taking its lock.
///
/// Saves replace the file by rename, so a reader never sees a partial write.
pub fn read_sync_roots(path: &Path) -> Result<BTreeMap<String, SyncRoot>, DriveError> {
    Ok(CacheFile::read(path)?
        .map(|file| file.roots)
        .unwrap_or_default())
}

/// Persistent (path, size, mtime) → content hash cache plus sync markers.
///
/// Both tables are concurrent maps: transfer workers record fingerprints
/// and markers while the differ reads them.
///
/// An exclusive advisory lock on the sibling `.lock` file is held for the
/// lifetime of this struct, so two runs never interleave writes.
pub struct FingerprintCache {
    path: Option<PathBuf>,
    fingerprints: DashMap<PathBuf, Fingerprint>,
    markers: DashMap<PathBuf, SyncMarker>,
    roots: DashMap<String, SyncRoot>,
    dirty: AtomicBool,
    _lock_file: Option<File>,
}

impl FingerprintCache {
    /// Open the cache at `path`, blocking until the lock is free.
    ///
    /// A missing file gives an empty cache. A corrupt file logs a warning
    /// and starts fresh; it is overwritten on the next save.
    pub fn load(path: &Path) -> Result<Self, DriveError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_extension("lock");
        let lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| DriveError::from_io(e, &lock_path))?;
        lock_file.lock_exclusive()?;

        let cache = Self {
            path: Some(path.to_path_buf()),
            fingerprints: DashMap::new(),
            markers: DashMap::new(),
            roots: DashMap::new(),
            dirty: AtomicBool::new(false),
            _lock_file: Some(lock_file),
        };

        let Some(file) = CacheFile::read(path)? else {
            return Ok(cache);
        };

        for record in file.fingerprints {
            cache.fingerprints.insert(
                PathBuf::from(record.path),
                Fingerprint {
                    size: record.size,
                    mtime_secs: record.mtime_secs,
                    mtime_nanos: record.mtime_nanos,
                    hash: record.hash,
                },
            );
        }
        for (path, marker) in file.markers {
            cache.markers.insert(PathBuf::from(path), marker);
        }
        for (id, root) in file.roots {
            cache.roots.insert(id, root);
        }
        tracing::debug!(
            fingerprints = cache.fingerprints.len(),
            markers = cache.markers.len(),
            "Loaded fingerprint cache"
        );
        Ok(cache)
    }

    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            fingerprints: DashMap::new(),
            markers: DashMap::new(),
            roots: DashMap::new(),
            dirty: AtomicBool::new(false),
            _lock_file: None,
        }
    }

    /// Cached hash for `path`, if size and mtime still match.
    pub fn lookup(&self, path: &Path, size: u64, mtime: SystemTime) -> Option<String> {
        let (secs, nanos) = mtime_parts(mtime);
        let entry = self.fingerprints.get(path)?;
        if entry.size == size && entry.mtime_secs == secs && entry.mtime_nanos == nanos {
            Some(entry.hash.clone())
        } else {
            None
        }
    }

    pub fn store(&self, path: &Path, size: u64, mtime: SystemTime, hash: &str) {
        let (mtime_secs, mtime_nanos) = mtime_parts(mtime);
        self.fingerprints.insert(
            path.to_path_buf(),
            Fingerprint {
                size,
                mtime_secs,
                mtime_nanos,
                hash: hash.to_string(),
            },
        );
        self.dirty.store(true, Ordering::Release);
    }

    pub fn synced(&self, path: &Path) -> Option<SyncMarker> {
        self.markers.get(path).map(|m| m.clone())
    }

    pub fn mark_synced(&self, path: &Path, hash: &str, remote_id: &str) {
        self.markers.insert(
            path.to_path_buf(),
            SyncMarker {
                hash: hash.to_string(),
                remote_id: remote_id.to_string(),
                synced_at: Utc::now(),
            },
        );
        self.dirty.store(true, Ordering::Release);
    }

    /// Remember that remote folder `remote_id` is synced with `local`.
    pub fn record_root(&self, remote_id: &str, local: &Path) {
        self.roots.insert(
            remote_id.to_string(),
            SyncRoot {
                local: local.to_string_lossy().into_owned(),
                synced_at: Utc::now(),
            },
        );
        self.dirty.store(true, Ordering::Release);
    }

    pub fn sync_root(&self, remote_id: &str) -> Option<SyncRoot> {
        self.roots.get(remote_id).map(|r| r.clone())
    }

    /// Drop the fingerprint and marker of a deleted path.
    pub fn forget(&self, path: &Path) {
        let had_fingerprint = self.fingerprints.remove(path).is_some();
        let had_marker = self.markers.remove(path).is_some();
        if had_fingerprint || had_marker {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Drop fingerprints and markers of `root` and everything below it.
    pub fn forget_tree(&self, root: &Path) {
        let before = self.fingerprints.len() + self.markers.len();
        self.fingerprints.retain(|path, _| !path.starts_with(root));
        self.markers.retain(|path, _| !path.starts_with(root));
        if self.fingerprints.len() + self.markers.len() != before {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    /// Write the cache atomically (temp file, then rename).
    ///
    /// Paths that are not valid UTF-8 are not persisted.
    pub fn save(&self) -> Result<(), DriveError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.dirty.store(false, Ordering::Release);

        let mut fingerprints: Vec<FingerprintRecord> = self
            .fingerprints
            .iter()
            .filter_map(|entry| {
                let key = entry.key().to_str()?.to_string();
                let fp = entry.value();
                Some(FingerprintRecord {
                    path: key,
                    size: fp.size,
                    mtime_secs: fp.mtime_secs,
                    mtime_nanos: fp.mtime_nanos,
                    hash: fp.hash.clone(),
                })
            })
            .collect();
        fingerprints.sort_by(|a, b| a.path.cmp(&b.path));

        let markers: BTreeMap<String, SyncMarker> = self
            .markers
            .iter()
            .filter_map(|entry| Some((entry.key().to_str()?.to_string(), entry.value().clone())))
            .collect();

        let roots: BTreeMap<String, SyncRoot> = self
            .roots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let file = CacheFile {
            version: CACHE_VERSION,
            fingerprints,
            markers,
            roots,
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| DriveError::Cache(format!("Cannot encode {}: {}", path.display(), e)))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| DriveError::from_io(e, &tmp_path))?;
        std::fs::rename(&tmp_path, path).map_err(|e| DriveError::from_io(e, path))?;
        tracing::trace!(
            path = %path.display(),
            entries = self.len(),
            "Saved fingerprint cache"
        );
        Ok(())
    }
}

/// Split a timestamp into floored seconds since the epoch and the
/// nanoseconds past that second.
fn mtime_parts(time: SystemTime) -> (i64, u32) {
    let time = DateTime::<Utc>::from(time);
    (time.timestamp(), time.timestamp_subsec_nanos())
}
