//! Object store kept in a plain directory.
//!
//! Layout: `index.json` maps entry ids to metadata, `blobs/<id>` holds file
//! content. An exclusive advisory lock on `store.lock` is held while the
//! store is open, so two processes never interleave index writes.
//!
//! Creates and updates are written to `index.json` in batches; deletes and
//! [`RemoteStore::flush`] write it at once, and dropping the store flushes
//! whatever is left.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::DriveError;
use crate::remote::{NewEntry, RemoteEntry, RemoteStore, ROOT_ID};
use crate::transfer::checksum::HashingReader;

/// Buffer size for blob reads and writes: 256KB.
const BUF_SIZE: usize = 256 * 1024;

/// Write the index after this many unsaved creates or updates.
const INDEX_SAVE_INTERVAL: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
    name: String,
    parents: Vec<String>,
    is_dir: bool,
    size: u64,
    content_hash: Option<String>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreIndex {
    version: u32,
    entries: BTreeMap<String, IndexRecord>,
}

impl StoreIndex {
    fn fresh() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            ROOT_ID.to_string(),
            IndexRecord {
                name: "My Drive".to_string(),
                parents: Vec::new(),
                is_dir: true,
                size: 0,
                content_hash: None,
                modified: Utc::now(),
            },
        );
        Self {
            version: 1,
            entries,
        }
    }
}

/// Directory-backed implementation of [`RemoteStore`].
pub struct DirectoryStore {
    root: PathBuf,
    chunk_size: u64,
    index: Mutex<StoreIndex>,
    /// Changes made since the index was last written.
    unsaved: AtomicUsize,
    /// Dropping this field releases the advisory lock.
    _lock_file: File,
}

impl DirectoryStore {
    /// Open (or initialise) the store rooted at `root`.
    ///
    /// Blocks until any other process holding the store lock releases it.
    pub fn open(root: &Path, chunk_size: u64) -> Result<Self, DriveError> {
        std::fs::create_dir_all(root.join("blobs"))
            .map_err(|e| DriveError::from_io(e, root))?;

        let lock_file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join("store.lock"))?;
        lock_file.lock_exclusive()?;

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let contents = std::fs::read_to_string(&index_path)?;
            serde_json::from_str::<StoreIndex>(&contents).map_err(|e| {
                DriveError::Remote(format!(
                    "Corrupted store index {}: {}",
                    index_path.display(),
                    e
                ))
            })?
        } else {
            StoreIndex::fresh()
        };

        tracing::debug!(
            root = %root.display(),
            entries = index.entries.len(),
            "Opened directory store"
        );

        let store = Self {
            root: root.to_path_buf(),
            chunk_size,
            index: Mutex::new(index),
            unsaved: AtomicUsize::new(0),
            _lock_file: lock_file,
        };
        if !index_path.exists() {
            let guard = store.lock_index()?;
            store.save(&guard)?;
        }
        Ok(store)
    }

    fn lock_index(&self) -> Result<MutexGuard<'_, StoreIndex>, DriveError> {
        self.index
            .lock()
            .map_err(|_| DriveError::Remote("Store index lock poisoned".to_string()))
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join("blobs").join(id)
    }

    /// Save the index atomically (write temp, rename).
    fn save(&self, index: &StoreIndex) -> Result<(), DriveError> {
        let path = self.root.join("index.json");
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(index)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;
        self.unsaved.store(0, Ordering::SeqCst);
        tracing::trace!(entries = index.entries.len(), "Saved store index");
        Ok(())
    }

    /// Count one change, saving the index once enough have piled up.
    /// Must be called with the index lock held.
    fn changed(&self, index: &StoreIndex) -> Result<(), DriveError> {
        if self.unsaved.fetch_add(1, Ordering::SeqCst) + 1 >= INDEX_SAVE_INTERVAL {
            self.save(index)?;
        }
        Ok(())
    }

    /// Stream `content` into the blob for `id`, `chunk_size` bytes at a time.
    ///
    /// Returns the number of bytes written and their BLAKE3 hash.
    fn write_blob(&self, id: &str, content: &mut dyn Read) -> Result<(u64, String), DriveError> {
        let blob = self.blob_path(id);
        let partial = blob.with_extension("partial");
        let file = File::create(&partial)?;
        let mut writer = BufWriter::with_capacity(BUF_SIZE, file);
        let mut reader = HashingReader::new(content);

        loop {
            let n = std::io::copy(&mut reader.by_ref().take(self.chunk_size), &mut writer)?;
            if n == 0 {
                break;
            }
            tracing::trace!(id, chunk_bytes = n, total = reader.bytes_read(), "Stored chunk");
        }

        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| DriveError::Io {
                source: e.into_error(),
            })?
            .sync_all()?;
        std::fs::rename(&partial, &blob)?;

        Ok((reader.bytes_read(), reader.hex_digest()))
    }

    fn require_folder(index: &StoreIndex, id: &str) -> Result<(), DriveError> {
        match index.entries.get(id) {
            Some(record) if record.is_dir => Ok(()),
            Some(record) => Err(DriveError::Remote(format!(
                "'{}' is not a folder",
                record.name
            ))),
            None => Err(DriveError::RemoteNotFound { id: id.to_string() }),
        }
    }

    fn to_entry(id: &str, record: &IndexRecord) -> RemoteEntry {
        RemoteEntry {
            id: id.to_string(),
            name: record.name.clone(),
            parents: record.parents.clone(),
            is_dir: record.is_dir,
            size: record.size,
            content_hash: record.content_hash.clone(),
            modified: record.modified,
        }
    }
}

impl RemoteStore for DirectoryStore {
    fn create(
        &self,
        entry: &NewEntry,
        content: Option<&mut dyn Read>,
    ) -> Result<RemoteEntry, DriveError> {
        let parents = if entry.parents.is_empty() {
            vec![ROOT_ID.to_string()]
        } else {
            entry.parents.clone()
        };
        {
            let index = self.lock_index()?;
            for parent in &parents {
                Self::require_folder(&index, parent)?;
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (size, content_hash) = if entry.is_dir {
            (0, None)
        } else {
            let mut empty = std::io::empty();
            let reader: &mut dyn Read = match content {
                Some(reader) => reader,
                None => &mut empty,
            };
            let (size, hash) = self.write_blob(&id, reader)?;
            (size, Some(hash))
        };

        let record = IndexRecord {
            name: entry.name.clone(),
            parents,
            is_dir: entry.is_dir,
            size,
            content_hash,
            modified: entry.modified.unwrap_or_else(Utc::now),
        };

        let mut index = self.lock_index()?;
        // A parent may have been deleted while the blob was written.
        for parent in &record.parents {
            if let Err(err) = Self::require_folder(&index, parent) {
                let _ = std::fs::remove_file(self.blob_path(&id));
                return Err(err);
            }
        }
        let created = Self::to_entry(&id, &record);
        index.entries.insert(id, record);
        self.changed(&index)?;

        tracing::debug!(id = %created.id, name = %created.name, "Created remote entry");
        Ok(created)
    }

    fn update(
        &self,
        id: &str,
        content: &mut dyn Read,
        modified: Option<DateTime<Utc>>,
    ) -> Result<RemoteEntry, DriveError> {
        {
            let index = self.lock_index()?;
            match index.entries.get(id) {
                Some(record) if record.is_dir => {
                    return Err(DriveError::Remote(format!(
                        "'{}' is a folder and has no content",
                        record.name
                    )))
                }
                Some(_) => {}
                None => return Err(DriveError::RemoteNotFound { id: id.to_string() }),
            }
        }

        let (size, hash) = self.write_blob(id, content)?;

        let mut index = self.lock_index()?;
        let record = index
            .entries
            .get_mut(id)
            .ok_or_else(|| DriveError::RemoteNotFound { id: id.to_string() })?;
        record.size = size;
        record.content_hash = Some(hash);
        record.modified = modified.unwrap_or_else(Utc::now);
        let updated = Self::to_entry(id, record);
        self.changed(&index)?;

        tracing::debug!(id, size, "Updated remote content");
        Ok(updated)
    }

    fn delete(&self, id: &str) -> Result<(), DriveError> {
        if id == ROOT_ID {
            return Err(DriveError::Remote("The root folder cannot be deleted".to_string()));
        }

        let mut index = self.lock_index()?;
        if index.entries.remove(id).is_none() {
            return Err(DriveError::RemoteNotFound { id: id.to_string() });
        }

        // Entries left without any parent belong to the deleted subtree.
        let mut removed: BTreeSet<String> = BTreeSet::new();
        removed.insert(id.to_string());
        let mut frontier = vec![id.to_string()];
        while let Some(gone) = frontier.pop() {
            let mut orphans = Vec::new();
            for (child_id, record) in index.entries.iter_mut() {
                if record.parents.iter().any(|p| p == &gone) {
                    record.parents.retain(|p| p != &gone);
                    if record.parents.is_empty() {
                        orphans.push(child_id.clone());
                    }
                }
            }
            for orphan in orphans {
                index.entries.remove(&orphan);
                removed.insert(orphan.clone());
                frontier.push(orphan);
            }
        }
        self.save(&index)?;
        drop(index);

        for gone in &removed {
            let blob = self.blob_path(gone);
            if blob.exists() {
                std::fs::remove_file(&blob)?;
            }
        }

        tracing::debug!(id, removed = removed.len(), "Deleted remote entry");
        Ok(())
    }

    fn list(&self, parent_id: &str) -> Result<Vec<RemoteEntry>, DriveError> {
        let index = self.lock_index()?;
        Self::require_folder(&index, parent_id)?;
        Ok(index
            .entries
            .iter()
            .filter(|(_, record)| record.parents.iter().any(|p| p == parent_id))
            .map(|(id, record)| Self::to_entry(id, record))
            .collect())
    }

    fn content_hash(&self, id: &str) -> Result<Option<String>, DriveError> {
        Ok(self.get(id)?.content_hash)
    }

    fn get(&self, id: &str) -> Result<RemoteEntry, DriveError> {
        let index = self.lock_index()?;
        index
            .entries
            .get(id)
            .map(|record| Self::to_entry(id, record))
            .ok_or_else(|| DriveError::RemoteNotFound { id: id.to_string() })
    }

    fn flush(&self) -> Result<(), DriveError> {
        let index = self.lock_index()?;
        if self.unsaved.load(Ordering::SeqCst) > 0 {
            self.save(&index)?;
        }
        Ok(())
    }

    fn open_read(&self, id: &str) -> Result<Box<dyn Read + Send>, DriveError> {
        let entry = self.get(id)?;
        if entry.is_dir {
            return Err(DriveError::IsDirectory {
                name: entry.name,
                verb: "download",
            });
        }
        let blob = self.blob_path(id);
        let file = File::open(&blob).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DriveError::RemoteNotFound { id: id.to_string() },
            _ => DriveError::Io { source: e },
        })?;
        Ok(Box::new(BufReader::with_capacity(BUF_SIZE, file)))
    }
}

impl Drop for DirectoryStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!(root = %self.root.display(), "Failed to save store index: {}", e);
        }
    }
}
