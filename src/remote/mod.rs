pub mod directory;
#[cfg(test)]
pub mod memory;

use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DriveError;

/// Id of the top-level folder of every store.
pub const ROOT_ID: &str = "root";

/// Metadata of a file or folder in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub parents: Vec<String>,
    pub is_dir: bool,
    pub size: u64,
    pub content_hash: Option<String>,
    pub modified: DateTime<Utc>,
}

/// Description of an entry to create.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub name: String,
    pub parents: Vec<String>,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

impl NewEntry {
    pub fn folder(name: impl Into<String>, parents: Vec<String>) -> Self {
        Self {
            name: name.into(),
            parents,
            is_dir: true,
            modified: None,
        }
    }

    pub fn file(
        name: impl Into<String>,
        parents: Vec<String>,
        modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            name: name.into(),
            parents,
            is_dir: false,
            modified,
        }
    }
}

/// The remote object store the sync engine talks to.
///
/// Entries are always addressed by their opaque id; names are not unique
/// within a folder. Pagination, retries and credentials are the
/// implementation's business.
///
/// Synchronous trait: the transfer scheduler runs each call on the blocking
/// pool.
pub trait RemoteStore: Send + Sync {
    /// Create a file (with content) or folder under `entry.parents`.
    fn create(
        &self,
        entry: &NewEntry,
        content: Option<&mut dyn Read>,
    ) -> Result<RemoteEntry, DriveError>;

    /// Replace the content of an existing file.
    fn update(
        &self,
        id: &str,
        content: &mut dyn Read,
        modified: Option<DateTime<Utc>>,
    ) -> Result<RemoteEntry, DriveError>;

    /// Delete an entry; deleting a folder deletes its subtree.
    fn delete(&self, id: &str) -> Result<(), DriveError>;

    /// List the direct children of a folder.
    fn list(&self, parent_id: &str) -> Result<Vec<RemoteEntry>, DriveError>;

    /// Content hash of a file, if the store knows one.
    fn content_hash(&self, id: &str) -> Result<Option<String>, DriveError>;

    /// Metadata of a single entry.
    fn get(&self, id: &str) -> Result<RemoteEntry, DriveError>;

    /// Open a file's content for reading.
    fn open_read(&self, id: &str) -> Result<Box<dyn Read + Send>, DriveError>;

    /// Persist anything the store has buffered.
    fn flush(&self) -> Result<(), DriveError> {
        Ok(())
    }
}
