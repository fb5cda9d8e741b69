use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::DriveError;
use crate::remote::{RemoteEntry, RemoteStore};
use crate::transfer::filter::IgnoreFilter;

/// A file or directory on either side of a sync.
///
/// `path` is relative to the sync root and `/`-separated. `id` and
/// `parent_id` are only set for remote entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub id: Option<String>,
    pub parent_id: Option<String>,
}

impl FileEntry {
    fn from_remote(remote: RemoteEntry, path: String, parent_id: &str) -> Self {
        Self {
            path,
            name: remote.name,
            is_dir: remote.is_dir,
            size: remote.size,
            modified: remote.modified,
            content_hash: remote.content_hash,
            id: Some(remote.id),
            parent_id: Some(parent_id.to_string()),
        }
    }

    /// Remote id, or an empty string for local entries.
    pub fn remote_id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }
}

/// Join a parent relative path and a child name.
pub fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// One side of a sync, materialized.
///
/// Children are indexed by the relative path of their directory (`""` for
/// the root) and sorted by name. Paths that cannot be synced (duplicate or
/// unrepresentable names) are recorded in `problems` and listed in
/// `blocked`, so neither side acts on them. Every directory above an
/// ignored or blocked entry is listed in `shielded` and must never be
/// removed as a whole.
#[derive(Debug, Default)]
pub struct EntryTree {
    children: HashMap<String, Vec<FileEntry>>,
    blocked: HashSet<String>,
    shielded: HashSet<String>,
    problems: Vec<DriveError>,
}

impl EntryTree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Direct children of the directory at `dir` (relative path).
    pub fn children(&self, dir: &str) -> &[FileEntry] {
        self.children.get(dir).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_blocked(&self, path: &str) -> bool {
        self.blocked.contains(path)
    }

    /// Whether the directory at `dir` holds entries this tree does not list.
    pub fn holds_hidden(&self, dir: &str) -> bool {
        self.shielded.contains(dir)
    }

    pub fn take_problems(&mut self) -> Vec<DriveError> {
        std::mem::take(&mut self.problems)
    }

    /// Number of entries (files and directories).
    pub fn len(&self) -> usize {
        self.children.values().map(Vec::len).sum()
    }

    fn insert(&mut self, dir: &str, entry: FileEntry) {
        self.children.entry(dir.to_string()).or_default().push(entry);
    }

    fn block(&mut self, path: String, problem: DriveError) {
        tracing::warn!(path = %path, "{}", problem);
        self.shield(&path);
        self.blocked.insert(path);
        self.problems.push(problem);
    }

    /// Mark every directory above `path` as holding a hidden entry.
    fn shield(&mut self, path: &str) {
        let mut current = path;
        while let Some((parent, _)) = current.rsplit_once('/') {
            if !self.shielded.insert(parent.to_string()) {
                break;
            }
            current = parent;
        }
    }

    fn sort(&mut self) {
        for entries in self.children.values_mut() {
            entries.sort_by(|a, b| a.name.cmp(&b.name));
        }
    }

    /// Walk the local tree under `root`.
    ///
    /// Ignored entries are pruned. Any I/O error while walking is fatal;
    /// names that are not valid UTF-8 are recorded as problems.
    pub fn scan_local(root: &Path, filter: &IgnoreFilter) -> Result<Self, DriveError> {
        if !root.exists() {
            return Err(DriveError::SourceNotFound {
                path: root.to_path_buf(),
            });
        }
        if !root.is_dir() {
            return Err(DriveError::Sync(format!(
                "'{}' is not a directory",
                root.display()
            )));
        }

        let mut tree = Self::empty();
        let mut ignored: Vec<String> = Vec::new();
        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| match e.path().strip_prefix(root) {
                Ok(rel) if filter.is_ignored(rel, e.file_type().is_dir()) => {
                    ignored.push(rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
                    false
                }
                _ => true,
            });

        while let Some(entry) = walker.next() {
            let entry = entry?;
            let rel = entry.path().strip_prefix(root)?;
            let file_type = entry.file_type();

            let Some(rel_str) = rel.to_str() else {
                tree.block(
                    rel.to_string_lossy().into_owned(),
                    DriveError::InvalidName {
                        path: rel.to_string_lossy().into_owned(),
                    },
                );
                if file_type.is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            };
            if !file_type.is_dir() && !file_type.is_file() {
                tracing::debug!(path = %rel_str, "Skipping special file");
                continue;
            }

            let rel_path = rel_str.replace(std::path::MAIN_SEPARATOR, "/");
            let (dir, name) = match rel_path.rsplit_once('/') {
                Some((dir, name)) => (dir.to_string(), name.to_string()),
                None => (String::new(), rel_path.clone()),
            };
            let metadata = entry.metadata()?;
            let modified = metadata
                .modified()
                .map_err(|e| DriveError::from_io(e, entry.path()))?;

            tree.insert(
                &dir,
                FileEntry {
                    path: rel_path,
                    name,
                    is_dir: file_type.is_dir(),
                    size: if file_type.is_dir() { 0 } else { metadata.len() },
                    modified: DateTime::<Utc>::from(modified),
                    content_hash: None,
                    id: None,
                    parent_id: None,
                },
            );
        }
        drop(walker);

        for path in &ignored {
            tree.shield(path);
        }
        tree.sort();
        tracing::debug!(
            root = %root.display(),
            entries = tree.len(),
            ignored = ignored.len(),
            "Scanned local tree"
        );
        Ok(tree)
    }

    /// List the remote tree under folder `root_id`, breadth first.
    ///
    /// Listing errors are fatal. Duplicate names at one level and names
    /// the local filesystem cannot hold are recorded as problems.
    pub fn scan_remote(
        store: &dyn RemoteStore,
        root_id: &str,
        filter: &IgnoreFilter,
    ) -> Result<Self, DriveError> {
        let root = store.get(root_id)?;
        if !root.is_dir {
            return Err(DriveError::Sync(format!(
                "'{}' ({}) is not a folder",
                root.name, root_id
            )));
        }

        let mut tree = Self::empty();
        let mut queue = VecDeque::from([(root_id.to_string(), String::new())]);

        while let Some((folder_id, dir)) = queue.pop_front() {
            let listing = store.list(&folder_id)?;

            let mut seen: HashMap<&str, usize> = HashMap::new();
            for entry in &listing {
                *seen.entry(entry.name.as_str()).or_default() += 1;
            }
            let duplicates: HashSet<String> = seen
                .into_iter()
                .filter(|(_, count)| *count > 1)
                .map(|(name, _)| name.to_string())
                .collect();

            for entry in listing {
                let path = join_rel(&dir, &entry.name);
                if !is_representable(&entry.name) {
                    tree.block(path.clone(), DriveError::InvalidName { path });
                    continue;
                }
                if duplicates.contains(&entry.name) {
                    if !tree.is_blocked(&path) {
                        tree.block(path.clone(), DriveError::DuplicateName { path });
                    }
                    continue;
                }
                if filter.is_ignored(Path::new(&path), entry.is_dir) {
                    tree.shield(&path);
                    continue;
                }
                if entry.is_dir {
                    queue.push_back((entry.id.clone(), path.clone()));
                }
                tree.insert(&dir, FileEntry::from_remote(entry, path, &folder_id));
            }
        }

        tree.sort();
        tracing::debug!(root = root_id, entries = tree.len(), "Scanned remote tree");
        Ok(tree)
    }
}

/// Whether a remote name can be used as a local file name.
fn is_representable(name: &str) -> bool {
    !(name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
        || (cfg!(windows) && name.contains('\\')))
}
