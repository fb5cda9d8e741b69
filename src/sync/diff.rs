use std::collections::{BTreeMap, VecDeque};

use crate::config::types::ConflictResolution;
use crate::error::DriveError;

use super::compare::ChangeComparer;
use super::conflict::resolve;
use super::plan::{ParentRef, SkipReason, SyncAction};
use super::tree::{join_rel, EntryTree, FileEntry};

/// Which side is the source of truth for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local → remote.
    Upload,
    /// Remote → local.
    Download,
}

#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    pub direction: Direction,
    pub delete_extraneous: bool,
    pub resolution: ConflictResolution,
}

/// A directory present on at least one side, waiting to be compared.
struct DirPair {
    path: String,
    remote: ParentRef,
}

/// Lazily walks a local and a remote tree in lock-step.
///
/// Directories are expanded one at a time from a work-list, so actions for
/// the top of the tree come out before deeper levels have been compared.
/// At each level directories come first, then files, each group in name
/// order. Per-path problems are yielded as errors and the walk continues.
pub struct TreeDiffer {
    local: EntryTree,
    remote: EntryTree,
    comparer: ChangeComparer,
    options: DiffOptions,
    queue: VecDeque<DirPair>,
    pending: VecDeque<Result<SyncAction, DriveError>>,
}

impl TreeDiffer {
    pub fn new(
        mut local: EntryTree,
        mut remote: EntryTree,
        remote_root_id: &str,
        comparer: ChangeComparer,
        options: DiffOptions,
    ) -> Self {
        let pending = local
            .take_problems()
            .into_iter()
            .chain(remote.take_problems())
            .map(Err)
            .collect();
        Self {
            local,
            remote,
            comparer,
            options,
            queue: VecDeque::from([DirPair {
                path: String::new(),
                remote: ParentRef::Known(remote_root_id.to_string()),
            }]),
            pending,
        }
    }

    fn expand(&mut self, dir: DirPair) {
        let mut names: BTreeMap<String, (Option<FileEntry>, Option<FileEntry>)> = BTreeMap::new();
        for entry in self.local.children(&dir.path) {
            names.entry(entry.name.clone()).or_default().0 = Some(entry.clone());
        }
        for entry in self.remote.children(&dir.path) {
            names.entry(entry.name.clone()).or_default().1 = Some(entry.clone());
        }

        let (dirs, files): (Vec<_>, Vec<_>) = names.into_iter().partition(|(_, (l, r))| {
            l.as_ref().is_some_and(|e| e.is_dir) || r.as_ref().is_some_and(|e| e.is_dir)
        });

        for (name, pair) in dirs.into_iter().chain(files) {
            let path = join_rel(&dir.path, &name);
            if self.local.is_blocked(&path) || self.remote.is_blocked(&path) {
                continue;
            }
            let item = match pair {
                (Some(local), None) => self.local_only(local, &dir),
                (None, Some(remote)) => self.remote_only(remote),
                (Some(local), Some(remote)) => self.both(local, remote),
                (None, None) => continue,
            };
            if let Some(item) = item {
                self.pending.push_back(item);
            }
        }
    }

    fn local_only(
        &mut self,
        local: FileEntry,
        dir: &DirPair,
    ) -> Option<Result<SyncAction, DriveError>> {
        match self.options.direction {
            Direction::Upload => {
                if local.is_dir {
                    self.queue.push_back(DirPair {
                        path: local.path.clone(),
                        remote: ParentRef::Created(local.path.clone()),
                    });
                }
                Some(Ok(SyncAction::CreateRemote {
                    local,
                    parent: dir.remote.clone(),
                }))
            }
            Direction::Download if self.options.delete_extraneous => {
                if local.is_dir && self.local.holds_hidden(&local.path) {
                    // Delete what is listed below it, one entry at a time.
                    self.queue.push_back(DirPair {
                        path: local.path.clone(),
                        remote: ParentRef::Created(local.path.clone()),
                    });
                    return Some(Ok(SyncAction::Skip {
                        path: local.path,
                        reason: SkipReason::Extraneous,
                    }));
                }
                Some(Ok(SyncAction::DeleteLocal { local }))
            }
            Direction::Download => Some(Ok(SyncAction::Skip {
                path: local.path,
                reason: SkipReason::Extraneous,
            })),
        }
    }

    fn remote_only(&mut self, remote: FileEntry) -> Option<Result<SyncAction, DriveError>> {
        match self.options.direction {
            Direction::Download => {
                if remote.is_dir {
                    self.queue.push_back(DirPair {
                        path: remote.path.clone(),
                        remote: ParentRef::Known(remote.remote_id().to_string()),
                    });
                    Some(Ok(SyncAction::CreateLocalDir { remote }))
                } else {
                    Some(Ok(SyncAction::DownloadRemote {
                        remote,
                        local: None,
                    }))
                }
            }
            Direction::Upload if self.options.delete_extraneous => {
                if remote.is_dir && self.remote.holds_hidden(&remote.path) {
                    self.queue.push_back(DirPair {
                        path: remote.path.clone(),
                        remote: ParentRef::Known(remote.remote_id().to_string()),
                    });
                    return Some(Ok(SyncAction::Skip {
                        path: remote.path,
                        reason: SkipReason::Extraneous,
                    }));
                }
                Some(Ok(SyncAction::DeleteRemote { remote }))
            }
            Direction::Upload => Some(Ok(SyncAction::Skip {
                path: remote.path,
                reason: SkipReason::Extraneous,
            })),
        }
    }

    fn both(
        &mut self,
        local: FileEntry,
        remote: FileEntry,
    ) -> Option<Result<SyncAction, DriveError>> {
        if local.is_dir != remote.is_dir {
            let reason = if local.is_dir {
                "local is a directory, remote is a file"
            } else {
                "local is a file, remote is a directory"
            };
            return Some(Err(DriveError::StructuralMismatch {
                path: local.path,
                reason: reason.to_string(),
            }));
        }
        if local.is_dir {
            self.queue.push_back(DirPair {
                path: local.path,
                remote: ParentRef::Known(remote.remote_id().to_string()),
            });
            return None;
        }
        Some(self.compare_files(local, remote))
    }

    fn compare_files(
        &self,
        local: FileEntry,
        remote: FileEntry,
    ) -> Result<SyncAction, DriveError> {
        if self.comparer.equal(&local, &remote)? {
            return Ok(SyncAction::Skip {
                path: local.path,
                reason: SkipReason::Unchanged {
                    hash: remote.content_hash.unwrap_or_default(),
                    remote_id: remote.id.unwrap_or_default(),
                },
            });
        }

        let (local_changed, remote_changed) = self.changes_since_sync(&local, &remote)?;
        tracing::trace!(
            path = %local.path,
            local_changed,
            remote_changed,
            "Files differ"
        );

        if local_changed && remote_changed {
            return Ok(resolve(self.options.resolution, local, remote));
        }
        Ok(match self.options.direction {
            Direction::Upload => SyncAction::UpdateRemoteContent { local, remote },
            Direction::Download => SyncAction::DownloadRemote {
                remote,
                local: Some(local),
            },
        })
    }

    /// Which sides changed since the last recorded sync of this path.
    fn changes_since_sync(
        &self,
        local: &FileEntry,
        remote: &FileEntry,
    ) -> Result<(bool, bool), DriveError> {
        let marker = self.comparer.cache().synced(&self.comparer.absolute(local));
        let Some(marker) = marker else {
            // First sync of this path: the source counts as changed, the
            // destination only if it is newer.
            return Ok(match self.options.direction {
                Direction::Upload => (true, remote.modified > local.modified),
                Direction::Download => (local.modified > remote.modified, true),
            });
        };

        let local_changed = self.comparer.local_hash(local)? != marker.hash;
        let remote_changed = if remote.remote_id() != marker.remote_id {
            true
        } else {
            match &remote.content_hash {
                Some(hash) => *hash != marker.hash,
                None => remote.modified > marker.synced_at,
            }
        };
        Ok((local_changed, remote_changed))
    }
}

impl Iterator for TreeDiffer {
    type Item = Result<SyncAction, DriveError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            let dir = self.queue.pop_front()?;
            self.expand(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FingerprintCache;
    use crate::remote::memory::MemoryStore;
    use crate::remote::ROOT_ID;
    use crate::sync::plan::ActionKind;
    use crate::transfer::filter::IgnoreFilter;
    use chrono::{Duration, Utc};
    use std::path::Path;
    use std::sync::Arc;

    fn create_file(dir: &Path, name: &str, content: &[u8]) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
    }

    fn hash(content: &[u8]) -> String {
        blake3::hash(content).to_hex().to_string()
    }

    fn options(direction: Direction) -> DiffOptions {
        DiffOptions {
            direction,
            delete_extraneous: false,
            resolution: ConflictResolution::NoResolution,
        }
    }

    fn diff(
        root: &Path,
        store: &MemoryStore,
        cache: Arc<FingerprintCache>,
        options: DiffOptions,
    ) -> Vec<Result<SyncAction, DriveError>> {
        let filter = IgnoreFilter::empty();
        let local = EntryTree::scan_local(root, &filter).unwrap();
        let remote = EntryTree::scan_remote(store, ROOT_ID, &filter).unwrap();
        let comparer = ChangeComparer::new(cache, root);
        TreeDiffer::new(local, remote, ROOT_ID, comparer, options).collect()
    }

    fn kinds(items: &[Result<SyncAction, DriveError>]) -> Vec<(ActionKind, String)> {
        items
            .iter()
            .filter_map(|item| item.as_ref().ok())
            .map(|a| (a.kind(), a.path().to_string()))
            .collect()
    }

    #[test]
    fn fresh_upload_creates_directories_before_files() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"a");
        create_file(dir.path(), "dir/b.txt", b"b");
        let store = MemoryStore::new();

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Upload),
        );
        assert_eq!(
            kinds(&items),
            vec![
                (ActionKind::CreateRemoteDir, "dir".to_string()),
                (ActionKind::Upload, "a.txt".to_string()),
                (ActionKind::Upload, "dir/b.txt".to_string()),
            ]
        );
        match &items[2] {
            Ok(SyncAction::CreateRemote { parent, .. }) => {
                assert_eq!(parent, &ParentRef::Created("dir".to_string()))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn equal_content_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"same");
        let store = MemoryStore::new();
        let remote = store.seed_file(ROOT_ID, "a.txt", b"same", Utc::now());

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Upload),
        );
        assert_eq!(
            items[0].as_ref().unwrap(),
            &SyncAction::Skip {
                path: "a.txt".to_string(),
                reason: SkipReason::Unchanged {
                    hash: hash(b"same"),
                    remote_id: remote.id,
                },
            }
        );
    }

    #[test]
    fn local_change_since_marker_updates_remote() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"edited locally");
        let store = MemoryStore::new();
        let remote = store.seed_file(ROOT_ID, "a.txt", b"v1", Utc::now());

        let cache = Arc::new(FingerprintCache::in_memory());
        cache.mark_synced(&dir.path().join("a.txt"), &hash(b"v1"), &remote.id);

        let items = diff(dir.path(), &store, cache, options(Direction::Upload));
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::UpdateRemoteContent, "a.txt".to_string())]
        );
    }

    #[test]
    fn remote_change_since_marker_still_pushes_on_upload() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"v1");
        let store = MemoryStore::new();
        let remote = store.seed_file(ROOT_ID, "a.txt", b"edited remotely", Utc::now());

        let cache = Arc::new(FingerprintCache::in_memory());
        cache.mark_synced(&dir.path().join("a.txt"), &hash(b"v1"), &remote.id);

        let items = diff(dir.path(), &store, cache, options(Direction::Upload));
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::UpdateRemoteContent, "a.txt".to_string())]
        );
    }

    #[test]
    fn both_changed_with_keep_remote_downloads() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"local edit");
        let store = MemoryStore::new();
        let remote = store.seed_file(ROOT_ID, "a.txt", b"remote edit, longer", Utc::now());

        let cache = Arc::new(FingerprintCache::in_memory());
        cache.mark_synced(&dir.path().join("a.txt"), &hash(b"v0"), &remote.id);

        let mut opts = options(Direction::Upload);
        opts.resolution = ConflictResolution::KeepRemote;
        let items = diff(dir.path(), &store, cache, opts);
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::UpdateLocal, "a.txt".to_string())]
        );
        assert!(matches!(
            items[0],
            Ok(SyncAction::DownloadRemote { local: Some(_), .. })
        ));
    }

    #[test]
    fn both_changed_without_resolution_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"local edit");
        let store = MemoryStore::new();
        let remote = store.seed_file(ROOT_ID, "a.txt", b"remote edit", Utc::now());

        let cache = Arc::new(FingerprintCache::in_memory());
        cache.mark_synced(&dir.path().join("a.txt"), &hash(b"v0"), &remote.id);

        let items = diff(dir.path(), &store, cache, options(Direction::Upload));
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::Conflict, "a.txt".to_string())]
        );
    }

    #[test]
    fn without_marker_a_newer_remote_counts_as_changed() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"local");
        let store = MemoryStore::new();
        store.seed_file(
            ROOT_ID,
            "a.txt",
            b"remote",
            Utc::now() + Duration::hours(1),
        );

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Upload),
        );
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::Conflict, "a.txt".to_string())]
        );
    }

    #[test]
    fn without_marker_an_older_remote_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a.txt", b"local");
        let store = MemoryStore::new();
        store.seed_file(
            ROOT_ID,
            "a.txt",
            b"remote",
            Utc::now() - Duration::hours(1),
        );

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Upload),
        );
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::UpdateRemoteContent, "a.txt".to_string())]
        );
    }

    #[test]
    fn extraneous_remote_file_deleted_only_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.seed_file(ROOT_ID, "orphan.txt", b"x", Utc::now());

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Upload),
        );
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::Skip, "orphan.txt".to_string())]
        );

        let mut opts = options(Direction::Upload);
        opts.delete_extraneous = true;
        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            opts,
        );
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::DeleteRemote, "orphan.txt".to_string())]
        );
    }

    #[test]
    fn extraneous_local_directory_with_ignored_entries_is_emptied_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), ".drivesyncignore", b"*.swp\n");
        create_file(dir.path(), "stale/notes.swp", b"n");
        create_file(dir.path(), "stale/old.txt", b"o");
        create_file(dir.path(), "gone/x.txt", b"x");
        create_file(dir.path(), "top.swp", b"t");
        let store = MemoryStore::new();

        let filter = IgnoreFilter::for_root(dir.path(), &[]).unwrap();
        let local = EntryTree::scan_local(dir.path(), &filter).unwrap();
        let remote = EntryTree::scan_remote(&store, ROOT_ID, &filter).unwrap();
        let comparer = ChangeComparer::new(Arc::new(FingerprintCache::in_memory()), dir.path());
        let mut opts = options(Direction::Download);
        opts.delete_extraneous = true;
        let items: Vec<_> = TreeDiffer::new(local, remote, ROOT_ID, comparer, opts).collect();

        assert_eq!(
            kinds(&items),
            vec![
                (ActionKind::DeleteLocal, "gone".to_string()),
                (ActionKind::Skip, "stale".to_string()),
                (ActionKind::DeleteLocal, "stale/old.txt".to_string()),
            ]
        );
    }

    #[test]
    fn extraneous_remote_folder_with_ignored_entries_is_emptied_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let cache = store.seed_folder(ROOT_ID, "cache");
        store.seed_file(&cache.id, "scratch.tmp", b"t", Utc::now());
        store.seed_file(&cache.id, "old.txt", b"o", Utc::now());

        let filter = IgnoreFilter::new(&["*.tmp".to_string()]).unwrap();
        let local = EntryTree::scan_local(dir.path(), &filter).unwrap();
        let remote = EntryTree::scan_remote(&store, ROOT_ID, &filter).unwrap();
        let comparer = ChangeComparer::new(Arc::new(FingerprintCache::in_memory()), dir.path());
        let mut opts = options(Direction::Upload);
        opts.delete_extraneous = true;
        let items: Vec<_> = TreeDiffer::new(local, remote, ROOT_ID, comparer, opts).collect();

        assert_eq!(
            kinds(&items),
            vec![
                (ActionKind::Skip, "cache".to_string()),
                (ActionKind::DeleteRemote, "cache/old.txt".to_string()),
            ]
        );
    }

    #[test]
    fn type_mismatch_is_reported_and_walk_continues() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "thing/inner.txt", b"i");
        create_file(dir.path(), "z.txt", b"z");
        let store = MemoryStore::new();
        store.seed_file(ROOT_ID, "thing", b"file", Utc::now());

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Upload),
        );
        assert!(items.iter().any(|item| matches!(
            item,
            Err(DriveError::StructuralMismatch { path, reason })
                if path == "thing" && reason == "local is a directory, remote is a file"
        )));
        assert_eq!(
            kinds(&items),
            vec![(ActionKind::Upload, "z.txt".to_string())]
        );
    }

    #[test]
    fn duplicate_remote_names_are_reported_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "twin.txt", b"local");
        let store = MemoryStore::new();
        store.seed_file(ROOT_ID, "twin.txt", b"1", Utc::now());
        store.seed_file(ROOT_ID, "twin.txt", b"2", Utc::now());

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Upload),
        );
        assert!(matches!(
            items.as_slice(),
            [Err(DriveError::DuplicateName { .. })]
        ));
    }

    #[test]
    fn download_creates_local_directories_before_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let docs = store.seed_folder(ROOT_ID, "docs");
        store.seed_file(&docs.id, "readme.md", b"hi", Utc::now());
        store.seed_file(ROOT_ID, "top.txt", b"t", Utc::now());
        create_file(dir.path(), "local-only.txt", b"l");

        let items = diff(
            dir.path(),
            &store,
            Arc::new(FingerprintCache::in_memory()),
            options(Direction::Download),
        );
        assert_eq!(
            kinds(&items),
            vec![
                (ActionKind::CreateLocalDir, "docs".to_string()),
                (ActionKind::Skip, "local-only.txt".to_string()),
                (ActionKind::Download, "top.txt".to_string()),
                (ActionKind::Download, "docs/readme.md".to_string()),
            ]
        );
    }

    #[test]
    fn differ_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a/b/c/d.txt", b"deep");
        let store = MemoryStore::new();

        let filter = IgnoreFilter::empty();
        let local = EntryTree::scan_local(dir.path(), &filter).unwrap();
        let remote = EntryTree::scan_remote(&store, ROOT_ID, &filter).unwrap();
        let comparer = ChangeComparer::new(Arc::new(FingerprintCache::in_memory()), dir.path());
        let mut differ = TreeDiffer::new(local, remote, ROOT_ID, comparer, options(Direction::Upload));

        let first = differ.next().unwrap().unwrap();
        assert_eq!(first.path(), "a");
        // Only the root level has been expanded so far.
        assert_eq!(differ.queue.len(), 1);
        assert!(differ.pending.is_empty());
    }
}
