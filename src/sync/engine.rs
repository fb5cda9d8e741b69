use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;

use crate::cache::FingerprintCache;
use crate::error::DriveError;
use crate::progress::bar::create_sync_progress;
use crate::remote::{NewEntry, RemoteStore};
use crate::transfer::copy::{download_file, upload_new, upload_update};
use crate::transfer::filter::IgnoreFilter;
use crate::transfer::scheduler::{ActionRunner, Outcome, StopReason, TransferScheduler};

use super::compare::ChangeComparer;
use super::diff::{DiffOptions, Direction, TreeDiffer};
use super::plan::{error_path, ActionRecord, ParentRef, SkipReason, SyncAction, SyncReport};
use super::tree::{EntryTree, FileEntry};

/// Save the cache after this many completed actions.
const CACHE_SAVE_INTERVAL: u64 = 256;

/// Where a sync run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Scanning,
    Diffing,
    DryRunReport,
    Executing,
    Reporting,
    Done,
}

/// Everything one sync invocation needs, passed explicitly.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub local_root: PathBuf,
    pub remote_root_id: String,
    pub diff: DiffOptions,
    pub dry_run: bool,
    pub concurrency: usize,
    pub exclude: Vec<String>,
    pub show_progress: bool,
}

/// Performs sync actions against the store and the local tree, and keeps
/// the fingerprint cache in step with every success.
pub struct SyncRunner {
    store: Arc<dyn RemoteStore>,
    cache: Arc<FingerprintCache>,
    local_root: PathBuf,
    /// Remote ids of folders created during this run, by relative path.
    created: DashMap<String, String>,
    progress: ProgressBar,
}

impl SyncRunner {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<FingerprintCache>,
        local_root: &Path,
        progress: ProgressBar,
    ) -> Self {
        Self {
            store,
            cache,
            local_root: local_root.to_path_buf(),
            created: DashMap::new(),
            progress,
        }
    }

    fn resolve_parent(&self, parent: &ParentRef) -> Result<String, DriveError> {
        match parent {
            ParentRef::Known(id) => Ok(id.clone()),
            ParentRef::Created(path) => self
                .created
                .get(path)
                .map(|id| id.clone())
                .ok_or_else(|| {
                    DriveError::Sync(format!("parent folder '{}' was not created", path))
                }),
        }
    }

    /// Record what both sides now agree on for an uploaded file.
    fn record_upload(&self, local: &FileEntry, hash: &str, bytes: u64, remote_id: &str) {
        let path = self.local_root.join(&local.path);
        let mtime = SystemTime::from(local.modified);
        // Only trust the fingerprint if the file did not change while it was read.
        let unchanged = std::fs::metadata(&path)
            .and_then(|m| Ok(m.len() == bytes && m.modified()? == mtime))
            .unwrap_or(false);
        if unchanged {
            self.cache.store(&path, bytes, mtime, hash);
        }
        self.cache.mark_synced(&path, hash, remote_id);
    }

    fn upload(&self, local: &FileEntry, parent: &ParentRef) -> Result<u64, DriveError> {
        let parent_id = self.resolve_parent(parent)?;
        if local.is_dir {
            let entry = NewEntry::folder(&local.name, vec![parent_id]);
            let created = self.store.create(&entry, None)?;
            tracing::debug!(path = %local.path, id = %created.id, "Created remote folder");
            self.created.insert(local.path.clone(), created.id);
            return Ok(0);
        }

        let source = self.local_root.join(&local.path);
        let entry = NewEntry::file(&local.name, vec![parent_id], Some(local.modified));
        let uploaded = upload_new(self.store.as_ref(), &source, &entry, &self.progress)?;
        self.record_upload(local, &uploaded.hash, uploaded.bytes, &uploaded.entry.id);
        Ok(uploaded.bytes)
    }

    fn update(&self, local: &FileEntry, remote: &FileEntry) -> Result<u64, DriveError> {
        let source = self.local_root.join(&local.path);
        let uploaded = upload_update(
            self.store.as_ref(),
            &source,
            remote.remote_id(),
            Some(local.modified),
            &self.progress,
        )?;
        self.record_upload(local, &uploaded.hash, uploaded.bytes, &uploaded.entry.id);
        Ok(uploaded.bytes)
    }

    fn download(&self, remote: &FileEntry) -> Result<u64, DriveError> {
        let dest = self.local_root.join(&remote.path);
        let downloaded = download_file(
            self.store.as_ref(),
            remote.remote_id(),
            &dest,
            Some(remote.modified),
            &self.progress,
        )?;
        let metadata = std::fs::metadata(&dest).map_err(|e| DriveError::from_io(e, &dest))?;
        self.cache
            .store(&dest, metadata.len(), metadata.modified()?, &downloaded.hash);
        self.cache
            .mark_synced(&dest, &downloaded.hash, remote.remote_id());
        Ok(downloaded.bytes)
    }

    fn delete_local(&self, local: &FileEntry) -> Result<u64, DriveError> {
        let path = self.local_root.join(&local.path);
        let result = if local.is_dir {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|e| DriveError::from_io(e, &path))?;
        self.forget(&path, local.is_dir);
        Ok(0)
    }

    fn forget(&self, path: &Path, is_dir: bool) {
        if is_dir {
            self.cache.forget_tree(path);
        } else {
            self.cache.forget(path);
        }
    }
}

impl ActionRunner for SyncRunner {
    fn run(&self, action: &SyncAction) -> Result<u64, DriveError> {
        let bytes = match action {
            SyncAction::CreateRemote { local, parent } => self.upload(local, parent)?,
            SyncAction::UpdateRemoteContent { local, remote } => self.update(local, remote)?,
            SyncAction::DeleteRemote { remote } => {
                self.store.delete(remote.remote_id())?;
                self.forget(&self.local_root.join(&remote.path), remote.is_dir);
                0
            }
            SyncAction::CreateLocalDir { remote } => {
                let path = self.local_root.join(&remote.path);
                std::fs::create_dir_all(&path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::PermissionDenied => {
                        DriveError::DestinationNotWritable { path: path.clone() }
                    }
                    _ => DriveError::Io { source: e },
                })?;
                0
            }
            SyncAction::DownloadRemote { remote, .. } => self.download(remote)?,
            SyncAction::DeleteLocal { local } => self.delete_local(local)?,
            SyncAction::Skip {
                path,
                reason: SkipReason::Unchanged { hash, remote_id },
            } => {
                self.cache
                    .mark_synced(&self.local_root.join(path), hash, remote_id);
                0
            }
            SyncAction::Skip { .. } | SyncAction::Conflict { .. } => 0,
        };
        if !action.kind().is_immediate() {
            self.progress.set_message(action.path().to_string());
        }
        Ok(bytes)
    }
}

/// Drives one sync: scan both trees, diff them, then either report the
/// plan or execute it through the scheduler.
pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    cache: Arc<FingerprintCache>,
    cancel: CancellationToken,
    phase: SyncPhase,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        cache: Arc<FingerprintCache>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            cancel,
            phase: SyncPhase::Scanning,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    fn enter(&mut self, phase: SyncPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "Sync phase");
        self.phase = phase;
    }

    /// Run a full sync between `options.local_root` and the remote folder.
    ///
    /// Scan failures are returned as errors. Per-path failures, conflicts
    /// and a fatal stop are carried in the report.
    pub async fn run(&mut self, options: &SyncOptions) -> Result<SyncReport, DriveError> {
        self.enter(SyncPhase::Scanning);
        let filter = IgnoreFilter::for_root(&options.local_root, &options.exclude)?;
        let local = if options.dry_run
            && options.diff.direction == Direction::Download
            && !options.local_root.exists()
        {
            tracing::debug!(root = %options.local_root.display(), "Local root does not exist yet");
            EntryTree::empty()
        } else {
            EntryTree::scan_local(&options.local_root, &filter)?
        };
        let remote = EntryTree::scan_remote(self.store.as_ref(), &options.remote_root_id, &filter)?;
        tracing::info!(
            local = local.len(),
            remote = remote.len(),
            "Scanned both trees"
        );

        self.enter(SyncPhase::Diffing);
        let comparer = ChangeComparer::new(self.cache.clone(), &options.local_root);
        let differ = TreeDiffer::new(
            local,
            remote,
            &options.remote_root_id,
            comparer,
            options.diff,
        );

        if options.dry_run {
            self.enter(SyncPhase::DryRunReport);
            let report = plan_only(differ);
            self.enter(SyncPhase::Done);
            return Ok(report);
        }

        self.cache
            .record_root(&options.remote_root_id, &options.local_root);
        let report = self
            .execute(
                differ,
                &options.local_root,
                options.concurrency,
                options.show_progress,
            )
            .await?;
        Ok(report)
    }

    /// Execute a stream of actions rooted at `local_root`.
    pub async fn execute<I>(
        &mut self,
        actions: I,
        local_root: &Path,
        concurrency: usize,
        show_progress: bool,
    ) -> Result<SyncReport, DriveError>
    where
        I: IntoIterator<Item = Result<SyncAction, DriveError>>,
    {
        self.enter(SyncPhase::Executing);
        let progress = create_sync_progress(!show_progress);
        let runner = Arc::new(SyncRunner::new(
            self.store.clone(),
            self.cache.clone(),
            local_root,
            progress.clone(),
        ));
        let scheduler = TransferScheduler::new(concurrency, self.cancel.clone());

        let mut report = SyncReport::default();
        let cache = self.cache.clone();
        let store = self.store.clone();
        let mut since_save = 0u64;
        let summary = scheduler
            .execute(actions, runner, |outcome: Outcome| {
                match (outcome.result, outcome.kind) {
                    (Ok(bytes), Some(kind)) => {
                        let record = ActionRecord {
                            kind,
                            path: outcome.path,
                        };
                        report.record(record, bytes);
                    }
                    (Ok(_), None) => {}
                    (Err(e), _) => {
                        progress.suspend(|| {
                            tracing::error!(path = %outcome.path, "{}", e);
                        });
                        report.record_failure(outcome.path, &e);
                        if e.is_fatal() && report.fatal.is_none() {
                            report.fatal = Some(e);
                        }
                    }
                }
                since_save += 1;
                if since_save >= CACHE_SAVE_INTERVAL && cache.is_dirty() {
                    since_save = 0;
                    // Markers name remote ids, so the store goes first.
                    if let Err(e) = store.flush().and_then(|()| cache.save()) {
                        tracing::warn!("Failed to save sync state: {}", e);
                    }
                }
            })
            .await;
        progress.finish_and_clear();

        self.enter(SyncPhase::Reporting);
        report.interrupted = summary.stopped.is_some();
        if summary.stopped == Some(StopReason::Cancelled) {
            tracing::warn!("Interrupted; in-flight transfers were drained");
        }
        self.store.flush()?;
        self.cache.save()?;
        self.enter(SyncPhase::Done);
        Ok(report)
    }
}

/// Collect the plan without touching either side.
fn plan_only<I>(actions: I) -> SyncReport
where
    I: IntoIterator<Item = Result<SyncAction, DriveError>>,
{
    let mut report = SyncReport {
        dry_run: true,
        ..Default::default()
    };
    for item in actions {
        match item {
            Ok(action) => {
                report.record(action.record(), action.transfer_size());
                report.planned.push(action);
            }
            Err(e) => {
                let path = error_path(&e);
                report.record_failure(path, &e);
            }
        }
    }
    report
}
