use std::fmt;

use bytesize::ByteSize;

use crate::error::DriveError;

use super::tree::FileEntry;

/// Where a new remote entry goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    /// An existing remote folder.
    Known(String),
    /// A folder created earlier in the same run, by relative path.
    Created(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Both sides hold the same content.
    Unchanged { hash: String, remote_id: String },
    /// Only the destination has it and deletion was not requested.
    Extraneous,
}

/// One step of a sync, produced by the differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Local entry missing remotely: upload the file or create the folder.
    CreateRemote { local: FileEntry, parent: ParentRef },
    /// Overwrite the remote file with local content.
    UpdateRemoteContent { local: FileEntry, remote: FileEntry },
    /// Remote entry with no local counterpart.
    DeleteRemote { remote: FileEntry },
    /// Remote folder missing locally.
    CreateLocalDir { remote: FileEntry },
    /// Download into a new or existing local file.
    DownloadRemote {
        remote: FileEntry,
        local: Option<FileEntry>,
    },
    /// Local entry with no remote counterpart.
    DeleteLocal { local: FileEntry },
    Skip { path: String, reason: SkipReason },
    /// Both sides changed and no resolution was chosen.
    Conflict { local: FileEntry, remote: FileEntry },
}

/// Display and report category of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    CreateRemoteDir,
    Upload,
    UpdateRemoteContent,
    DeleteRemote,
    CreateLocalDir,
    Download,
    /// Download over an existing local file.
    UpdateLocal,
    DeleteLocal,
    Skip,
    Conflict,
}

impl ActionKind {
    pub fn label(self) -> &'static str {
        match self {
            ActionKind::CreateRemoteDir | ActionKind::CreateLocalDir => "MKDIR",
            ActionKind::Upload => "UPLOAD",
            ActionKind::UpdateRemoteContent => "UPDATE",
            ActionKind::DeleteRemote | ActionKind::DeleteLocal => "DELETE",
            ActionKind::Download | ActionKind::UpdateLocal => "DOWNLOAD",
            ActionKind::Skip => "SKIP",
            ActionKind::Conflict => "CONFLICT",
        }
    }

    /// Directory creation must finish before anything below it runs.
    pub fn creates_directory(self) -> bool {
        matches!(self, ActionKind::CreateRemoteDir | ActionKind::CreateLocalDir)
    }

    /// Actions that need no store or filesystem call.
    pub fn is_immediate(self) -> bool {
        matches!(self, ActionKind::Skip | ActionKind::Conflict)
    }
}

impl SyncAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            SyncAction::CreateRemote { local, .. } if local.is_dir => ActionKind::CreateRemoteDir,
            SyncAction::CreateRemote { .. } => ActionKind::Upload,
            SyncAction::UpdateRemoteContent { .. } => ActionKind::UpdateRemoteContent,
            SyncAction::DeleteRemote { .. } => ActionKind::DeleteRemote,
            SyncAction::CreateLocalDir { .. } => ActionKind::CreateLocalDir,
            SyncAction::DownloadRemote { local: Some(_), .. } => ActionKind::UpdateLocal,
            SyncAction::DownloadRemote { .. } => ActionKind::Download,
            SyncAction::DeleteLocal { .. } => ActionKind::DeleteLocal,
            SyncAction::Skip { .. } => ActionKind::Skip,
            SyncAction::Conflict { .. } => ActionKind::Conflict,
        }
    }

    /// Relative path the action applies to.
    pub fn path(&self) -> &str {
        match self {
            SyncAction::CreateRemote { local, .. }
            | SyncAction::UpdateRemoteContent { local, .. }
            | SyncAction::DeleteLocal { local }
            | SyncAction::Conflict { local, .. } => &local.path,
            SyncAction::DeleteRemote { remote }
            | SyncAction::CreateLocalDir { remote }
            | SyncAction::DownloadRemote { remote, .. } => &remote.path,
            SyncAction::Skip { path, .. } => path,
        }
    }

    /// Bytes this action moves over the wire.
    pub fn transfer_size(&self) -> u64 {
        match self {
            SyncAction::CreateRemote { local, .. } if !local.is_dir => local.size,
            SyncAction::UpdateRemoteContent { local, .. } => local.size,
            SyncAction::DownloadRemote { remote, .. } => remote.size,
            _ => 0,
        }
    }

    pub fn record(&self) -> ActionRecord {
        ActionRecord {
            kind: self.kind(),
            path: self.path().to_string(),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.kind().label();
        match self {
            SyncAction::CreateRemote { local, .. } if local.is_dir => {
                write!(f, "  {:<8} {}/", label, local.path)
            }
            SyncAction::CreateLocalDir { remote } => write!(f, "  {:<8} {}/", label, remote.path),
            SyncAction::Skip { path, reason } => {
                let why = match reason {
                    SkipReason::Unchanged { .. } => "unchanged",
                    SkipReason::Extraneous => "extraneous",
                };
                write!(f, "  {:<8} {} ({})", label, path, why)
            }
            SyncAction::Conflict { local, remote } => write!(
                f,
                "  {:<8} {} (local {}, remote {})",
                label,
                local.path,
                ByteSize(local.size),
                ByteSize(remote.size)
            ),
            SyncAction::DeleteRemote { .. } | SyncAction::DeleteLocal { .. } => {
                write!(f, "  {:<8} {}", label, self.path())
            }
            _ => write!(
                f,
                "  {:<8} {} ({})",
                label,
                self.path(),
                ByteSize(self.transfer_size())
            ),
        }
    }
}

/// What happened (or would happen) to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub path: String,
}

/// A path that could not be synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub path: String,
    pub error: String,
}

/// Result of a sync run, or the plan of a dry run.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub dry_run: bool,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub bytes_transferred: u64,
    pub actions: Vec<ActionRecord>,
    pub failures: Vec<Failure>,
    /// Every planned action, in differ order (dry run only).
    pub planned: Vec<SyncAction>,
    /// True when dispatch stopped early (fatal error or interrupt).
    pub interrupted: bool,
    /// The error that stopped dispatch, if any.
    pub fatal: Option<DriveError>,
}

impl SyncReport {
    /// Count one completed (or, for a dry run, planned) action.
    pub fn record(&mut self, record: ActionRecord, bytes: u64) {
        match record.kind {
            ActionKind::CreateRemoteDir
            | ActionKind::Upload
            | ActionKind::CreateLocalDir
            | ActionKind::Download => self.created += 1,
            ActionKind::UpdateRemoteContent | ActionKind::UpdateLocal => self.updated += 1,
            ActionKind::DeleteRemote | ActionKind::DeleteLocal => self.deleted += 1,
            ActionKind::Skip => self.skipped += 1,
            ActionKind::Conflict => self.conflicts += 1,
        }
        self.bytes_transferred += bytes;
        self.actions.push(record);
    }

    pub fn record_failure(&mut self, path: String, error: &DriveError) {
        self.failures.push(Failure {
            path,
            error: error.to_string(),
        });
    }

    pub fn failed(&self) -> u64 {
        self.failures.len() as u64
    }

    /// Returns true if anything would change on either side.
    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }

    /// Print the planned actions of a dry run to stderr.
    pub fn print_plan(&self) {
        eprintln!("Sync plan:");
        for action in &self.planned {
            eprintln!("{}", action);
        }
        eprintln!();
    }

    /// Print the summary line (and failures) to stderr.
    pub fn print_summary(&self) {
        for failure in &self.failures {
            eprintln!("  FAILED   {}: {}", failure.path, failure.error);
        }
        let verb = if self.dry_run { "Planned" } else { "Sync complete" };
        eprintln!(
            "{}: {} created, {} updated, {} deleted, {} skipped, {} conflicts, {} failed ({})",
            verb,
            self.created,
            self.updated,
            self.deleted,
            self.skipped,
            self.conflicts,
            self.failed(),
            ByteSize(self.bytes_transferred),
        );
        if self.interrupted {
            eprintln!("Stopped early; run the same command again to continue.");
        }
    }
}

/// Best-effort relative path carried by a per-path error.
pub fn error_path(err: &DriveError) -> String {
    match err {
        DriveError::StructuralMismatch { path, .. }
        | DriveError::DuplicateName { path }
        | DriveError::InvalidName { path } => path.clone(),
        DriveError::SourceNotFound { path }
        | DriveError::PermissionDenied { path }
        | DriveError::DestinationNotWritable { path } => path.display().to_string(),
        _ => String::new(),
    }
}
