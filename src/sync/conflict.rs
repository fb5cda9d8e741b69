use crate::config::types::ConflictResolution;

use super::plan::SyncAction;
use super::tree::FileEntry;

/// Choose what to do with a path whose local and remote copies both
/// changed since the last sync.
///
/// `KeepLargest` compares sizes; a tie keeps the local copy.
pub fn resolve(policy: ConflictResolution, local: FileEntry, remote: FileEntry) -> SyncAction {
    let keep_local = match policy {
        ConflictResolution::NoResolution => {
            return SyncAction::Conflict { local, remote };
        }
        ConflictResolution::KeepLocal => true,
        ConflictResolution::KeepRemote => false,
        ConflictResolution::KeepLargest => local.size >= remote.size,
    };

    if keep_local {
        SyncAction::UpdateRemoteContent { local, remote }
    } else {
        SyncAction::DownloadRemote {
            remote,
            local: Some(local),
        }
    }
}
