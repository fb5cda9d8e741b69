use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("Source not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Destination not writable: {}", path.display())]
    DestinationNotWritable { path: PathBuf },

    #[error("Permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("'{name}' is a directory, use --recursive to {verb} directories")]
    IsDirectory { name: String, verb: &'static str },

    #[error("File already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chunk size is too big, max chunk size for this computer is {max}")]
    ChunkSizeTooLarge { max: u64 },

    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Remote entry not found: {id}")]
    RemoteNotFound { id: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    #[error("{id} is a sync directory, use 'sync upload' instead")]
    SyncDirectory { id: String },

    #[error("Type mismatch at {path}: {reason}")]
    StructuralMismatch { path: String, reason: String },

    #[error("Duplicate remote name at {path}")]
    DuplicateName { path: String },

    #[error("Remote name cannot be represented locally: {path}")]
    InvalidName { path: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("{count} unresolved conflict(s)")]
    UnresolvedConflicts { count: u64 },

    #[error("{count} transfer(s) failed")]
    TransfersFailed { count: u64 },

    #[error("Sync error: {0}")]
    Sync(String),
}

impl DriveError {
    /// Returns a user-friendly suggestion for how to fix the error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            DriveError::SourceNotFound { .. } => {
                Some("Check the path exists and spelling is correct.")
            }
            DriveError::PermissionDenied { .. } => {
                Some("Try running with elevated privileges, or check file permissions.")
            }
            DriveError::DestinationNotWritable { .. } => {
                Some("Check that the destination directory exists and you have write permission.")
            }
            DriveError::IsDirectory { .. } => Some("Pass -r to include everything below it."),
            DriveError::AlreadyExists { .. } => Some("Use --force to overwrite."),
            DriveError::ChecksumMismatch { .. } => {
                Some("The file may be corrupted. Try re-transferring.")
            }
            DriveError::InvalidPattern { .. } => {
                Some("Check glob syntax. Examples: '*.log', '**/*.tmp', 'build/'")
            }
            DriveError::RemoteNotFound { .. } => {
                Some("List folder contents with `drivesync list --parent <id>`.")
            }
            DriveError::AuthExpired(_) => Some("Re-authenticate and run the command again."),
            DriveError::SyncDirectory { .. } => {
                Some("List sync directories with `drivesync list-sync`.")
            }
            DriveError::DuplicateName { .. } => {
                Some("Rename or remove one of the duplicate remote entries.")
            }
            DriveError::UnresolvedConflicts { .. } => {
                Some("Re-run with --keep-local, --keep-remote or --keep-largest.")
            }
            DriveError::TransfersFailed { .. } => {
                Some("Run the same command again to retry the failed paths.")
            }
            _ => None,
        }
    }

    /// Fatal errors stop any further dispatch for the rest of the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriveError::AuthExpired(_))
    }

    /// Map an io::Error on `path` to the most descriptive variant.
    pub fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DriveError::SourceNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => DriveError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => DriveError::Io { source: err },
        }
    }
}

impl From<globset::Error> for DriveError {
    fn from(err: globset::Error) -> Self {
        DriveError::InvalidPattern {
            pattern: err.glob().map(|g| g.to_string()).unwrap_or_default(),
            reason: err.kind().to_string(),
        }
    }
}

impl From<walkdir::Error> for DriveError {
    fn from(err: walkdir::Error) -> Self {
        if let Some(path) = err.path() {
            if let Some(inner) = err.io_error() {
                if inner.kind() == std::io::ErrorKind::PermissionDenied {
                    return DriveError::PermissionDenied {
                        path: path.to_path_buf(),
                    };
                }
            }
        }
        DriveError::Io {
            source: err.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir error")
            }),
        }
    }
}

impl From<serde_json::Error> for DriveError {
    fn from(err: serde_json::Error) -> Self {
        DriveError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for DriveError {
    fn from(err: toml::de::Error) -> Self {
        DriveError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<std::path::StripPrefixError> for DriveError {
    fn from(err: std::path::StripPrefixError) -> Self {
        DriveError::Io {
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
        }
    }
}
