use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "drivesync",
    version,
    about = "Sync a local directory tree with a cloud drive"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v for verbose, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode: suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Directory holding config.toml and the fingerprint cache
    #[arg(long, global = true, env = "DRIVESYNC_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Root directory of the object store
    #[arg(long, global = true, env = "DRIVESYNC_STORE")]
    pub store: Option<PathBuf>,

    /// Do not draw progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sync a local directory with a remote folder
    Sync(SyncArgs),

    /// Upload a file or directory (`-` reads from stdin)
    Upload(UploadArgs),

    /// Replace the content of a remote file
    Update(UpdateArgs),

    /// Download a file or folder
    Download(DownloadArgs),

    /// Create a remote folder
    Mkdir(MkdirArgs),

    /// List the contents of a remote folder
    List(ListArgs),

    /// Show metadata of a remote file or folder
    Info(InfoArgs),

    /// List sync directories, or everything below one of them
    ListSync(ListSyncArgs),

    /// Delete a remote file or folder
    Delete(DeleteArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the `drivesync sync` command.
#[derive(clap::Args, Debug)]
pub struct SyncArgs {
    #[command(subcommand)]
    pub direction: SyncDirection,

    /// Preview sync changes without executing
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Delete destination entries that have no source counterpart
    #[arg(long, global = true)]
    pub delete_extraneous: bool,

    /// On conflict keep the local copy
    #[arg(long, global = true)]
    pub keep_local: bool,

    /// On conflict keep the remote copy
    #[arg(long, global = true)]
    pub keep_remote: bool,

    /// On conflict keep the larger copy
    #[arg(long, global = true)]
    pub keep_largest: bool,

    /// Upload chunk size in bytes
    #[arg(long, global = true)]
    pub chunksize: Option<u64>,

    /// Maximum number of simultaneous transfers
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Exclude paths matching glob pattern (can be repeated)
    #[arg(long, global = true, action = clap::ArgAction::Append)]
    pub exclude: Vec<String>,

    /// Exit with an error if any transfer failed
    #[arg(long, global = true)]
    pub fail_on_error: bool,
}

#[derive(Subcommand, Debug)]
pub enum SyncDirection {
    /// Make the remote folder match a local directory
    Upload {
        /// Local directory
        path: PathBuf,
        /// Id of the remote folder
        file_id: String,
    },
    /// Make a local directory match a remote folder
    Download {
        /// Id of the remote folder
        file_id: String,
        /// Local directory
        path: PathBuf,
    },
}

/// Arguments for the `drivesync upload` command.
#[derive(clap::Args, Debug)]
pub struct UploadArgs {
    /// Local file or directory, or `-` to read from stdin
    pub path: PathBuf,

    /// Parent folder id (can be repeated; default: root)
    #[arg(long = "parent", action = clap::ArgAction::Append)]
    pub parents: Vec<String>,

    /// Remote name (default: the local file name; required for stdin)
    #[arg(long)]
    pub name: Option<String>,

    /// Upload directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Delete the local file after a successful upload
    #[arg(long)]
    pub delete: bool,

    /// Upload chunk size in bytes
    #[arg(long)]
    pub chunksize: Option<u64>,

    /// Maximum number of simultaneous transfers
    #[arg(long)]
    pub concurrency: Option<usize>,
}

impl UploadArgs {
    /// Whether the content comes from stdin.
    pub fn from_stdin(&self) -> bool {
        self.path.as_os_str() == "-"
    }
}

/// Arguments for the `drivesync update` command.
#[derive(clap::Args, Debug)]
pub struct UpdateArgs {
    /// Id of the remote file
    pub file_id: String,

    /// Local file with the new content
    pub path: PathBuf,

    /// Upload chunk size in bytes
    #[arg(long)]
    pub chunksize: Option<u64>,
}

/// Arguments for the `drivesync download` command.
#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// Id of the remote file or folder
    pub file_id: String,

    /// Directory to download into (default: current directory)
    #[arg(long, default_value = ".")]
    pub path: PathBuf,

    /// Download folders recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Overwrite an existing local file
    #[arg(short, long)]
    pub force: bool,

    /// Delete the remote file after a successful download
    #[arg(long)]
    pub delete: bool,

    /// Write the content to stdout instead of a file
    #[arg(long)]
    pub stdout: bool,

    /// Maximum number of simultaneous transfers
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// Arguments for the `drivesync mkdir` command.
#[derive(clap::Args, Debug)]
pub struct MkdirArgs {
    /// Folder name
    pub name: String,

    /// Parent folder id (can be repeated; default: root)
    #[arg(long = "parent", action = clap::ArgAction::Append)]
    pub parents: Vec<String>,
}

/// Arguments for the `drivesync list` command.
#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Folder to list (default: root)
    #[arg(long)]
    pub parent: Option<String>,
}

/// Arguments for the `drivesync info` command.
#[derive(clap::Args, Debug)]
pub struct InfoArgs {
    /// Id of the remote file or folder
    pub file_id: String,

    /// Show sizes in bytes
    #[arg(long)]
    pub bytes: bool,
}

/// Arguments for the `drivesync list-sync` command.
#[derive(clap::Args, Debug)]
pub struct ListSyncArgs {
    /// Sync directory to list recursively (default: list sync directories)
    pub file_id: Option<String>,
}

/// Arguments for the `drivesync delete` command.
#[derive(clap::Args, Debug)]
pub struct DeleteArgs {
    /// Id of the remote file or folder
    pub file_id: String,

    /// Delete folders with everything below them
    #[arg(short, long)]
    pub recursive: bool,
}

/// Arguments for the `drivesync completions` command.
#[derive(clap::Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_upload_parses_flags_after_positionals() {
        let cli = Cli::try_parse_from([
            "drivesync",
            "sync",
            "upload",
            "./docs",
            "root",
            "--dry-run",
            "--keep-local",
            "--concurrency",
            "4",
        ])
        .unwrap();
        let Commands::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert!(args.dry_run);
        assert!(args.keep_local);
        assert_eq!(args.concurrency, Some(4));
        match args.direction {
            SyncDirection::Upload { path, file_id } => {
                assert_eq!(path, PathBuf::from("./docs"));
                assert_eq!(file_id, "root");
            }
            SyncDirection::Download { .. } => panic!("expected upload"),
        }
    }

    #[test]
    fn dash_uploads_from_stdin() {
        let cli = Cli::try_parse_from(["drivesync", "upload", "-", "--name", "log.txt"]).unwrap();
        let Commands::Upload(args) = cli.command else {
            panic!("expected upload");
        };
        assert!(args.from_stdin());
        assert_eq!(args.name.as_deref(), Some("log.txt"));
    }

    #[test]
    fn list_sync_takes_an_optional_folder() {
        let cli = Cli::try_parse_from(["drivesync", "list-sync"]).unwrap();
        assert!(matches!(cli.command, Commands::ListSync(ListSyncArgs { file_id: None })));

        let cli = Cli::try_parse_from(["drivesync", "list-sync", "abc"]).unwrap();
        let Commands::ListSync(args) = cli.command else {
            panic!("expected list-sync");
        };
        assert_eq!(args.file_id.as_deref(), Some("abc"));
    }

    #[test]
    fn repeated_parents_are_collected() {
        let cli = Cli::try_parse_from([
            "drivesync", "mkdir", "photos", "--parent", "a", "--parent", "b",
        ])
        .unwrap();
        let Commands::Mkdir(args) = cli.command else {
            panic!("expected mkdir");
        };
        assert_eq!(args.parents, vec!["a", "b"]);
    }
}
