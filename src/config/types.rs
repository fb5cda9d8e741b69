use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::DriveError;

/// Default number of simultaneous transfers.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default upload chunk size: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Verbosity level controlling tracing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Suppress all output except errors
    Quiet,
    /// Normal output (info level)
    Normal,
    /// Verbose output (debug level)
    Verbose,
    /// Maximum output (trace level)
    Trace,
}

impl From<(bool, u8)> for Verbosity {
    /// Convert from (quiet_flag, verbose_count) to Verbosity.
    ///
    /// - quiet=true -> Quiet (regardless of verbose count)
    /// - verbose=0  -> Normal
    /// - verbose=1  -> Verbose
    /// - verbose=2+ -> Trace
    fn from((quiet, verbose_count): (bool, u8)) -> Self {
        if quiet {
            Verbosity::Quiet
        } else {
            match verbose_count {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}

impl Verbosity {
    /// Return the tracing filter string for this verbosity level.
    pub fn as_tracing_filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

/// How to settle a path where both the local and the remote copy changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    /// Report the conflict and leave both copies alone.
    #[default]
    NoResolution,
    KeepLocal,
    KeepRemote,
    KeepLargest,
}

impl ConflictResolution {
    /// Build the policy from the three mutually exclusive CLI flags.
    pub fn from_flags(
        keep_local: bool,
        keep_remote: bool,
        keep_largest: bool,
    ) -> Result<Self, DriveError> {
        let given = [keep_local, keep_remote, keep_largest]
            .iter()
            .filter(|f| **f)
            .count();
        if given > 1 {
            return Err(DriveError::Config(
                "Only one conflict resolution flag can be given".to_string(),
            ));
        }

        Ok(if keep_local {
            ConflictResolution::KeepLocal
        } else if keep_remote {
            ConflictResolution::KeepRemote
        } else if keep_largest {
            ConflictResolution::KeepLargest
        } else {
            ConflictResolution::NoResolution
        })
    }
}

/// Largest chunk size the host can address.
pub fn max_chunk_size() -> u64 {
    isize::MAX as u64 - 1
}

/// Reject chunk sizes of zero or above the host limit.
pub fn validate_chunk_size(chunk_size: u64) -> Result<u64, DriveError> {
    if chunk_size > max_chunk_size() {
        return Err(DriveError::ChunkSizeTooLarge {
            max: max_chunk_size(),
        });
    }
    if chunk_size == 0 {
        return Err(DriveError::Config("Chunk size must be positive".to_string()));
    }
    Ok(chunk_size)
}

/// Reject a zero concurrency limit.
pub fn validate_concurrency(concurrency: usize) -> Result<usize, DriveError> {
    if concurrency == 0 {
        return Err(DriveError::Config(
            "Concurrency must be at least 1".to_string(),
        ));
    }
    Ok(concurrency)
}

/// Optional settings read from `config.toml` in the config directory.
///
/// Every field is optional; CLI flags take precedence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub store: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub chunk_size: Option<u64>,
    pub exclude: Vec<String>,
}

impl FileConfig {
    /// Load `config.toml` from `config_dir`, or defaults if it is absent.
    pub fn load(config_dir: &Path) -> Result<Self, DriveError> {
        let path = config_dir.join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: FileConfig = toml::from_str(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }
}

/// Resolved application configuration threaded through every command.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_dir: PathBuf,
    pub store_dir: PathBuf,
    pub cache_path: PathBuf,
    pub concurrency: usize,
    pub chunk_size: u64,
    pub exclude: Vec<String>,
    pub show_progress: bool,
}

impl AppConfig {
    /// Merge CLI flags, `config.toml` and defaults, in that order.
    pub fn resolve(
        verbosity: Verbosity,
        config_dir: Option<&Path>,
        store: Option<&Path>,
        no_progress: bool,
    ) -> Result<Self, DriveError> {
        let config_dir = super::paths::config_dir(config_dir)?;
        let file = FileConfig::load(&config_dir)?;

        let store_dir = match store.map(Path::to_path_buf).or(file.store) {
            Some(dir) => dir,
            None => super::paths::default_store_dir()?,
        };
        let concurrency =
            validate_concurrency(file.concurrency.unwrap_or(DEFAULT_CONCURRENCY))?;
        let chunk_size = validate_chunk_size(file.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE))?;

        Ok(Self {
            cache_path: super::paths::cache_path(&config_dir),
            config_dir,
            store_dir,
            concurrency,
            chunk_size,
            exclude: file.exclude,
            show_progress: !no_progress && verbosity != Verbosity::Quiet,
        })
    }

    /// Concurrency for one command: the flag if given, else the configured value.
    pub fn concurrency_or(&self, flag: Option<usize>) -> Result<usize, DriveError> {
        match flag {
            Some(n) => validate_concurrency(n),
            None => Ok(self.concurrency),
        }
    }

    pub fn chunk_size_or(&self, flag: Option<u64>) -> Result<u64, DriveError> {
        match flag {
            Some(n) => validate_chunk_size(n),
            None => Ok(self.chunk_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_from_flags() {
        assert_eq!(Verbosity::from((true, 3)), Verbosity::Quiet);
        assert_eq!(Verbosity::from((false, 0)), Verbosity::Normal);
        assert_eq!(Verbosity::from((false, 1)), Verbosity::Verbose);
        assert_eq!(Verbosity::from((false, 5)), Verbosity::Trace);
        assert_eq!(Verbosity::Quiet.as_tracing_filter(), "error");
    }

    #[test]
    fn resolution_flags_are_mutually_exclusive() {
        let err = ConflictResolution::from_flags(true, true, false).unwrap_err();
        assert!(format!("{}", err).contains("Only one conflict resolution flag"));
        assert!(ConflictResolution::from_flags(false, true, true).is_err());
        assert!(ConflictResolution::from_flags(true, false, true).is_err());
    }

    #[test]
    fn resolution_from_single_flag() {
        assert_eq!(
            ConflictResolution::from_flags(false, false, false).unwrap(),
            ConflictResolution::NoResolution
        );
        assert_eq!(
            ConflictResolution::from_flags(true, false, false).unwrap(),
            ConflictResolution::KeepLocal
        );
        assert_eq!(
            ConflictResolution::from_flags(false, true, false).unwrap(),
            ConflictResolution::KeepRemote
        );
        assert_eq!(
            ConflictResolution::from_flags(false, false, true).unwrap(),
            ConflictResolution::KeepLargest
        );
    }

    #[test]
    fn chunk_size_above_limit_is_rejected() {
        let err = validate_chunk_size(max_chunk_size() + 1).unwrap_err();
        match err {
            DriveError::ChunkSizeTooLarge { max } => assert_eq!(max, max_chunk_size()),
            other => panic!("Expected ChunkSizeTooLarge, got: {:?}", other),
        }
        assert_eq!(validate_chunk_size(max_chunk_size()).unwrap(), max_chunk_size());
        assert!(validate_chunk_size(0).is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(validate_concurrency(0).is_err());
        assert_eq!(validate_concurrency(3).unwrap(), 3);
    }

    #[test]
    fn file_config_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::load(dir.path()).unwrap();
        assert!(config.store.is_none());
        assert!(config.exclude.is_empty());
    }

    #[test]
    fn file_config_parses_and_ignores_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "concurrency = 4\nchunk_size = 1024\nexclude = [\"*.tmp\"]\ncolor = \"auto\"\n",
        )
        .unwrap();
        let config = FileConfig::load(dir.path()).unwrap();
        assert_eq!(config.concurrency, Some(4));
        assert_eq!(config.chunk_size, Some(1024));
        assert_eq!(config.exclude, vec!["*.tmp".to_string()]);
    }

    #[test]
    fn file_config_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "concurrency = [").unwrap();
        let err = FileConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, DriveError::Config(_)));
    }

    #[test]
    fn resolve_prefers_flags_over_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "store = \"/from/file\"\nconcurrency = 3\nexclude = [\"*.tmp\"]\n",
        )
        .unwrap();

        let config =
            AppConfig::resolve(Verbosity::Normal, Some(dir.path()), None, false).unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/from/file"));
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.exclude, vec!["*.tmp"]);
        assert!(config.show_progress);
        assert_eq!(config.concurrency_or(Some(7)).unwrap(), 7);
        assert_eq!(config.concurrency_or(None).unwrap(), 3);

        let store = dir.path().join("store");
        let config =
            AppConfig::resolve(Verbosity::Quiet, Some(dir.path()), Some(&store), false).unwrap();
        assert_eq!(config.store_dir, store);
        assert!(!config.show_progress);
    }

    #[test]
    fn command_overrides_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            AppConfig::resolve(Verbosity::Normal, Some(dir.path()), None, true).unwrap();
        assert!(config.concurrency_or(Some(0)).is_err());
        assert!(matches!(
            config.chunk_size_or(Some(u64::MAX)),
            Err(DriveError::ChunkSizeTooLarge { .. })
        ));
    }
}
