//! Platform-specific config and data directory helpers.
//!
//! Uses the `dirs` crate to resolve platform-appropriate directories:
//! - Linux:   `~/.config/drivesync/` (config), `~/.local/share/drivesync/` (data)
//! - Windows: `%APPDATA%\drivesync\` (both)
//! - macOS:   `~/Library/Application Support/drivesync/` (both)

use std::path::{Path, PathBuf};

use crate::error::DriveError;

/// File name of the fingerprint cache inside the config directory.
pub const CACHE_FILE_NAME: &str = "file_cache.json";

/// Resolve the config directory, creating it if needed.
///
/// An explicit directory (from `--config-dir` or `DRIVESYNC_CONFIG_DIR`)
/// wins over the platform default.
pub fn config_dir(explicit: Option<&Path>) -> Result<PathBuf, DriveError> {
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => dirs::config_dir()
            .ok_or_else(|| DriveError::Config("Could not determine config directory".into()))?
            .join("drivesync"),
    };
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Default location of the directory-backed object store.
pub fn default_store_dir() -> Result<PathBuf, DriveError> {
    let base = dirs::data_dir()
        .ok_or_else(|| DriveError::Config("Could not determine data directory".into()))?;
    Ok(base.join("drivesync").join("store"))
}

/// Path of the fingerprint cache file for a config directory.
pub fn cache_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CACHE_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_dir_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let wanted = tmp.path().join("nested").join("cfg");
        let dir = config_dir(Some(&wanted)).unwrap();
        assert_eq!(dir, wanted);
        assert!(dir.exists());
    }

    #[test]
    fn cache_path_uses_cache_file_name() {
        let path = cache_path(Path::new("/etc/drivesync"));
        assert!(path.ends_with(CACHE_FILE_NAME));
    }
}
