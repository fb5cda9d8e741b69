use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::DriveError;

/// Name of the per-tree ignore file read from the sync root.
pub const IGNORE_FILE_NAME: &str = ".drivesyncignore";

/// Glob-based ignore filter applied to both trees during a sync.
///
/// Patterns are matched against the path relative to the sync root and
/// against the bare file name, so `*.log` works at any depth while
/// `build/**` anchors at the root. A trailing `/` restricts a pattern to
/// directories. Ignored entries are never transferred and never deleted as
/// extraneous. The ignore file at the root is always ignored.
pub struct IgnoreFilter {
    any: Option<GlobSet>,
    dirs_only: Option<GlobSet>,
}

impl IgnoreFilter {
    /// Build a filter from glob patterns.
    ///
    /// Returns `DriveError::InvalidPattern` if any pattern is malformed.
    pub fn new(patterns: &[String]) -> Result<Self, DriveError> {
        let mut any = Vec::new();
        let mut dirs_only = Vec::new();
        for pattern in patterns {
            match pattern.strip_suffix('/') {
                Some(dir) if !dir.is_empty() => dirs_only.push(dir),
                _ => any.push(pattern.as_str()),
            }
        }
        Ok(Self {
            any: build_set(&any)?,
            dirs_only: build_set(&dirs_only)?,
        })
    }

    /// Filter with no patterns.
    pub fn empty() -> Self {
        Self {
            any: None,
            dirs_only: None,
        }
    }

    /// Build a filter from `patterns` plus the ignore file under `root`.
    pub fn for_root(root: &Path, patterns: &[String]) -> Result<Self, DriveError> {
        let mut all = patterns.to_vec();
        all.extend(read_ignore_file(&root.join(IGNORE_FILE_NAME))?);
        Self::new(&all)
    }

    /// Returns true if the entry at relative path `path` is ignored.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if !is_dir && path == Path::new(IGNORE_FILE_NAME) {
            return true;
        }
        if let Some(ref any) = self.any {
            if matches_glob(any, path) {
                return true;
            }
        }
        if is_dir {
            if let Some(ref dirs) = self.dirs_only {
                return matches_glob(dirs, path);
            }
        }
        false
    }
}

fn build_set(patterns: &[&str]) -> Result<Option<GlobSet>, DriveError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

/// Match a glob set against both the relative path and the file name.
fn matches_glob(glob_set: &GlobSet, path: &Path) -> bool {
    if glob_set.is_match(path) {
        return true;
    }
    if let Some(file_name) = path.file_name() {
        if glob_set.is_match(Path::new(file_name)) {
            return true;
        }
    }
    false
}

/// Read patterns from an ignore file: one per line, `#` starts a comment.
/// A missing file yields no patterns.
pub fn read_ignore_file(path: &Path) -> Result<Vec<String>, DriveError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(DriveError::from_io(e, path)),
    };
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
