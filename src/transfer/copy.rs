use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;

use crate::error::DriveError;
use crate::remote::{NewEntry, RemoteEntry, RemoteStore};

use super::checksum::HashingReader;

/// Buffer size for BufReader/BufWriter: 256KB.
const BUF_SIZE: usize = 256 * 1024;

/// Wraps a Read and updates a ProgressBar as bytes are read.
pub struct ProgressReader<R: Read> {
    inner: R,
    progress: ProgressBar,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, progress: ProgressBar) -> Self {
        Self { inner, progress }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let bytes_read = self.inner.read(buf)?;
        self.progress.inc(bytes_read as u64);
        Ok(bytes_read)
    }
}

/// A finished upload: the remote entry plus what was actually sent.
#[derive(Debug)]
pub struct Uploaded {
    pub entry: RemoteEntry,
    pub hash: String,
    pub bytes: u64,
}

/// A finished download.
#[derive(Debug)]
pub struct Downloaded {
    pub hash: String,
    pub bytes: u64,
}

/// Upload `source` as a new remote file.
pub fn upload_new(
    store: &dyn RemoteStore,
    source: &Path,
    entry: &NewEntry,
    progress: &ProgressBar,
) -> Result<Uploaded, DriveError> {
    upload_with(source, progress, |reader| store.create(entry, Some(reader)))
}

/// Replace the content of remote file `id` with `source`.
pub fn upload_update(
    store: &dyn RemoteStore,
    source: &Path,
    id: &str,
    modified: Option<DateTime<Utc>>,
    progress: &ProgressBar,
) -> Result<Uploaded, DriveError> {
    upload_with(source, progress, |reader| store.update(id, reader, modified))
}

/// Upload everything read from `input` (e.g. stdin) as a new remote file.
pub fn upload_stream(
    store: &dyn RemoteStore,
    input: impl Read,
    entry: &NewEntry,
    progress: &ProgressBar,
) -> Result<Uploaded, DriveError> {
    send_hashed(input, Path::new("-"), progress, |reader| {
        store.create(entry, Some(reader))
    })
}

/// Stream a local file through `send`.
fn upload_with(
    source: &Path,
    progress: &ProgressBar,
    send: impl FnOnce(&mut dyn Read) -> Result<RemoteEntry, DriveError>,
) -> Result<Uploaded, DriveError> {
    let file = std::fs::File::open(source).map_err(|e| DriveError::from_io(e, source))?;
    send_hashed(
        BufReader::with_capacity(BUF_SIZE, file),
        source,
        progress,
        send,
    )
}

/// Feed `input` to `send`, hashing it on the way.
///
/// If the store reports a content hash it must match what was read.
fn send_hashed(
    input: impl Read,
    source: &Path,
    progress: &ProgressBar,
    send: impl FnOnce(&mut dyn Read) -> Result<RemoteEntry, DriveError>,
) -> Result<Uploaded, DriveError> {
    let mut reader = HashingReader::new(ProgressReader::new(input, progress.clone()));

    let entry = send(&mut reader)?;
    let hash = reader.hex_digest();

    if let Some(remote_hash) = &entry.content_hash {
        if *remote_hash != hash {
            return Err(DriveError::ChecksumMismatch {
                path: source.to_path_buf(),
                expected: hash,
                actual: remote_hash.clone(),
            });
        }
    }
    Ok(Uploaded {
        entry,
        hash,
        bytes: reader.bytes_read(),
    })
}

/// Download remote file `id` to `dest`.
///
/// Content goes to a temporary sibling first and is renamed into place
/// once complete, so an interrupted download never leaves a truncated
/// file behind. The local mtime is set to `modified` when given.
pub fn download_file(
    store: &dyn RemoteStore,
    id: &str,
    dest: &Path,
    modified: Option<DateTime<Utc>>,
    progress: &ProgressBar,
) -> Result<Downloaded, DriveError> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => DriveError::DestinationNotWritable {
                    path: parent.to_path_buf(),
                },
                _ => DriveError::Io { source: e },
            })?;
        }
    }

    let tmp_path = partial_path(dest);
    let result = write_partial(store, id, &tmp_path, modified, progress);
    match result {
        Ok(downloaded) => {
            std::fs::rename(&tmp_path, dest).map_err(|e| DriveError::from_io(e, dest))?;
            Ok(downloaded)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn write_partial(
    store: &dyn RemoteStore,
    id: &str,
    tmp_path: &Path,
    modified: Option<DateTime<Utc>>,
    progress: &ProgressBar,
) -> Result<Downloaded, DriveError> {
    let source = store.open_read(id)?;
    let mut reader = HashingReader::new(ProgressReader::new(source, progress.clone()));

    let file = std::fs::File::create(tmp_path).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => DriveError::DestinationNotWritable {
            path: tmp_path.to_path_buf(),
        },
        _ => DriveError::Io { source: e },
    })?;
    let mut writer = BufWriter::with_capacity(BUF_SIZE, file);
    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    if let Some(modified) = modified {
        file.set_modified(SystemTime::from(modified))?;
    }
    file.sync_all()?;

    Ok(Downloaded {
        hash: reader.hex_digest(),
        bytes: reader.bytes_read(),
    })
}

/// Hidden sibling used while a download is in progress.
fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.partial", name))
}

/// Copy remote file `id` to an arbitrary writer (e.g. stdout).
pub fn stream_to(store: &dyn RemoteStore, id: &str, out: &mut dyn Write) -> Result<u64, DriveError> {
    let mut source = store.open_read(id)?;
    let bytes = io::copy(&mut source, out)?;
    out.flush()?;
    Ok(bytes)
}
