//! BLAKE3 content hashing for change detection and integrity checks.
//!
//! Provides `hash_file` for whole-file hashing and `HashingReader`, which
//! hashes bytes as they stream through an upload or download.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::error::DriveError;

/// Buffer size for hashing: 64KB.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Compute the BLAKE3 hash of an entire file, returning the hex string.
pub fn hash_file(path: &Path) -> Result<String, DriveError> {
    let mut file = File::open(path).map_err(|e| DriveError::from_io(e, path))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; HASH_BUF_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Wraps a Read and hashes every byte that passes through it.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: blake3::Hasher,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    /// Number of bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Hex digest of everything read so far.
    pub fn hex_digest(&self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}
