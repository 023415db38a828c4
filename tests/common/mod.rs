//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use tempfile::TempDir;

/// Create a file of exactly `len` zero bytes.
pub fn sized_file(dir: &TempDir, name: &str, len: u64) -> PathBuf {
    let path = dir.path().join(name);
    let file = File::create(&path).unwrap();
    file.set_len(len).unwrap();
    file.sync_all().unwrap();
    path
}

/// Create a file of `len` bytes with `bytes` written at `offset`.
pub fn file_with_bytes_at(
    dir: &TempDir,
    name: &str,
    len: u64,
    offset: u64,
    bytes: &[u8],
) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = File::create(&path).unwrap();
    file.set_len(len).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
    path
}

/// Gate for suites that need a working ring (containers and older
/// kernels may not provide one).
pub fn require_io_uring() -> bool {
    if oxipager::BlockReader::is_available() {
        true
    } else {
        eprintln!("skipping: io_uring is not available on this system");
        false
    }
}
