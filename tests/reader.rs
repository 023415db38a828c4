//! Block reader integration tests.
//!
//! Exercises the ring worker directly: full-block reads, end-of-file,
//! short-read continuation over a truncated tail, and shutdown
//! semantics.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use oxipager::constants::BLOCK_SIZE;
use oxipager::{BlockBuffer, BlockReader, CompleteRead, Status};
use tempfile::tempdir;

struct SendResult(mpsc::Sender<Result<BlockBuffer, Status>>);

impl CompleteRead for SendResult {
    fn complete(self: Box<Self>, result: Result<BlockBuffer, Status>) {
        let _ = self.0.send(result);
    }
}

fn read_blocking(
    reader: &BlockReader,
    offset: u64,
    len: usize,
) -> Result<BlockBuffer, Status> {
    let (tx, rx) = mpsc::channel();
    reader.read(offset, len, Box::new(SendResult(tx)));
    rx.recv_timeout(Duration::from_secs(10))
        .expect("callback never fired")
}

#[test]
fn test_full_block_roundtrip() {
    if !common::require_io_uring() {
        return;
    }
    let dir = tempdir().unwrap();
    let payload: Vec<u8> = (0..4096).map(|i| (i % 253) as u8).collect();
    let path = common::file_with_bytes_at(&dir, "data.db", 2 * BLOCK_SIZE, 0, &payload);
    let reader = BlockReader::open(&path).unwrap();

    let buf = read_blocking(&reader, 0, BLOCK_SIZE as usize).unwrap();
    assert_eq!(buf.len(), BLOCK_SIZE as usize);
    assert_eq!(&buf.as_slice()[..payload.len()], &payload[..]);
    // The unwritten remainder reads back as zeros.
    assert!(buf.as_slice()[payload.len()..].iter().all(|&b| b == 0));

    assert_eq!(reader.stats().reads_completed(), 1);
    assert_eq!(reader.stats().bytes_read(), BLOCK_SIZE);
    assert!(reader.fatal().is_none());
}

#[test]
fn test_concurrent_block_reads() {
    if !common::require_io_uring() {
        return;
    }
    let dir = tempdir().unwrap();
    let mut payload = vec![0u8; 2 * BLOCK_SIZE as usize];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i / BLOCK_SIZE as usize) as u8 + 1;
    }
    let path = common::file_with_bytes_at(&dir, "data.db", 2 * BLOCK_SIZE, 0, &payload);
    let reader = BlockReader::open(&path).unwrap();

    let (tx, rx) = mpsc::channel();
    for block in 0..2u64 {
        reader.read(
            block * BLOCK_SIZE,
            BLOCK_SIZE as usize,
            Box::new(SendResult(tx.clone())),
        );
    }
    drop(tx);

    let mut seen = Vec::new();
    while let Ok(result) = rx.recv_timeout(Duration::from_secs(10)) {
        let buf = result.unwrap();
        assert_eq!(buf.len(), BLOCK_SIZE as usize);
        // Each block is filled with a single marker byte.
        let marker = buf.as_slice()[0];
        assert!(buf.as_slice().iter().all(|&b| b == marker));
        seen.push(marker);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
    assert_eq!(reader.stats().reads_completed(), 2);
}

#[test]
fn test_read_past_end_of_file() {
    if !common::require_io_uring() {
        return;
    }
    let dir = tempdir().unwrap();
    let path = common::sized_file(&dir, "data.db", BLOCK_SIZE);
    let reader = BlockReader::open(&path).unwrap();

    let err = read_blocking(&reader, BLOCK_SIZE, BLOCK_SIZE as usize).unwrap_err();
    assert_eq!(err, Status::EndOfFile);
    assert_eq!(reader.stats().read_errors(), 1);
}

#[test]
fn test_truncated_tail_continues_then_reports_eof() {
    if !common::require_io_uring() {
        return;
    }
    let dir = tempdir().unwrap();
    // Block 1 is only half backed: the read comes up short, the
    // remainder is resubmitted, and the continuation hits EOF.
    let path = common::sized_file(&dir, "data.db", 3 * BLOCK_SIZE / 2);
    let reader = BlockReader::open(&path).unwrap();

    let err = read_blocking(&reader, BLOCK_SIZE, BLOCK_SIZE as usize).unwrap_err();
    assert_eq!(err, Status::EndOfFile);
    assert!(reader.stats().short_reads() >= 1);
}

#[test]
fn test_reads_after_close_fail() {
    if !common::require_io_uring() {
        return;
    }
    let dir = tempdir().unwrap();
    let path = common::sized_file(&dir, "data.db", BLOCK_SIZE);
    let reader = BlockReader::open(&path).unwrap();
    reader.close();

    let err = read_blocking(&reader, 0, BLOCK_SIZE as usize).unwrap_err();
    assert_eq!(err, Status::UnexpectedError);
}

#[test]
fn test_close_is_idempotent() {
    if !common::require_io_uring() {
        return;
    }
    let dir = tempdir().unwrap();
    let path = common::sized_file(&dir, "data.db", BLOCK_SIZE);
    let reader = BlockReader::open(&path).unwrap();
    reader.close();
    reader.close();
}

#[test]
fn test_offset_overflow_rejected() {
    if !common::require_io_uring() {
        return;
    }
    let dir = tempdir().unwrap();
    let path = common::sized_file(&dir, "data.db", BLOCK_SIZE);
    let reader = BlockReader::open(&path).unwrap();

    let err = read_blocking(&reader, u64::MAX, BLOCK_SIZE as usize).unwrap_err();
    assert_eq!(err, Status::ParamsOutsideAccessibleAddressSpace);
}
