//! Asynchronous block reader.
//!
//! One [`BlockReader`] per opened file. It owns the file handle
//! (registered as fixed file 0 on the ring), a 32-entry `io_uring`, an
//! `eventfd` used as the cross-thread wakeup, and a single background
//! worker that drives submissions and dispatches completion callbacks.
//!
//! Callbacks are invoked from the worker thread only; callers must be
//! prepared for asynchronous delivery.

mod worker;

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use io_uring::IoUring;
use parking_lot::Mutex;

use crate::constants::IO_RING_QUEUE_SIZE;
use crate::status::Status;
use crate::utility::BlockBuffer;

/// Completion interface for [`BlockReader::read`].
///
/// Invoked exactly once per submitted read, from the worker thread,
/// with either the filled buffer or the failure status.
pub trait CompleteRead: Send {
    /// Consume the completion.
    fn complete(self: Box<Self>, result: Result<BlockBuffer, Status>);
}

pub(crate) enum Request {
    Read {
        offset: u64,
        len: usize,
        callback: Box<dyn CompleteRead>,
    },
    Shutdown,
}

pub(crate) struct Shared {
    pub(crate) event_fd: OwnedFd,
    pub(crate) closed: AtomicBool,
    pub(crate) fatal: Mutex<Option<Status>>,
    pub(crate) stats: ReaderStats,
}

impl Shared {
    pub(crate) fn ping(&self) {
        let one: u64 = 1;
        // Safety: event_fd is a live eventfd; an 8-byte write bumps its
        // counter.
        unsafe {
            libc::write(
                self.event_fd.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

/// Background ring-driven reader for fixed-size file reads.
pub struct BlockReader {
    tx: Sender<Request>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BlockReader {
    /// Create a reader over an already-opened file.
    ///
    /// Builds the ring, registers the file, creates the eventfd, and
    /// starts the worker; ring setup failures surface here rather than
    /// on the first read.
    pub fn new(file: File) -> Result<Self, Status> {
        let ring = IoUring::new(IO_RING_QUEUE_SIZE).map_err(|_| Status::UnexpectedError)?;
        ring.submitter()
            .register_files(&[file.as_raw_fd()])
            .map_err(|e| Status::from_errno(e.raw_os_error().unwrap_or(0)))?;

        // Safety: eventfd returns a fresh descriptor we own, checked below.
        let event_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if event_fd < 0 {
            return Err(Status::UnexpectedError);
        }
        let event_fd = unsafe { OwnedFd::from_raw_fd(event_fd) };

        let shared = Arc::new(Shared {
            event_fd,
            closed: AtomicBool::new(false),
            fatal: Mutex::new(None),
            stats: ReaderStats::new(),
        });

        let (tx, rx) = unbounded::<Request>();
        let worker = worker::spawn(ring, file, rx, Arc::clone(&shared));

        Ok(Self {
            tx,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Open `path` read-only and create a reader for it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Status> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| Status::from_errno(e.raw_os_error().unwrap_or(0)))?;
        Self::new(file)
    }

    /// Check if io_uring is available on this system
    pub fn is_available() -> bool {
        IoUring::new(2).is_ok()
    }

    /// Enqueue a read of `len` bytes at file offset `offset`.
    ///
    /// `callback` fires exactly once, from the worker thread, with the
    /// filled buffer or an error. Reads submitted after [`close`]
    /// (or after a fatal worker error) fail immediately.
    ///
    /// [`close`]: BlockReader::close
    pub fn read(&self, offset: u64, len: usize, callback: Box<dyn CompleteRead>) {
        if offset
            .checked_add(len as u64)
            .map_or(true, |end| end > i64::MAX as u64)
        {
            callback.complete(Err(Status::ParamsOutsideAccessibleAddressSpace));
            return;
        }
        if self.shared.closed.load(Ordering::Acquire) {
            callback.complete(Err(Status::UnexpectedError));
            return;
        }

        self.shared.stats.record_submitted();
        if let Err(err) = self.tx.send(Request::Read {
            offset,
            len,
            callback,
        }) {
            // Worker already gone; fail the request in place.
            if let Request::Read { callback, .. } = err.into_inner() {
                self.shared.stats.record_error();
                callback.complete(Err(Status::UnexpectedError));
            }
            return;
        }
        self.shared.ping();
    }

    /// Signal the worker to drain, then join it and release the ring.
    ///
    /// In-flight reads still complete (with data or an error) before
    /// the worker exits. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Request::Shutdown);
            self.shared.ping();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    /// Unrecoverable worker error, if one occurred.
    pub fn fatal(&self) -> Option<Status> {
        *self.shared.fatal.lock()
    }

    /// Get the statistics.
    pub fn stats(&self) -> &ReaderStats {
        &self.shared.stats
    }
}

impl Drop for BlockReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Statistics for reader operations.
pub struct ReaderStats {
    reads_submitted: AtomicU64,
    reads_completed: AtomicU64,
    bytes_read: AtomicU64,
    read_errors: AtomicU64,
    short_reads: AtomicU64,
}

impl ReaderStats {
    fn new() -> Self {
        Self {
            reads_submitted: AtomicU64::new(0),
            reads_completed: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_submitted(&self) {
        self.reads_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, bytes: u64) {
        self.reads_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_short_read(&self) {
        self.short_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Total reads accepted by [`BlockReader::read`].
    pub fn reads_submitted(&self) -> u64 {
        self.reads_submitted.load(Ordering::Relaxed)
    }

    /// Reads whose callback fired with a full buffer.
    pub fn reads_completed(&self) -> u64 {
        self.reads_completed.load(Ordering::Relaxed)
    }

    /// Total bytes delivered to callbacks.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Reads whose callback fired with an error.
    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    /// Short-read continuations that were resubmitted.
    pub fn short_reads(&self) -> u64 {
        self.short_reads.load(Ordering::Relaxed)
    }
}
