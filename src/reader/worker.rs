//! Ring worker: the single thread that owns the `io_uring` and the
//! file, submits reads, and dispatches completions.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Receiver;
use io_uring::{opcode, types, IoUring};
use tracing::warn;

use crate::constants::IO_RING_QUEUE_SIZE;
use crate::status::Status;
use crate::utility::BlockBuffer;

use super::{CompleteRead, Request, Shared};

/// `user_data` reserved for the always-armed eventfd read.
const EVENT_TOKEN: u64 = u64::MAX;

/// Cap on reads submitted to the kernel at once; the remaining entry
/// is reserved for the eventfd read.
const MAX_SUBMITTED: usize = IO_RING_QUEUE_SIZE as usize - 1;

struct InFlight {
    buf: BlockBuffer,
    /// Advanced past already-delivered bytes on short reads.
    iov: libc::iovec,
    /// File offset for the next submission of this request.
    offset: u64,
    requested: usize,
    callback: Box<dyn CompleteRead>,
}

// Safety: the iovec points into `buf`, which the entry owns; nothing
// else aliases it while the request is in flight.
unsafe impl Send for InFlight {}

pub(crate) fn spawn(
    ring: IoUring,
    file: File,
    rx: Receiver<Request>,
    shared: Arc<Shared>,
) -> JoinHandle<()> {
    let worker = Worker {
        ring,
        _file: file,
        rx,
        shared,
        in_flight: HashMap::new(),
        backlog: VecDeque::new(),
        next_id: 0,
        event_buf: Box::new(0u64),
        shutting_down: false,
    };
    thread::spawn(move || worker.run())
}

struct Worker {
    ring: IoUring,
    /// Held for the registered-fd lifetime; all I/O goes through
    /// `types::Fixed(0)`.
    _file: File,
    rx: Receiver<Request>,
    shared: Arc<Shared>,
    /// Boxed so the iovec address stays stable while the kernel owns it.
    in_flight: HashMap<u64, Box<InFlight>>,
    /// Requests (by id) with no SQE yet: submission queue was full, or
    /// a short read awaits its continuation.
    backlog: VecDeque<u64>,
    next_id: u64,
    event_buf: Box<u64>,
    shutting_down: bool,
}

impl Worker {
    fn run(mut self) {
        if let Err(status) = self.arm_event() {
            self.die(status);
            return;
        }

        loop {
            self.drain_queue();
            self.flush_backlog();

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                // EBUSY means the completion queue wants draining, and a
                // signal may have interrupted the wait; reap below and
                // resubmit on the next pass.
                Err(ref e) if is_transient(e) => {}
                Err(e) => {
                    warn!(error = %e, "ring submission failed; reader worker exiting");
                    self.die(Status::from_errno(e.raw_os_error().unwrap_or(0)));
                    return;
                }
            }

            // Copy completions out so the queue borrow ends before any
            // resubmission below.
            let completions: Vec<(u64, i32)> = self
                .ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect();

            let mut event_fired = false;
            for (id, result) in completions {
                if id == EVENT_TOKEN {
                    event_fired = true;
                } else {
                    self.complete(id, result);
                }
            }

            if event_fired {
                self.drain_queue();
                if let Err(status) = self.arm_event() {
                    self.die(status);
                    return;
                }
            }

            if self.shutting_down && self.in_flight.is_empty() && self.backlog.is_empty() {
                return;
            }
        }
    }

    /// Move queued requests into the in-flight table, allocating their
    /// buffers, and stage them for submission.
    fn drain_queue(&mut self) {
        while let Ok(request) = self.rx.try_recv() {
            match request {
                Request::Shutdown => self.shutting_down = true,
                Request::Read {
                    offset,
                    len,
                    callback,
                } => {
                    if self.shutting_down {
                        self.shared.stats.record_error();
                        callback.complete(Err(Status::UnexpectedError));
                        continue;
                    }
                    let Some(mut buf) = BlockBuffer::zeroed(len) else {
                        self.shared.stats.record_error();
                        callback.complete(Err(Status::OutOfMemory));
                        continue;
                    };
                    let iov = libc::iovec {
                        iov_base: buf.as_mut_ptr().cast(),
                        iov_len: len,
                    };
                    let id = self.next_id;
                    self.next_id += 1;
                    self.in_flight.insert(
                        id,
                        Box::new(InFlight {
                            buf,
                            iov,
                            offset,
                            requested: len,
                            callback,
                        }),
                    );
                    self.backlog.push_back(id);
                }
            }
        }
    }

    /// Push staged SQEs until the ring or the submission cap is full.
    fn flush_backlog(&mut self) {
        while let Some(&id) = self.backlog.front() {
            if self.in_flight.len() - self.backlog.len() >= MAX_SUBMITTED {
                break;
            }
            let entry = {
                let inflight = &self.in_flight[&id];
                opcode::Readv::new(types::Fixed(0), &inflight.iov, 1)
                    .offset(inflight.offset)
                    .build()
                    .user_data(id)
            };
            // Safety: the iovec and buffer live in the boxed in-flight
            // entry until its completion is consumed.
            if unsafe { self.ring.submission().push(&entry) }.is_err() {
                // Submission queue full; retry after the next drain.
                break;
            }
            self.backlog.pop_front();
        }
    }

    /// Keep one read armed on the eventfd so queue pings wake
    /// `submit_and_wait`.
    fn arm_event(&mut self) -> Result<(), Status> {
        let entry = opcode::Read::new(
            types::Fd(self.shared.event_fd.as_raw_fd()),
            (&mut *self.event_buf as *mut u64).cast::<u8>(),
            std::mem::size_of::<u64>() as u32,
        )
        .build()
        .user_data(EVENT_TOKEN);

        // Safety: event_buf is owned by the worker and outlives the ring.
        if unsafe { self.ring.submission().push(&entry) }.is_err() {
            // One CQE slot is always reserved for the event read, so a
            // full queue here means the ring is wedged.
            return Err(Status::UnexpectedError);
        }
        Ok(())
    }

    fn complete(&mut self, id: u64, result: i32) {
        let Some(mut inflight) = self.in_flight.remove(&id) else {
            return;
        };

        if result < 0 {
            self.shared.stats.record_error();
            inflight.callback.complete(Err(Status::from_errno(-result)));
            return;
        }
        if result == 0 {
            self.shared.stats.record_error();
            inflight.callback.complete(Err(Status::EndOfFile));
            return;
        }

        let got = result as usize;
        if got < inflight.iov.iov_len {
            // Short read: advance the io-vector and resubmit the rest.
            self.shared.stats.record_short_read();
            inflight.iov.iov_base = unsafe { inflight.iov.iov_base.cast::<u8>().add(got).cast() };
            inflight.iov.iov_len -= got;
            inflight.offset += got as u64;
            self.in_flight.insert(id, inflight);
            self.backlog.push_back(id);
            return;
        }

        // The ring is done with the buffer; nothing may write it now.
        let InFlight {
            mut buf,
            requested,
            callback,
            ..
        } = *inflight;
        buf.seal();
        self.shared.stats.record_completed(requested as u64);
        callback.complete(Ok(buf));
    }

    /// Record a fatal status and fail everything still outstanding.
    fn die(&mut self, status: Status) {
        *self.shared.fatal.lock() = Some(status);
        self.shared.closed.store(true, Ordering::Release);

        self.backlog.clear();
        for (_, inflight) in self.in_flight.drain() {
            self.shared.stats.record_error();
            inflight.callback.complete(Err(status));
        }
        while let Ok(request) = self.rx.try_recv() {
            if let Request::Read { callback, .. } = request {
                self.shared.stats.record_error();
                callback.complete(Err(status));
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR)
    )
}
