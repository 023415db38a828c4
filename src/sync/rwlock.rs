//! Futex-backed reader/writer lock.
//!
//! The whole lock state lives in one 64-bit word split into
//! `readers: u32 | writers: u32`, updated with CAS. Sleepers park on
//! the two 32-bit halves independently: readers (and queued writers)
//! park on the writer half while a writer holds or awaits the lock,
//! and the active writer parks on the reader half until the last
//! reader drains. Writers are preferred: once a writer has claimed the
//! writer half, new readers stop entering.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sync::futex;

const READER: u64 = 1;
const WRITER: u64 = 1 << 32;

#[inline]
const fn readers(state: u64) -> u32 {
    state as u32
}

#[inline]
const fn writers(state: u64) -> u32 {
    (state >> 32) as u32
}

/// Reader/writer lock protecting `T`.
pub(crate) struct RwLock<T> {
    state: AtomicU64,
    value: UnsafeCell<T>,
}

// Safety: the lock provides the usual RwLock exclusion guarantees.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            state: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Pointer to the 32-bit reader half of the state word.
    fn reader_word(&self) -> *const u32 {
        let base = self.state.as_ptr() as *const u32;
        // Little-endian: the low (reader) half is the first word.
        unsafe { base.add(if cfg!(target_endian = "little") { 0 } else { 1 }) }
    }

    /// Pointer to the 32-bit writer half of the state word.
    fn writer_word(&self) -> *const u32 {
        let base = self.state.as_ptr() as *const u32;
        unsafe { base.add(if cfg!(target_endian = "little") { 1 } else { 0 }) }
    }

    /// Acquire a shared read guard, parking while any writer is active
    /// or queued.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if writers(state) == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state + READER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return RwLockReadGuard { lock: self };
                }
            } else {
                futex::wait(self.writer_word(), writers(state));
            }
        }
    }

    /// Acquire the exclusive write guard.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, T> {
        // Claim the writer half; from here on new readers stop entering.
        loop {
            let state = self.state.load(Ordering::Acquire);
            if writers(state) == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state + WRITER,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break;
                }
            } else {
                futex::wait(self.writer_word(), writers(state));
            }
        }

        // Wait for the reader population to drain.
        loop {
            let state = self.state.load(Ordering::Acquire);
            if readers(state) == 0 {
                return RwLockWriteGuard { lock: self };
            }
            futex::wait(self.reader_word(), readers(state));
        }
    }

    /// Exclusive access through `&mut self`, without locking.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn read_unlock(&self) {
        let prev = self.state.fetch_sub(READER, Ordering::Release);
        // The last reader out hands the word to a draining writer.
        if readers(prev) == 1 && writers(prev) != 0 {
            futex::wake(self.reader_word(), 1);
        }
    }

    fn write_unlock(&self) {
        self.state.fetch_sub(WRITER, Ordering::Release);
        futex::wake_all(self.writer_word());
    }
}

/// Shared access guard returned by [`RwLock::read`].
pub(crate) struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: reader count held; no writer can be active.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

/// Exclusive access guard returned by [`RwLock::write`].
pub(crate) struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: writer half held and readers drained.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see `deref`.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}
