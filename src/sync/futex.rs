//! Thin wrappers over the `futex(2)` syscall.
//!
//! All waiters in this crate park on 32-bit words that are sub-fields
//! of larger atomics (the lazy slot's reference count, the RW lock's
//! reader/writer halves), so the wrappers take raw word pointers.
//! `FUTEX_PRIVATE_FLAG` is used throughout: cross-process sharing is
//! not supported.

use std::ptr;

/// Sleep until `word` is woken, provided it still holds `expected`.
///
/// The kernel re-checks the value under its own lock, so a wake that
/// races with the expectation check is never lost. Spurious returns
/// (`EINTR`, `EAGAIN`) are fine; callers always re-validate in a loop.
pub(crate) fn wait(word: *const u32, expected: u32) {
    // Safety: `word` points at a live, 4-byte-aligned word for the
    // duration of the call; the kernel only reads it.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ptr::null::<libc::timespec>(),
        );
    }
}

/// Wake up to `count` waiters parked on `word`.
pub(crate) fn wake(word: *const u32, count: i32) {
    // Safety: see `wait`.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        );
    }
}

/// Wake every waiter parked on `word`.
pub(crate) fn wake_all(word: *const u32) {
    wake(word, i32::MAX);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(1);
        // Expected value differs from the stored value: EAGAIN, no sleep.
        wait(word.as_ptr(), 0);
    }

    #[test]
    fn test_wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = Arc::clone(&word);
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    wait(word.as_ptr(), 0);
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::Release);
        wake_all(word.as_ptr());
        waiter.join().unwrap();
    }
}
