//! Lazy slot: a one-shot, lock-free cell coordinating block loads.
//!
//! A slot packs `(val, references, version)` into a single 128-bit
//! atomic word, so one double-word CAS publishes a loaded buffer, its
//! initial reference count, and a version bump at once. That gives a
//! wait-free loaded path for [`LazySlot::get`] and a strictly
//! single-winner loader election in [`LazySlot::should_init`].
//!
//! States:
//! - *Empty*: whole word zero.
//! - *Loading*: `val == 0`, `version >= 1`; the winning loader owns
//!   publication, everyone else parks on the `version` sub-word.
//! - *Loaded*: `val` holds a `*mut BlockBuffer`; `references` counts
//!   the pager's reservation plus live borrowers.
//! - *Failed*: `references == u32::MAX` and `val` carries the
//!   [`Status`] code; terminal until [`LazySlot::reset`].
//!
//! Targets without a native 128-bit CAS fall back to
//! `portable-atomic`'s seqlock, which preserves the same contract.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;

use crate::status::Status;
use crate::sync::futex;
use crate::utility::BlockBuffer;

/// `references` value marking the failed state.
const REFS_FAILED: u32 = u32::MAX;

#[inline]
const fn pack(val: u64, references: u32, version: u32) -> u128 {
    (val as u128) | ((references as u128) << 64) | ((version as u128) << 96)
}

#[inline]
const fn unpack(state: u128) -> (u64, u32, u32) {
    (state as u64, (state >> 64) as u32, (state >> 96) as u32)
}

/// Single-producer / multi-consumer one-shot cell for a block buffer.
pub(crate) struct LazySlot {
    state: AtomicU128,
}

impl LazySlot {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU128::new(0),
        }
    }

    /// Address of the 32-bit `version` sub-word, used as the futex
    /// word for sleep/wake.
    ///
    /// The version changes on every slot mutation, so a waiter that
    /// observed Loading can never sleep through the publication it is
    /// waiting for: the kernel's expected-value check catches any
    /// intervening transition. `portable_atomic::AtomicU128` has the
    /// same in-memory representation as `u128`, so the sub-word sits at
    /// a fixed byte offset within the cell.
    fn version_word(&self) -> *const u32 {
        let base = &self.state as *const AtomicU128 as *const u32;
        // bits 96..128 of the little-endian word; mirrored on big-endian.
        unsafe { base.add(if cfg!(target_endian = "little") { 3 } else { 0 }) }
    }

    /// Attempt to become the loader for an empty slot.
    ///
    /// Returns `true` exactly once per Empty -> {Loaded, Failed} cycle,
    /// to the caller that must now publish via [`LazySlot::init`] or
    /// [`LazySlot::opps`]. Everyone else gets `false`.
    pub(crate) fn should_init(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        let (val, _references, version) = unpack(current);
        if val != 0 || version != 0 {
            return false;
        }
        self.state
            .compare_exchange(current, pack(0, 0, 1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cheap, possibly stale check for a published buffer.
    pub(crate) fn has_value(&self) -> bool {
        let (val, references, _version) = unpack(self.state.load(Ordering::Relaxed));
        val != 0 && references != REFS_FAILED
    }

    /// Publish a loaded buffer. Loader-only.
    ///
    /// Installs `{val, references: 1, version + 1}`; the single
    /// reference is the pager's own reservation. Wakes every parked
    /// waiter.
    pub(crate) fn init(&self, buf: NonNull<BlockBuffer>) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (val, _references, version) = unpack(current);
            debug_assert_eq!(val, 0, "init on a slot that already holds a buffer");
            let next = pack(buf.as_ptr() as u64, 1, version.wrapping_add(1));
            if self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        futex::wake_all(self.version_word());
    }

    /// Publish a load failure. Loader-only.
    ///
    /// Installs the failed state (`references == u32::MAX`, status code
    /// in the `val` field) and wakes every parked waiter. The slot
    /// surfaces `status` to each subsequent [`LazySlot::get`] until it
    /// is reset.
    pub(crate) fn opps(&self, status: Status) {
        debug_assert!(status.is_error());
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (val, _references, version) = unpack(current);
            debug_assert_eq!(val, 0, "opps on a slot that already holds a buffer");
            let next = pack(status.code() as u64, REFS_FAILED, version.wrapping_add(1));
            if self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        futex::wake_all(self.version_word());
    }

    /// Borrow the buffer, parking while a loader is in flight.
    ///
    /// - `Ok(Some(ptr))`: the slot is loaded and `references` was
    ///   bumped; pair with [`LazySlot::release`].
    /// - `Ok(None)`: the slot is empty; no loader exists, so parking
    ///   would never end. The caller re-enters its load loop.
    /// - `Err(status)`: the slot is failed.
    pub(crate) fn get(&self) -> Result<Option<NonNull<BlockBuffer>>, Status> {
        loop {
            match self.try_borrow()? {
                Borrow::Taken(ptr) => return Ok(Some(ptr)),
                Borrow::Empty => return Ok(None),
                Borrow::Loading(version) => futex::wait(self.version_word(), version),
                Borrow::Contended => {}
            }
        }
    }

    /// Non-parking variant of [`LazySlot::get`]: `Ok(None)` for both
    /// Empty and Loading.
    pub(crate) fn try_get(&self) -> Result<Option<NonNull<BlockBuffer>>, Status> {
        loop {
            match self.try_borrow()? {
                Borrow::Taken(ptr) => return Ok(Some(ptr)),
                Borrow::Empty | Borrow::Loading(_) => return Ok(None),
                Borrow::Contended => {}
            }
        }
    }

    fn try_borrow(&self) -> Result<Borrow, Status> {
        let current = self.state.load(Ordering::Acquire);
        let (val, references, version) = unpack(current);
        if references == REFS_FAILED {
            return Err(Status::from_code(val as u32));
        }
        if val != 0 {
            let next = pack(val, references + 1, version.wrapping_add(1));
            return match self.state.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // Safety: val is non-zero, and only init stores pointers.
                Ok(_) => Ok(Borrow::Taken(unsafe {
                    NonNull::new_unchecked(val as *mut BlockBuffer)
                })),
                Err(_) => Ok(Borrow::Contended),
            };
        }
        if version == 0 {
            return Ok(Borrow::Empty);
        }
        Ok(Borrow::Loading(version))
    }

    /// Return one borrow taken via [`LazySlot::get`]/[`LazySlot::try_get`].
    ///
    /// No wake: nothing ever parks on a free reference count.
    pub(crate) fn release(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let (val, references, version) = unpack(current);
            debug_assert_ne!(val, 0, "release on a slot without a buffer");
            debug_assert!(references >= 1 && references != REFS_FAILED);
            let next = pack(val, references - 1, version.wrapping_add(1));
            if self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Eviction-scan peek: loaded with only the pager's reservation.
    ///
    /// Advisory; a borrow may land between this check and a reset, in
    /// which case the reset fails.
    pub(crate) fn is_idle(&self) -> bool {
        let (val, references, _version) = unpack(self.state.load(Ordering::Acquire));
        val != 0 && references == 1
    }

    /// Try to return a loaded slot to Empty, for eviction.
    ///
    /// Succeeds only while `references == 1` (just the pager's
    /// reservation); any concurrent borrow between the caller's scan
    /// and this CAS makes it fail. On success the caller receives the
    /// buffer and is responsible for freeing it.
    pub(crate) fn reset(&self) -> Option<NonNull<BlockBuffer>> {
        let current = self.state.load(Ordering::Acquire);
        let (val, references, _version) = unpack(current);
        if val == 0 || references != 1 {
            return None;
        }
        if self
            .state
            .compare_exchange(current, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            NonNull::new(val as *mut BlockBuffer)
        } else {
            None
        }
    }

    /// Tear the slot down unconditionally, handing back a buffer if one
    /// is loaded. Only sound with exclusive access (pager teardown).
    pub(crate) fn take(&self) -> Option<NonNull<BlockBuffer>> {
        let (val, references, _version) = unpack(self.state.swap(0, Ordering::AcqRel));
        if references == REFS_FAILED || val == 0 {
            return None;
        }
        NonNull::new(val as *mut BlockBuffer)
    }
}

enum Borrow {
    /// Loaded; the reference count was bumped.
    Taken(NonNull<BlockBuffer>),
    /// Empty; no loader exists.
    Empty,
    /// A loader is in flight; holds the version observed, the value to
    /// park on.
    Loading(u32),
    /// CAS lost against a concurrent borrow; retry.
    Contended,
}
