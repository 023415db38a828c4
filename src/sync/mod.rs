//! Concurrency primitives shared by the slot and the pager.

pub(crate) mod bitmap;
pub(crate) mod futex;
pub(crate) mod rwlock;

pub(crate) use bitmap::AtomicBitmap;
pub(crate) use rwlock::RwLock;
