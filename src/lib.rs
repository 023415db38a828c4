//! oxipager - a file-backed page cache with asynchronous block-level I/O
//!
//! The pager exposes fixed-granularity (8 KiB page) reads over a file
//! of up to 4 GiB, transparently loading 2 MiB blocks into memory on
//! demand, sharing them among concurrent readers, and evicting cold
//! blocks under memory pressure.
//!
//! # Features
//!
//! - Lock-free per-block lazy slots: a single 128-bit CAS publishes
//!   `(buffer, refcount, version)`, so the loaded path is wait-free and
//!   loader election has exactly one winner
//! - Asynchronous block reads driven by a Linux `io_uring` completion
//!   ring on a dedicated worker thread
//! - Multi-generation access tracking with recency-ranked eviction
//! - Futex-based sleep/wake throughout; no caller-side polling
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxipager::{MemoryLimits, Pager};
//!
//! // Cache at most 64 MiB of a pre-sized read-only file.
//! let pager = Pager::new("data.db", MemoryLimits::simple(64 << 20))?;
//!
//! // Borrow one page; the containing 2 MiB block loads on demand.
//! let page = pager.get_page(0, 1)?;
//! assert_eq!(page.len(), 8192);
//! page.let_go();
//! ```
//!
//! The cache is read-only with respect to the underlying file: no
//! writes, no dirty tracking, no file growth.

#![warn(missing_docs)]

pub mod pager;
pub mod reader;
pub mod status;

mod slot;
mod sync;
mod utility;

// Re-exports for convenience
pub use pager::{MemoryLimits, PageRef, Pager, PagerStats};
pub use reader::{BlockReader, CompleteRead, ReaderStats};
pub use status::Status;
pub use utility::BlockBuffer;

/// Constants used throughout the library
pub mod constants {
    /// Size of a page in bytes (8 KiB), the smallest unit exposed to callers
    pub const PAGE_SIZE: u64 = 8192;

    /// Size of a block in bytes (2 MiB), the unit of I/O and cache residency
    pub const BLOCK_SIZE: u64 = 1 << 21;

    /// Number of pages per block
    pub const PAGES_PER_BLOCK: u64 = BLOCK_SIZE / PAGE_SIZE;

    /// Largest supported file size (4 GiB)
    pub const MAX_FILE_SIZE: u64 = 4 * crate::size::GIB;

    /// Number of slots in the pager's block map
    pub const NUMBER_OF_BLOCKS: usize = (MAX_FILE_SIZE / BLOCK_SIZE) as usize;

    /// Number of rotating access-tracking generations
    pub const NUMBER_OF_ACCESS_GENERATIONS: usize = 4;

    /// Submission queue entries on the completion ring
    pub const IO_RING_QUEUE_SIZE: u32 = 32;
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::pager::{MemoryLimits, PageRef, Pager};
    pub use crate::reader::BlockReader;
    pub use crate::status::Status;
}

#[cfg(test)]
mod tests {
    use super::constants::*;

    #[test]
    fn test_constant_relationships() {
        assert_eq!(PAGE_SIZE, 8192);
        assert_eq!(BLOCK_SIZE, 2 * 1024 * 1024);
        assert_eq!(PAGES_PER_BLOCK, 256);
        assert_eq!(MAX_FILE_SIZE, 4 * 1024 * 1024 * 1024);
        assert_eq!(NUMBER_OF_BLOCKS, 2048);
        assert_eq!(NUMBER_OF_ACCESS_GENERATIONS, 4);
        assert_eq!(IO_RING_QUEUE_SIZE, 32);
    }
}
