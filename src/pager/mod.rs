//! Pager: page-granularity reads over a block-cached file.
//!
//! The pager maps 8 KiB pages onto 2 MiB blocks, loads blocks on
//! demand through the [`BlockReader`], shares loaded blocks among
//! concurrent readers via per-block lazy slots, and evicts cold blocks
//! when resident memory crosses the configured soft limit.
//!
//! Reads that stay inside one block borrow straight from the block
//! map. Reads that straddle a block boundary ("disjoint" reads) go
//! through a separate page-keyed map of heap-allocated slots guarded
//! by a reader/writer lock; their buffers live until pager teardown.

mod config;
mod eviction;

pub use config::MemoryLimits;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::ops::Deref;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::constants::{
    BLOCK_SIZE, MAX_FILE_SIZE, NUMBER_OF_ACCESS_GENERATIONS, NUMBER_OF_BLOCKS, PAGES_PER_BLOCK,
    PAGE_SIZE,
};
use crate::reader::{BlockReader, CompleteRead};
use crate::slot::LazySlot;
use crate::status::Status;
use crate::sync::{AtomicBitmap, RwLock};
use crate::utility::BlockBuffer;

struct DisjointEntry {
    slot: Arc<LazySlot>,
    len: usize,
}

struct PagerInner {
    reader: BlockReader,
    slots: Box<[LazySlot]>,
    accessed: [AtomicBitmap; NUMBER_OF_ACCESS_GENERATIONS],
    access_idx: AtomicUsize,
    size_used: AtomicU64,
    limits: MemoryLimits,
    disjoint: RwLock<HashMap<u64, DisjointEntry>>,
    stats: PagerStats,
}

impl PagerInner {
    /// Charge one block against the memory limits, evicting at the
    /// soft threshold and failing (with the charge refunded) past the
    /// hard one.
    fn admit(&self) -> Result<(), Status> {
        let used = self.size_used.fetch_add(BLOCK_SIZE, Ordering::SeqCst) + BLOCK_SIZE;
        if used >= self.limits.soft() {
            self.evict();
            if self.size_used.load(Ordering::SeqCst) > self.limits.hard() {
                self.refund_block();
                return Err(Status::OutOfMemory);
            }
        }
        Ok(())
    }

    fn refund_block(&self) {
        self.size_used.fetch_sub(BLOCK_SIZE, Ordering::SeqCst);
    }

    /// Mark `block` touched in the current access generation.
    fn note_access(&self, block: usize) {
        self.accessed[self.access_idx.load(Ordering::Relaxed)].set(block);
    }

    /// Slot for a disjoint read starting at `page`, creating it on
    /// first use. An existing entry must cover `len` bytes.
    fn disjoint_slot(&self, page: u64, len: usize) -> Result<Arc<LazySlot>, Status> {
        {
            let map = self.disjoint.read();
            if let Some(entry) = map.get(&page) {
                return disjoint_view(entry, len);
            }
        }

        let mut map = self.disjoint.write();
        let entry = map.entry(page).or_insert_with(|| DisjointEntry {
            slot: Arc::new(LazySlot::new()),
            len,
        });
        disjoint_view(entry, len)
    }
}

fn disjoint_view(entry: &DisjointEntry, len: usize) -> Result<Arc<LazySlot>, Status> {
    if len <= entry.len {
        Ok(Arc::clone(&entry.slot))
    } else {
        Err(Status::ParamsOutsideAccessibleAddressSpace)
    }
}

impl Drop for PagerInner {
    fn drop(&mut self) {
        // The reader joined when the owning Pager dropped; by now no
        // completion can touch a slot.
        self.reader.close();
        for slot in self.slots.iter() {
            if let Some(buf) = slot.take() {
                // Safety: loaded slots hold pointers from Box::into_raw.
                unsafe { drop(Box::from_raw(buf.as_ptr())) };
            }
        }
        for entry in self.disjoint.get_mut().values() {
            if let Some(buf) = entry.slot.take() {
                // Safety: see above.
                unsafe { drop(Box::from_raw(buf.as_ptr())) };
            }
        }
    }
}

enum LoadTarget {
    Block(usize),
    Disjoint(Arc<LazySlot>),
}

/// Transient handshake between a submitted read and its slot; freed
/// when the completion is delivered.
struct ReadState {
    inner: Arc<PagerInner>,
    target: LoadTarget,
}

impl CompleteRead for ReadState {
    fn complete(self: Box<Self>, result: Result<BlockBuffer, Status>) {
        let slot: &LazySlot = match &self.target {
            LoadTarget::Block(block) => &self.inner.slots[*block],
            LoadTarget::Disjoint(slot) => slot,
        };
        match result {
            Ok(buf) => {
                // Safety: Box::into_raw never returns null.
                let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(buf))) };
                slot.init(ptr);
            }
            Err(status) => {
                self.inner.stats.record_load_failure();
                // A failed block holds no buffer; refund before waking
                // waiters so none of them observes a stale charge.
                if matches!(self.target, LoadTarget::Block(_)) {
                    self.inner.refund_block();
                }
                slot.opps(status);
            }
        }
    }
}

/// File-backed page cache with asynchronous block-level I/O.
pub struct Pager {
    inner: Arc<PagerInner>,
}

impl Pager {
    /// Open `path` read-only and build a pager over it.
    ///
    /// The file must be pre-sized and no larger than
    /// [`MAX_FILE_SIZE`]; the pager never extends it.
    ///
    /// [`MAX_FILE_SIZE`]: crate::constants::MAX_FILE_SIZE
    pub fn new(path: impl AsRef<Path>, limits: MemoryLimits) -> Result<Self, Status> {
        let file = OpenOptions::new()
            .read(true)
            .open(path.as_ref())
            .map_err(|e| Status::from_errno(e.raw_os_error().unwrap_or(0)))?;
        let file_len = file
            .metadata()
            .map_err(|e| Status::from_errno(e.raw_os_error().unwrap_or(0)))?
            .len();
        if file_len > MAX_FILE_SIZE {
            warn!(file_len, "file exceeds the maximum supported size");
            return Err(Status::UnexpectedError);
        }

        let reader = BlockReader::new(file)?;
        Ok(Self {
            inner: Arc::new(PagerInner {
                reader,
                slots: (0..NUMBER_OF_BLOCKS).map(|_| LazySlot::new()).collect(),
                accessed: std::array::from_fn(|_| AtomicBitmap::new(NUMBER_OF_BLOCKS)),
                access_idx: AtomicUsize::new(0),
                size_used: AtomicU64::new(0),
                limits,
                disjoint: RwLock::new(HashMap::new()),
                stats: PagerStats::new(),
            }),
        })
    }

    /// Borrow a view of `count` pages starting at `page`.
    ///
    /// Parks the caller until the containing block is loaded (or its
    /// load fails). The view stays valid until the returned [`PageRef`]
    /// is released.
    pub fn get_page(&self, page: u64, count: u64) -> Result<PageRef<'_>, Status> {
        check_span(page, count)?;
        self.inner.stats.record_lookup();

        let block = (page / PAGES_PER_BLOCK) as usize;
        if (page + count - 1) / PAGES_PER_BLOCK != page / PAGES_PER_BLOCK {
            return self.get_disjoint(page, count);
        }

        let slot = &self.inner.slots[block];
        if slot.has_value() {
            self.inner.stats.record_hit();
        }
        loop {
            if !slot.has_value() && slot.should_init() {
                if let Err(status) = self.inner.admit() {
                    self.inner.stats.record_load_failure();
                    slot.opps(status);
                    return Err(status);
                }
                self.inner.stats.record_miss();
                self.submit_block_load(block);
            }
            match slot.get()? {
                Some(buf) => {
                    self.inner.note_access(block);
                    return Ok(self.block_view(block, buf, page, count));
                }
                // Evicted between our observation and the borrow; retry.
                None => continue,
            }
        }
    }

    /// Non-blocking variant of [`Pager::get_page`].
    ///
    /// Returns the view only if the containing block is already
    /// loaded. When the slot is empty this schedules a background load
    /// and returns `None`; a later call picks the data up.
    pub fn try_page(&self, page: u64, count: u64) -> Result<Option<PageRef<'_>>, Status> {
        check_span(page, count)?;
        self.inner.stats.record_lookup();

        let block = (page / PAGES_PER_BLOCK) as usize;
        if (page + count - 1) / PAGES_PER_BLOCK != page / PAGES_PER_BLOCK {
            return self.try_disjoint(page, count);
        }

        let slot = &self.inner.slots[block];
        if slot.has_value() {
            self.inner.stats.record_hit();
        } else if slot.should_init() {
            if let Err(status) = self.inner.admit() {
                self.inner.stats.record_load_failure();
                slot.opps(status);
                return Err(status);
            }
            self.inner.stats.record_miss();
            self.submit_block_load(block);
            return Ok(None);
        }
        match slot.try_get()? {
            Some(buf) => {
                self.inner.note_access(block);
                Ok(Some(self.block_view(block, buf, page, count)))
            }
            None => Ok(None),
        }
    }

    /// Bytes of resident block buffers currently charged against the
    /// memory limits.
    pub fn size_used(&self) -> u64 {
        self.inner.size_used.load(Ordering::SeqCst)
    }

    /// The configured memory limits.
    pub fn limits(&self) -> &MemoryLimits {
        &self.inner.limits
    }

    /// Get the statistics.
    pub fn stats(&self) -> &PagerStats {
        &self.inner.stats
    }

    fn get_disjoint(&self, page: u64, count: u64) -> Result<PageRef<'_>, Status> {
        let len = (count * PAGE_SIZE) as usize;
        let slot = self.inner.disjoint_slot(page, len)?;
        if slot.has_value() {
            self.inner.stats.record_hit();
        }
        loop {
            if slot.should_init() {
                self.inner.stats.record_miss();
                self.submit_disjoint_load(&slot, page, len);
            }
            match slot.get()? {
                Some(buf) => return Ok(self.disjoint_ref(&slot, buf, len)),
                None => continue,
            }
        }
    }

    fn try_disjoint(&self, page: u64, count: u64) -> Result<Option<PageRef<'_>>, Status> {
        let len = (count * PAGE_SIZE) as usize;
        let slot = self.inner.disjoint_slot(page, len)?;
        if slot.has_value() {
            self.inner.stats.record_hit();
        } else if slot.should_init() {
            self.inner.stats.record_miss();
            self.submit_disjoint_load(&slot, page, len);
            return Ok(None);
        }
        match slot.try_get()? {
            Some(buf) => Ok(Some(self.disjoint_ref(&slot, buf, len))),
            None => Ok(None),
        }
    }

    fn submit_block_load(&self, block: usize) {
        self.inner.stats.record_load();
        let callback = Box::new(ReadState {
            inner: Arc::clone(&self.inner),
            target: LoadTarget::Block(block),
        });
        self.inner
            .reader
            .read(block as u64 * BLOCK_SIZE, BLOCK_SIZE as usize, callback);
    }

    fn submit_disjoint_load(&self, slot: &Arc<LazySlot>, page: u64, len: usize) {
        self.inner.stats.record_load();
        let callback = Box::new(ReadState {
            inner: Arc::clone(&self.inner),
            target: LoadTarget::Disjoint(Arc::clone(slot)),
        });
        self.inner.reader.read(page * PAGE_SIZE, len, callback);
    }

    fn block_view(
        &self,
        block: usize,
        buf: NonNull<BlockBuffer>,
        page: u64,
        count: u64,
    ) -> PageRef<'_> {
        let offset = ((page % PAGES_PER_BLOCK) * PAGE_SIZE) as usize;
        let len = (count * PAGE_SIZE) as usize;
        // Safety: the borrow taken on the slot keeps the buffer alive
        // until the PageRef releases it.
        let data = unsafe {
            NonNull::new_unchecked(buf.as_ref().as_ptr().add(offset).cast_mut())
        };
        PageRef {
            inner: &self.inner,
            target: RefTarget::Block(block),
            data,
            len,
        }
    }

    fn disjoint_ref(
        &self,
        slot: &Arc<LazySlot>,
        buf: NonNull<BlockBuffer>,
        len: usize,
    ) -> PageRef<'_> {
        // Safety: as in block_view; disjoint buffers additionally live
        // until pager teardown.
        let data = unsafe { NonNull::new_unchecked(buf.as_ref().as_ptr().cast_mut()) };
        PageRef {
            inner: &self.inner,
            target: RefTarget::Disjoint(Arc::clone(slot)),
            data,
            len,
        }
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        // Join the worker first: after this no completion callback can
        // run, so slot teardown in PagerInner::drop is unobserved.
        self.inner.reader.close();
    }
}

fn check_span(page: u64, count: u64) -> Result<(), Status> {
    let max_pages = MAX_FILE_SIZE / PAGE_SIZE;
    if count == 0 || page >= max_pages || count > max_pages - page {
        return Err(Status::ParamsOutsideAccessibleAddressSpace);
    }
    Ok(())
}

enum RefTarget {
    Block(usize),
    Disjoint(Arc<LazySlot>),
}

/// Borrowed view of one or more pages.
///
/// Holds one reference on the owning slot; the view stays valid until
/// [`PageRef::let_go`] (or drop) releases it. While any `PageRef` into
/// a block is alive, that block cannot be evicted.
pub struct PageRef<'a> {
    inner: &'a PagerInner,
    target: RefTarget,
    data: NonNull<u8>,
    len: usize,
}

impl PageRef<'_> {
    /// Release the borrow. Equivalent to dropping the reference.
    pub fn let_go(self) {}
}

impl std::fmt::Debug for PageRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef").field("len", &self.len).finish()
    }
}

impl Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: data/len point into a buffer pinned by the slot
        // reference this PageRef holds.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        match &self.target {
            RefTarget::Block(block) => self.inner.slots[*block].release(),
            RefTarget::Disjoint(slot) => slot.release(),
        }
    }
}

/// Statistics for pager operations.
pub struct PagerStats {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evicted_blocks: AtomicU64,
    eviction_passes: AtomicU64,
}

impl PagerStats {
    fn new() -> Self {
        Self {
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            evicted_blocks: AtomicU64::new(0),
            eviction_passes: AtomicU64::new(0),
        }
    }

    fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.evicted_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction_pass(&self) {
        self.eviction_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// Total `get_page`/`try_page` calls.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Lookups that found their slot already loaded.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that won the loader election and submitted a read.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Loads submitted to the reader (one per won loader election).
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Loads that completed with an error (including failed admissions).
    pub fn load_failures(&self) -> u64 {
        self.load_failures.load(Ordering::Relaxed)
    }

    /// Blocks reclaimed by eviction.
    pub fn evicted_blocks(&self) -> u64 {
        self.evicted_blocks.load(Ordering::Relaxed)
    }

    /// Completed eviction passes.
    pub fn eviction_passes(&self) -> u64 {
        self.eviction_passes.load(Ordering::Relaxed)
    }
}
