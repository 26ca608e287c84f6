//! Per-page write stamps used to detect stores into cached code.
//!
//! Every physical page owns three words:
//!
//! - `code`: chunks that currently back at least one cached trace,
//! - `dirty`: chunks written while they were cached (sticky until [`WriteStampTable::on_flush`]),
//! - `stamp`: bumped every time a store lands on a `code` chunk.
//!
//! A trace remembers the stamp of each page it covers together with the chunk mask it occupies.
//! It is still current if the stamp did not move, or if none of the chunks that moved it belong
//! to the trace.
//!
//! Stores that touch no cached chunk return after a single relaxed load, which keeps the common
//! data write path cheap.
//!
//! `dirty` is never cleared when a chunk is registered again. Older snapshots over that chunk may
//! still sit in another processor's cache and must keep failing their check. The price is that a
//! trace rebuilt over a once-dirty chunk goes stale on the next stamp bump anywhere in its page,
//! until [`WriteStampTable::on_flush`] starts over.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// log2 of the guest page size.
pub const PAGE_SHIFT: u32 = 12;
/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Mask of the in-page offset.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// log2 of the code-tracking granularity.
pub const CHUNK_SHIFT: u32 = 7;
/// Code-tracking granularity in bytes.
pub const CHUNK_SIZE: u64 = 1 << CHUNK_SHIFT;
/// Number of chunks per page. Each chunk is one bit of a `u32` mask.
pub const CHUNKS_PER_PAGE: u32 = (PAGE_SIZE >> CHUNK_SHIFT) as u32;

const _: () = assert!(CHUNKS_PER_PAGE == u32::BITS);

#[derive(Debug, Default)]
struct StampEntry {
    code: AtomicU32,
    dirty: AtomicU32,
    stamp: AtomicU32,
}

/// Snapshot of one page taken when a trace was built over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageStamp {
    /// Physical page frame number (`paddr >> PAGE_SHIFT`).
    pub page: u64,
    /// Page stamp observed before the bytes were decoded.
    pub stamp: u32,
    /// Chunks of the page the trace was decoded from.
    pub mask: u32,
}

/// Shared, lock-free table of page write stamps.
///
/// The table is sized for the guest's physical memory. Pages outside of it (MMIO, ROM images
/// served by other devices) are never tracked: stores to them are ignored and snapshots of them
/// are always current.
#[derive(Debug)]
pub struct WriteStampTable {
    entries: Box<[StampEntry]>,
    generation: AtomicU64,
}

impl WriteStampTable {
    pub fn new(pages: usize) -> Self {
        let entries = (0..pages).map(|_| StampEntry::default()).collect();
        Self {
            entries,
            generation: AtomicU64::new(0),
        }
    }

    /// Creates a table covering `bytes` of physical memory, rounded up to whole pages.
    pub fn for_memory_size(bytes: u64) -> Self {
        let pages = bytes.div_ceil(PAGE_SIZE);
        Self::new(usize::try_from(pages).unwrap_or(usize::MAX))
    }

    pub fn pages(&self) -> usize {
        self.entries.len()
    }

    /// Returns the chunk bits covering `[offset, offset + len)` inside one page.
    ///
    /// The range is clipped to the page; an empty range yields an empty mask.
    pub fn chunk_mask(offset: u64, len: u64) -> u32 {
        let offset = offset & PAGE_OFFSET_MASK;
        if len == 0 {
            return 0;
        }
        let end = offset.saturating_add(len - 1).min(PAGE_OFFSET_MASK);
        let lo = (offset >> CHUNK_SHIFT) as u32;
        let hi = (end >> CHUNK_SHIFT) as u32;
        (u32::MAX >> (u32::BITS - 1 - hi)) & (u32::MAX << lo)
    }

    /// Global counter of stores that hit cached code. Any movement means some trace may be stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn stamp(&self, page: u64) -> u32 {
        self.entry(page)
            .map_or(0, |e| e.stamp.load(Ordering::Acquire))
    }

    pub fn code_mask(&self, page: u64) -> u32 {
        self.entry(page).map_or(0, |e| e.code.load(Ordering::Acquire))
    }

    pub fn dirty_mask(&self, page: u64) -> u32 {
        self.entry(page).map_or(0, |e| e.dirty.load(Ordering::Acquire))
    }

    /// Marks `mask` of `page` as cached code and returns the snapshot a trace should keep.
    ///
    /// `stamp` must be the value read through [`WriteStampTable::stamp`] before the bytes were
    /// decoded, so a store that raced with decoding makes the new trace stale immediately.
    pub fn register_code(&self, page: u64, mask: u32, stamp: u32) -> PageStamp {
        if let Some(entry) = self.entry(page) {
            entry.code.fetch_or(mask, Ordering::AcqRel);
        }
        PageStamp { page, stamp, mask }
    }

    /// Returns the current stamp of the snapshot's page if the snapshot is still current.
    ///
    /// Callers may replace their recorded stamp with the returned value so later checks take the
    /// stamp-equality path.
    pub fn check(&self, snapshot: &PageStamp) -> Option<u32> {
        let Some(entry) = self.entry(snapshot.page) else {
            return Some(snapshot.stamp);
        };
        // Stores publish `dirty` before bumping `stamp`, so reading the stamp first guarantees
        // that every store counted in `current` is visible in the dirty mask below.
        let current = entry.stamp.load(Ordering::Acquire);
        if current == snapshot.stamp {
            return Some(current);
        }
        if entry.dirty.load(Ordering::Acquire) & snapshot.mask == 0 {
            Some(current)
        } else {
            None
        }
    }

    /// Records a store of `len` bytes at `paddr`. Must be called by every path that writes
    /// guest physical memory.
    pub fn on_store(&self, paddr: u64, len: usize) {
        let mut addr = paddr;
        let mut left = len as u64;
        while left != 0 {
            let page = addr >> PAGE_SHIFT;
            if page >= self.entries.len() as u64 {
                return;
            }
            let offset = addr & PAGE_OFFSET_MASK;
            let chunk = left.min(PAGE_SIZE - offset);
            self.store_page(page, Self::chunk_mask(offset, chunk));
            left -= chunk;
            addr = match addr.checked_add(chunk) {
                Some(next) => next,
                None => return,
            };
        }
    }

    fn store_page(&self, page: u64, mask: u32) {
        let Some(entry) = self.entry(page) else {
            return;
        };
        if entry.code.load(Ordering::Relaxed) & mask == 0 {
            return;
        }
        entry.dirty.fetch_or(mask, Ordering::AcqRel);
        entry.code.fetch_and(!mask, Ordering::AcqRel);
        entry.stamp.fetch_add(1, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(page, mask, "store hit cached code");
    }

    /// Forgets all tracking state.
    ///
    /// Only valid together with a flush of every trace cache that took snapshots from this table:
    /// stamps restart from zero, so surviving snapshots could otherwise appear current.
    pub fn on_flush(&self) {
        for entry in self.entries.iter() {
            entry.code.store(0, Ordering::Release);
            entry.dirty.store(0, Ordering::Release);
            entry.stamp.store(0, Ordering::Release);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn entry(&self, page: u64) -> Option<&StampEntry> {
        usize::try_from(page).ok().and_then(|idx| self.entries.get(idx))
    }
}
