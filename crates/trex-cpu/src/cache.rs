//! Physically keyed cache of decoded traces.
//!
//! Slots are direct mapped on `(paddr, fetch mode)`. Every record of every trace lives in one
//! record pool; when a new trace might not fit, the whole cache is dropped and rebuilt lazily.
//! Staleness is never pushed into the cache: a slot is checked against the write-stamp table when
//! it is looked up and rebuilt if a covered chunk was written since it was decoded.

use std::sync::Arc;

use tracing::{debug, trace, warn};
use trex_mem::{PageStamp, WriteStampTable, PAGE_OFFSET_MASK, PAGE_SHIFT};

use crate::bus::CpuBus;
use crate::config::CpuConfig;
use crate::decoder::{DecodeOutcome, Decoder, InstructionRecord};
use crate::error::{Fault, FetchFault, ResourceExhaustion};
use crate::fetch::{FetchMode, FetchWindow, MAX_INSTRUCTION_LEN};
use crate::linker::TraceLink;
use crate::trace::{Trace, MAX_TRACE_PAGES};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TraceCacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found the right trace but a covered chunk had been written.
    pub stale: u64,
    pub merges: u64,
    pub page_splits: u64,
    pub links_followed: u64,
    pub flushes: u64,
}

/// Where a trace starts and how many bytes the fetch window allows from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSite {
    pub paddr: u64,
    pub mode: FetchMode,
    pub rip: u64,
    pub remaining: usize,
}

enum Built {
    Straight,
    Merged(usize),
    NeedsBoundary,
}

pub struct TraceCache {
    slots: Box<[Option<Trace>]>,
    pool: Vec<InstructionRecord>,
    pool_capacity: usize,
    max_trace_len: usize,
    stamps: Arc<WriteStampTable>,
    link_epoch: u64,
    pub(crate) stats: TraceCacheStats,
}

impl TraceCache {
    /// Creates an empty cache. `config` must have passed [`CpuConfig::validate`].
    pub fn new(config: &CpuConfig, stamps: Arc<WriteStampTable>) -> Self {
        Self {
            slots: (0..config.trace_slots).map(|_| None).collect(),
            pool: Vec::new(),
            pool_capacity: config.record_pool,
            max_trace_len: config.max_trace_len,
            stamps,
            link_epoch: 0,
            stats: TraceCacheStats::default(),
        }
    }

    pub fn stats(&self) -> TraceCacheStats {
        self.stats
    }

    pub fn stamps(&self) -> &Arc<WriteStampTable> {
        &self.stamps
    }

    pub fn max_trace_len(&self) -> usize {
        self.max_trace_len
    }

    /// Number of occupied slots.
    pub fn live_traces(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Records currently allocated in the pool, including those of evicted traces.
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Bumped whenever a slot is emptied or replaced. Cached links from older epochs are dead.
    pub fn link_epoch(&self) -> u64 {
        self.link_epoch
    }

    pub fn trace(&self, slot: usize) -> Option<&Trace> {
        self.slots.get(slot)?.as_ref()
    }

    /// Returns the slot's trace for `(paddr, mode)` without validating it.
    pub fn peek(&self, paddr: u64, mode: FetchMode) -> Option<&Trace> {
        self.slots[self.slot_index(paddr, mode)]
            .as_ref()
            .filter(|t| t.paddr == paddr && t.mode == mode)
    }

    pub fn records(&self, trace: &Trace) -> &[InstructionRecord] {
        &self.pool[trace.records()]
    }

    pub(crate) fn record(&self, idx: usize) -> &InstructionRecord {
        &self.pool[idx]
    }

    fn slot_index(&self, paddr: u64, mode: FetchMode) -> usize {
        ((paddr as usize) ^ mode.mask()) & (self.slots.len() - 1)
    }

    /// Finds a current trace for `(paddr, mode)`.
    pub fn lookup(&mut self, paddr: u64, mode: FetchMode) -> Option<usize> {
        self.stats.lookups += 1;
        let idx = self.slot_index(paddr, mode);
        let trace = self.slots[idx].as_mut()?;
        if trace.paddr != paddr || trace.mode != mode {
            return None;
        }
        if !trace.revalidate(&self.stamps) {
            trace!(paddr, "stale trace");
            self.stats.stale += 1;
            self.evict(idx);
            return None;
        }
        self.stats.hits += 1;
        Some(idx)
    }

    /// Returns the slot of a current trace starting at `site`, decoding one if needed.
    ///
    /// `next_window` translates the page after the site's window; it is only called when the first
    /// instruction straddles the window's end.
    pub fn lookup_or_build<B, F>(
        &mut self,
        bus: &mut B,
        decoder: &dyn Decoder,
        site: FetchSite,
        next_window: F,
    ) -> Result<usize, Fault>
    where
        B: CpuBus + ?Sized,
        F: FnOnce(&mut B, u64) -> Result<FetchWindow, Fault>,
    {
        if let Some(idx) = self.lookup(site.paddr, site.mode) {
            return Ok(idx);
        }
        self.build(bus, decoder, site, next_window)
    }

    /// Drops every trace and the whole record pool.
    pub fn flush(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.pool.clear();
        self.link_epoch += 1;
        self.stats.flushes += 1;
        debug!("trace cache flushed");
    }

    fn evict(&mut self, idx: usize) {
        if self.slots[idx].take().is_some() {
            self.link_epoch += 1;
        }
    }

    fn build<B, F>(
        &mut self,
        bus: &mut B,
        decoder: &dyn Decoder,
        site: FetchSite,
        next_window: F,
    ) -> Result<usize, Fault>
    where
        B: CpuBus + ?Sized,
        F: FnOnce(&mut B, u64) -> Result<FetchWindow, Fault>,
    {
        self.stats.misses += 1;
        if self.pool.len() + self.max_trace_len + 1 > self.pool_capacity {
            debug!(records = self.pool.len(), "record pool exhausted");
            self.flush();
        }
        let idx = self.slot_index(site.paddr, site.mode);
        self.evict(idx);

        let page = site.paddr >> PAGE_SHIFT;
        let stamp = self.stamps.stamp(page);
        let start = self.pool.len();
        let mut offset = (site.paddr & PAGE_OFFSET_MASK) as usize;
        let mut remaining = site.remaining;
        let mut byte_len = 0usize;

        let built = {
            let code = bus
                .code_page(site.paddr)
                .ok_or(FetchFault::Unbacked { paddr: site.paddr })?;
            loop {
                let n = self.pool.len() - start;
                if n >= self.max_trace_len {
                    break Built::Straight;
                }
                let bytes = code.window(offset, remaining.min(MAX_INSTRUCTION_LEN));
                let rec = match decoder.decode(bytes, site.mode) {
                    DecodeOutcome::Record(rec) if rec.len != 0 && usize::from(rec.len) <= bytes.len() => rec,
                    DecodeOutcome::NeedsMoreBytes if n == 0 => break Built::NeedsBoundary,
                    DecodeOutcome::Record(_) | DecodeOutcome::Invalid if n == 0 => {
                        return Err(Fault::Decode { rip: site.rip });
                    }
                    _ => {
                        trace!(paddr = site.paddr, records = n, "trace cut short by undecodable bytes");
                        break Built::Straight;
                    }
                };
                let len = usize::from(rec.len);
                self.pool.push(InstructionRecord { link: None, ..rec });
                offset += len;
                remaining -= len;
                byte_len += len;
                if rec.ends_trace || remaining == 0 {
                    break Built::Straight;
                }
                if remaining >= MAX_INSTRUCTION_LEN {
                    let next = site.paddr + byte_len as u64;
                    if let Some(successor) = self.mergeable(next, site.mode, n + 1) {
                        break Built::Merged(successor);
                    }
                }
            }
        };

        match built {
            Built::NeedsBoundary => return self.boundary_fetch(bus, decoder, site, stamp, idx, next_window),
            Built::Merged(successor) => byte_len += self.merge(successor),
            Built::Straight => {}
        }

        let mask = WriteStampTable::chunk_mask(site.paddr, byte_len as u64);
        let first = self.stamps.register_code(page, mask, stamp);
        debug!(
            paddr = site.paddr,
            records = self.pool.len() - start,
            bytes = byte_len,
            "built trace"
        );
        Ok(self.commit(idx, site, start, byte_len, [Some(first), None]))
    }

    /// Returns the slot of a current single-page trace at `paddr` that fits behind `prefix_len`
    /// records.
    fn mergeable(&self, paddr: u64, mode: FetchMode, prefix_len: usize) -> Option<usize> {
        let idx = self.slot_index(paddr, mode);
        let trace = self.slots[idx].as_ref()?;
        if trace.paddr != paddr || trace.mode != mode || trace.is_page_split() {
            return None;
        }
        if prefix_len + trace.len() > self.max_trace_len {
            return None;
        }
        let cov = trace.coverage[0].as_ref()?;
        if cov.page != paddr >> PAGE_SHIFT || self.stamps.check(cov).is_none() {
            return None;
        }
        Some(idx)
    }

    /// Appends a copy of the successor's records to the trace being built; returns its byte length.
    fn merge(&mut self, successor: usize) -> usize {
        let Some(trace) = self.slots[successor].as_ref() else {
            return 0;
        };
        let range = trace.records();
        let byte_len = trace.byte_len as usize;
        let copied = self.pool.len();
        self.pool.extend_from_within(range);
        for rec in &mut self.pool[copied..] {
            rec.link = None;
        }
        self.stats.merges += 1;
        trace!(successor, records = self.pool.len() - copied, "merged successor trace");
        byte_len
    }

    /// Decodes the single instruction that straddles the end of the site's window.
    fn boundary_fetch<B, F>(
        &mut self,
        bus: &mut B,
        decoder: &dyn Decoder,
        site: FetchSite,
        stamp: u32,
        idx: usize,
        next_window: F,
    ) -> Result<usize, Fault>
    where
        B: CpuBus + ?Sized,
        F: FnOnce(&mut B, u64) -> Result<FetchWindow, Fault>,
    {
        if site.remaining >= MAX_INSTRUCTION_LEN {
            warn!(rip = site.rip, remaining = site.remaining, "instruction longer than the architectural maximum");
            return Err(ResourceExhaustion::TooManyPrefixes {
                remaining: site.remaining,
            }
            .into());
        }

        let mut buf = [0u8; MAX_INSTRUCTION_LEN];
        let head_len = {
            let code = bus
                .code_page(site.paddr)
                .ok_or(FetchFault::Unbacked { paddr: site.paddr })?;
            let head = code.window((site.paddr & PAGE_OFFSET_MASK) as usize, site.remaining);
            buf[..head.len()].copy_from_slice(head);
            head.len()
        };

        let next_rip = site.rip.wrapping_add(head_len as u64);
        let window = next_window(bus, next_rip)?;
        let Some(next_offset) = window.offset_of(next_rip) else {
            return Err(ResourceExhaustion::BoundaryDecodeFailed {
                available: head_len,
            }
            .into());
        };
        let tail_paddr = window.paddr(next_offset);
        let tail_page = tail_paddr >> PAGE_SHIFT;
        let tail_stamp = self.stamps.stamp(tail_page);
        let available = {
            let code = bus
                .code_page(tail_paddr)
                .ok_or(FetchFault::Unbacked { paddr: tail_paddr })?;
            let want = window.remaining(next_offset).min(MAX_INSTRUCTION_LEN - head_len);
            let tail = code.window((tail_paddr & PAGE_OFFSET_MASK) as usize, want);
            buf[head_len..head_len + tail.len()].copy_from_slice(tail);
            head_len + tail.len()
        };

        let rec = match decoder.decode(&buf[..available], site.mode) {
            DecodeOutcome::Record(rec) if rec.len != 0 && usize::from(rec.len) <= available => rec,
            DecodeOutcome::Invalid => return Err(Fault::Decode { rip: site.rip }),
            outcome => {
                warn!(rip = site.rip, available, ?outcome, "boundary instruction did not decode");
                return Err(ResourceExhaustion::BoundaryDecodeFailed { available }.into());
            }
        };

        let len = usize::from(rec.len);
        let head_used = len.min(head_len);
        let tail_used = len - head_used;
        let first = self.stamps.register_code(
            site.paddr >> PAGE_SHIFT,
            WriteStampTable::chunk_mask(site.paddr, head_used as u64),
            stamp,
        );
        let second: Option<PageStamp> = (tail_used > 0).then(|| {
            self.stamps.register_code(
                tail_page,
                WriteStampTable::chunk_mask(tail_paddr, tail_used as u64),
                tail_stamp,
            )
        });
        if second.is_some() {
            self.stats.page_splits += 1;
        }

        let start = self.pool.len();
        self.pool.push(InstructionRecord { link: None, ..rec });
        debug!(paddr = site.paddr, tail_paddr, len, "built page-split trace");
        Ok(self.commit(idx, site, start, len, [Some(first), second]))
    }

    fn commit(
        &mut self,
        idx: usize,
        site: FetchSite,
        start: usize,
        byte_len: usize,
        coverage: [Option<PageStamp>; MAX_TRACE_PAGES],
    ) -> usize {
        let len = self.pool.len() - start;
        self.slots[idx] = Some(Trace {
            paddr: site.paddr,
            mode: site.mode,
            start: start as u32,
            len: len as u16,
            byte_len: byte_len as u32,
            coverage,
        });
        idx
    }

    /// Follows the link cached on record `from` if it still leads to the current trace for
    /// `(paddr, mode)`.
    pub(crate) fn cached_link(&self, from: usize, paddr: u64, mode: FetchMode) -> Option<usize> {
        let link = self.pool.get(from)?.link?;
        if link.epoch != self.link_epoch
            || link.generation != self.stamps.generation()
            || link.paddr != paddr
        {
            return None;
        }
        let slot = link.slot as usize;
        let target = self.slots.get(slot)?.as_ref()?;
        (target.paddr == paddr && target.mode == mode).then_some(slot)
    }

    pub(crate) fn store_link(&mut self, from: usize, slot: usize, paddr: u64) {
        let link = TraceLink {
            slot: slot as u32,
            paddr,
            epoch: self.link_epoch,
            generation: self.stamps.generation(),
        };
        if let Some(rec) = self.pool.get_mut(from) {
            rec.link = Some(link);
        }
    }
}
