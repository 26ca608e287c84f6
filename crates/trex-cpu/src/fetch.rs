//! Address translation for instruction fetch.
//!
//! [`prefetch`] turns the current instruction pointer into a [`FetchWindow`]: a physical page
//! plus the number of bytes that can be fetched from it before a page or segment-limit edge.
//! The window caches `bias = page_offset - rip`, so "is `rip` still inside the window?" is a
//! single wrapping add and compare on the hot path.

use trex_mem::{PAGE_OFFSET_MASK, PAGE_SIZE};

use crate::bus::{AccessKind, CpuBus};
use crate::error::FetchFault;
use crate::guard::{Guard, WatchKind};
use crate::state::CpuState;

/// Longest legal x86 instruction in bytes.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Code size and privilege level an instruction stream was decoded under.
///
/// Identical bytes decode differently in 16-, 32- and 64-bit code, so the mode is part of every
/// trace cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchMode(u8);

impl FetchMode {
    pub fn new(code_bits: u32, cpl: u8) -> Self {
        let size = match code_bits {
            16 => 0,
            32 => 1,
            _ => 2,
        };
        Self(size | ((cpl & 3) << 2))
    }

    pub fn code_bits(self) -> u32 {
        match self.0 & 3 {
            0 => 16,
            1 => 32,
            _ => 64,
        }
    }

    pub fn cpl(self) -> u8 {
        self.0 >> 2
    }

    /// Small integer mixed into the trace slot index.
    pub fn mask(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    page_paddr: u64,
    bias: u64,
    size: u32,
    entry: u32,
    mapping_generation: u64,
    watched: bool,
}

impl FetchWindow {
    pub const fn invalid() -> Self {
        Self {
            page_paddr: 0,
            bias: 0,
            size: 0,
            entry: 0,
            mapping_generation: 0,
            watched: false,
        }
    }

    pub fn invalidate(&mut self) {
        self.size = 0;
    }

    /// Offset of `rip` inside the window's page, if `rip` is still covered.
    #[inline]
    pub fn offset_of(&self, rip: u64) -> Option<u32> {
        let offset = rip.wrapping_add(self.bias);
        (offset < u64::from(self.size)).then_some(offset as u32)
    }

    /// Offset of the instruction pointer the window was translated for.
    pub fn entry_offset(&self) -> u32 {
        self.entry
    }

    pub fn paddr(&self, offset: u32) -> u64 {
        self.page_paddr + u64::from(offset)
    }

    pub fn page_paddr(&self) -> u64 {
        self.page_paddr
    }

    /// Bytes fetchable from `offset` before the window ends.
    pub fn remaining(&self, offset: u32) -> usize {
        self.size.saturating_sub(offset) as usize
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mapping_generation(&self) -> u64 {
        self.mapping_generation
    }

    /// Whether the guard reported an execute watchpoint somewhere inside the window.
    pub fn watched(&self) -> bool {
        self.watched
    }
}

pub fn is_canonical(addr: u64) -> bool {
    (((addr << 16) as i64) >> 16) as u64 == addr
}

/// Builds the fetch window covering `rip` for the processor's current mode.
pub fn prefetch<B: CpuBus + ?Sized>(
    state: &CpuState,
    rip: u64,
    bus: &mut B,
    guard: &mut dyn Guard,
) -> Result<FetchWindow, FetchFault> {
    let (linear, page_offset, bias, size) = if state.bitness() == 64 {
        if !is_canonical(rip) {
            return Err(FetchFault::NonCanonical { rip });
        }
        let page_offset = rip & PAGE_OFFSET_MASK;
        (rip, page_offset, page_offset.wrapping_sub(rip), PAGE_SIZE)
    } else {
        let eip = rip & 0xFFFF_FFFF;
        let limit = state.cs.limit;
        if eip > u64::from(limit) {
            return Err(FetchFault::SegmentLimit { eip, limit });
        }
        let linear = state.cs.base.wrapping_add(eip) & 0xFFFF_FFFF;
        let page_offset = linear & PAGE_OFFSET_MASK;
        let bias = page_offset.wrapping_sub(eip);
        // Offset (inside this page) of the last byte below the limit.
        let limit_offset = u64::from(limit).wrapping_add(bias);
        let size = if limit_offset < PAGE_SIZE {
            limit_offset + 1
        } else {
            PAGE_SIZE
        };
        (linear, page_offset, bias, size)
    };

    let paddr = bus.translate(linear, AccessKind::Execute, state.cpl)?;
    let page_paddr = paddr & !PAGE_OFFSET_MASK;
    if bus.code_page(page_paddr).is_none() {
        return Err(FetchFault::Unbacked { paddr });
    }

    let window_linear = linear - page_offset;
    let watched = guard.watchpoint_hit(window_linear, size as usize, WatchKind::Execute);

    Ok(FetchWindow {
        page_paddr,
        bias,
        size: size as u32,
        entry: page_offset as u32,
        mapping_generation: bus.mapping_generation(),
        watched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{FlatBus, PageMapping};
    use crate::guard::NoGuard;
    use crate::state::{CpuMode, Segment};

    #[test]
    fn fetch_mode_round_trips_fields() {
        let mode = FetchMode::new(32, 3);
        assert_eq!(mode.code_bits(), 32);
        assert_eq!(mode.cpl(), 3);
        assert_ne!(FetchMode::new(16, 0), FetchMode::new(32, 0));
    }

    #[test]
    fn window_covers_rest_of_page() {
        let mut bus = FlatBus::new(0x4000).unwrap();
        let state = CpuState::new(CpuMode::Protected);
        let window = prefetch(&state, 0x1234, &mut bus, &mut NoGuard).unwrap();
        assert_eq!(window.offset_of(0x1234), Some(0x234));
        assert_eq!(window.entry_offset(), 0x234);
        assert_eq!(window.remaining(0x234), 0x1000 - 0x234);
        assert_eq!(window.offset_of(0x2000), None);
        assert_eq!(window.offset_of(0x0FFF), None);
        assert_eq!(window.paddr(0x234), 0x1234);
    }

    #[test]
    fn segment_limit_clamps_window() {
        let mut bus = FlatBus::new(0x4000).unwrap();
        let mut state = CpuState::new(CpuMode::Protected);
        state.cs = Segment {
            base: 0x1000,
            limit: 0x0123,
            ..Segment::flat32(0x08)
        };
        let window = prefetch(&state, 0x0100, &mut bus, &mut NoGuard).unwrap();
        // Bytes 0..=0x123 of the segment are fetchable.
        assert_eq!(window.offset_of(0x0123), Some(0x123));
        assert_eq!(window.offset_of(0x0124), None);
        assert_eq!(window.remaining(0x100), 0x24);

        assert_eq!(
            prefetch(&state, 0x0124, &mut bus, &mut NoGuard),
            Err(FetchFault::SegmentLimit {
                eip: 0x124,
                limit: 0x123
            })
        );
    }

    #[test]
    fn long_mode_rejects_non_canonical() {
        let mut bus = FlatBus::new(0x1000).unwrap();
        let state = CpuState::new(CpuMode::Long);
        let rip = 0x0000_8000_0000_0000;
        assert_eq!(
            prefetch(&state, rip, &mut bus, &mut NoGuard),
            Err(FetchFault::NonCanonical { rip })
        );
        assert!(is_canonical(0xFFFF_8000_0000_0000));
    }

    #[test]
    fn unmapped_or_unbacked_code_faults() {
        let mut bus = FlatBus::new(0x2000).unwrap();
        let state = CpuState::new(CpuMode::Protected);
        assert_eq!(
            prefetch(&state, 0x8000, &mut bus, &mut NoGuard),
            Err(FetchFault::Unbacked { paddr: 0x8000 })
        );

        bus.map_page(0x1000, PageMapping::rwx(0));
        let err = prefetch(&state, 0x5000, &mut bus, &mut NoGuard).unwrap_err();
        assert!(matches!(err, FetchFault::Page(pf) if pf.addr == 0x5000));

        let window = prefetch(&state, 0x1010, &mut bus, &mut NoGuard).unwrap();
        assert_eq!(window.paddr(0x10), 0x10);
        assert_eq!(window.mapping_generation(), 1);
    }
}
