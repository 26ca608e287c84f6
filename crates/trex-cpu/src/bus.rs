//! Memory interface the execution core runs against.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use trex_mem::{
    GuestMemoryResult, PhysicalMemory, WriteStampTable, PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("page fault at {addr:#x} (error code {error_code:#x})")]
pub struct PageFault {
    /// Faulting linear address (to be written to CR2).
    pub addr: u64,
    /// x86 #PF error code.
    pub error_code: u32,
}

impl PageFault {
    pub const EC_P: u32 = 1 << 0;
    pub const EC_WR: u32 = 1 << 1;
    pub const EC_US: u32 = 1 << 2;
    pub const EC_ID: u32 = 1 << 4;

    pub fn new(addr: u64, present: bool, access: AccessKind, cpl: u8) -> Self {
        let mut error_code = 0u32;
        if present {
            error_code |= Self::EC_P;
        }
        if access == AccessKind::Write {
            error_code |= Self::EC_WR;
        }
        if cpl == 3 {
            error_code |= Self::EC_US;
        }
        if access == AccessKind::Execute {
            error_code |= Self::EC_ID;
        }
        Self { addr, error_code }
    }
}

/// Read-only view of one 4 KiB page of guest RAM, valid while a trace is being decoded.
#[derive(Debug, Clone, Copy)]
pub struct CodePage<'a> {
    bytes: &'a [u8],
}

impl<'a> CodePage<'a> {
    /// Wraps a page-sized slice. Returns `None` for any other length.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        (bytes.len() == PAGE_SIZE as usize).then_some(Self { bytes })
    }

    /// Returns up to `len` bytes starting at `offset`, clipped to the end of the page.
    pub fn window(&self, offset: usize, len: usize) -> &'a [u8] {
        let start = offset.min(self.bytes.len());
        let end = start.saturating_add(len).min(self.bytes.len());
        &self.bytes[start..end]
    }
}

/// Guest memory as seen by one processor.
///
/// Implementations must report every store into RAM to the [`WriteStampTable`] returned by
/// [`CpuBus::write_stamps`]; the trace cache relies on it for coherency.
pub trait CpuBus {
    /// Translates a linear address for an access at privilege level `cpl`.
    fn translate(&mut self, linear: u64, access: AccessKind, cpl: u8) -> Result<u64, PageFault>;

    /// Returns the RAM page containing `paddr`, or `None` if instructions cannot be fetched from it.
    fn code_page(&self, paddr: u64) -> Option<CodePage<'_>>;

    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Bumped whenever a linear-to-physical mapping changes. Cached fetch windows recorded under
    /// an older value are refetched.
    fn mapping_generation(&self) -> u64 {
        0
    }

    fn write_stamps(&self) -> &Arc<WriteStampTable>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    pub frame: u64,
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
}

impl PageMapping {
    pub const fn rwx(frame: u64) -> Self {
        Self {
            frame,
            writable: true,
            user: true,
            executable: true,
        }
    }
}

/// RAM-backed bus with optional 4 KiB page mappings.
///
/// Without mappings linear addresses are physical. Once a mapping is installed every linear page
/// must be mapped explicitly.
#[derive(Debug)]
pub struct FlatBus {
    mem: PhysicalMemory,
    pages: Option<FxHashMap<u64, PageMapping>>,
    generation: u64,
}

impl FlatBus {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        Ok(Self::from_memory(PhysicalMemory::new(size)?))
    }

    pub fn from_memory(mem: PhysicalMemory) -> Self {
        Self {
            mem,
            pages: None,
            generation: 0,
        }
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.mem
    }

    /// Copies `bytes` to `paddr`. Goes through the normal store path.
    pub fn load(&mut self, paddr: u64, bytes: &[u8]) -> GuestMemoryResult<()> {
        self.mem.write_from(paddr, bytes)
    }

    pub fn map_page(&mut self, linear: u64, mapping: PageMapping) {
        self.pages
            .get_or_insert_with(FxHashMap::default)
            .insert(linear >> PAGE_SHIFT, mapping);
        self.generation += 1;
    }

    pub fn unmap_page(&mut self, linear: u64) {
        if let Some(pages) = self.pages.as_mut() {
            pages.remove(&(linear >> PAGE_SHIFT));
        }
        self.generation += 1;
    }
}

impl CpuBus for FlatBus {
    fn translate(&mut self, linear: u64, access: AccessKind, cpl: u8) -> Result<u64, PageFault> {
        let Some(pages) = self.pages.as_ref() else {
            return Ok(linear);
        };
        let Some(mapping) = pages.get(&(linear >> PAGE_SHIFT)) else {
            return Err(PageFault::new(linear, false, access, cpl));
        };
        let allowed = match access {
            AccessKind::Read => true,
            AccessKind::Write => mapping.writable,
            AccessKind::Execute => mapping.executable,
        } && (cpl != 3 || mapping.user);
        if !allowed {
            return Err(PageFault::new(linear, true, access, cpl));
        }
        Ok((mapping.frame << PAGE_SHIFT) | (linear & PAGE_OFFSET_MASK))
    }

    fn code_page(&self, paddr: u64) -> Option<CodePage<'_>> {
        self.mem.page(paddr).and_then(CodePage::new)
    }

    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.mem.read_into(paddr, dst)
    }

    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        self.mem.write_from(paddr, src)
    }

    fn mapping_generation(&self) -> u64 {
        self.generation
    }

    fn write_stamps(&self) -> &Arc<WriteStampTable> {
        self.mem.write_stamps()
    }
}
