use std::sync::Arc;

use crate::write_stamp::{WriteStampTable, PAGE_OFFSET_MASK, PAGE_SIZE};

/// Errors returned by [`PhysicalMemory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuestMemoryError {
    /// The requested address range is outside the guest physical memory size.
    #[error("guest memory access out of range: paddr={paddr:#x} len={len} size={size:#x}")]
    OutOfRange { paddr: u64, len: usize, size: u64 },
    /// The requested size cannot be represented by the current platform's `usize`.
    #[error("guest memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Dense guest physical RAM.
///
/// All writes go through [`PhysicalMemory::write_from`], which reports them to the shared
/// [`WriteStampTable`] so cached traces over the written bytes are invalidated.
#[derive(Debug)]
pub struct PhysicalMemory {
    data: Vec<u8>,
    stamps: Arc<WriteStampTable>,
}

impl PhysicalMemory {
    /// Allocates zeroed RAM of `size` bytes (rounded up to a whole page) together with a fresh
    /// write-stamp table.
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let stamps = Arc::new(WriteStampTable::for_memory_size(size));
        Self::with_stamps(size, stamps)
    }

    /// Allocates RAM that reports stores to an existing table.
    pub fn with_stamps(size: u64, stamps: Arc<WriteStampTable>) -> GuestMemoryResult<Self> {
        let rounded = size
            .checked_add(PAGE_OFFSET_MASK)
            .map(|s| s & !PAGE_OFFSET_MASK)
            .ok_or(GuestMemoryError::SizeTooLarge { size })?;
        let len = usize::try_from(rounded).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        Ok(Self {
            data: vec![0; len],
            stamps,
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn write_stamps(&self) -> &Arc<WriteStampTable> {
        &self.stamps
    }

    pub fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let start = self.check_range(paddr, dst.len())?;
        dst.copy_from_slice(&self.data[start..start + dst.len()]);
        Ok(())
    }

    pub fn write_from(&mut self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let start = self.check_range(paddr, src.len())?;
        self.data[start..start + src.len()].copy_from_slice(src);
        self.stamps.on_store(paddr, src.len());
        Ok(())
    }

    pub fn read_u8(&self, paddr: u64) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(paddr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn write_u8(&mut self, paddr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(paddr, &[value])
    }

    /// Returns the whole page containing `paddr`, or `None` if the page is not backed by RAM.
    pub fn page(&self, paddr: u64) -> Option<&[u8]> {
        let base = usize::try_from(paddr & !PAGE_OFFSET_MASK).ok()?;
        self.data.get(base..base.checked_add(PAGE_SIZE as usize)?)
    }

    fn check_range(&self, paddr: u64, len: usize) -> GuestMemoryResult<usize> {
        let size = self.size();
        let end = paddr
            .checked_add(len as u64)
            .ok_or(GuestMemoryError::OutOfRange { paddr, len, size })?;
        if end > size {
            return Err(GuestMemoryError::OutOfRange { paddr, len, size });
        }
        // `end <= size` and `size` came from a `usize` length.
        Ok(paddr as usize)
    }
}
