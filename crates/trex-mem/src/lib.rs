//! Guest physical memory and the code write-tracking table shared by every virtual processor.

pub mod phys;
pub mod write_stamp;

pub use phys::{GuestMemoryError, GuestMemoryResult, PhysicalMemory};
pub use write_stamp::{
    PageStamp, WriteStampTable, CHUNKS_PER_PAGE, CHUNK_SHIFT, CHUNK_SIZE, PAGE_OFFSET_MASK,
    PAGE_SHIFT, PAGE_SIZE,
};
