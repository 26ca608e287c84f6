use trex_mem::{PageStamp, WriteStampTable};

use crate::fetch::FetchMode;

/// Pages a single trace may cover. Only boundary-fetched traces use the second one.
pub const MAX_TRACE_PAGES: usize = 2;

/// A cached run of decoded instructions starting at `paddr`.
///
/// The records live in the owning cache's record pool; the trace only holds their index range.
#[derive(Debug, Clone)]
pub struct Trace {
    pub(crate) paddr: u64,
    pub(crate) mode: FetchMode,
    pub(crate) start: u32,
    pub(crate) len: u16,
    pub(crate) byte_len: u32,
    pub(crate) coverage: [Option<PageStamp>; MAX_TRACE_PAGES],
}

impl Trace {
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    /// Number of instruction records.
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Guest bytes decoded into this trace.
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    pub fn is_page_split(&self) -> bool {
        self.coverage[1].is_some()
    }

    pub fn coverage(&self) -> impl Iterator<Item = &PageStamp> {
        self.coverage.iter().flatten()
    }

    pub(crate) fn records(&self) -> std::ops::Range<usize> {
        let start = self.start as usize;
        start..start + self.len()
    }

    /// Checks every covered page and adopts the current stamps when the trace is still valid.
    pub(crate) fn revalidate(&mut self, stamps: &WriteStampTable) -> bool {
        let mut current = [0u32; MAX_TRACE_PAGES];
        for (slot, cov) in current.iter_mut().zip(self.coverage.iter()) {
            if let Some(cov) = cov {
                match stamps.check(cov) {
                    Some(stamp) => *slot = stamp,
                    None => return false,
                }
            }
        }
        for (cov, stamp) in self.coverage.iter_mut().zip(current) {
            if let Some(cov) = cov {
                cov.stamp = stamp;
            }
        }
        true
    }
}
