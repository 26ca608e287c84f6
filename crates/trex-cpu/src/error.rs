use trex_mem::GuestMemoryError;

use crate::bus::PageFault;

/// Architectural exceptions raised by instruction semantics or instruction fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Exception {
    #[error("#DE")]
    DivideError,
    #[error("#DB")]
    Debug,
    #[error("#BP")]
    Breakpoint,
    #[error("#UD")]
    InvalidOpcode,
    #[error("#GP({0:#x})")]
    GeneralProtection(u16),
    #[error("#PF at {addr:#x} (error code {error_code:#x})")]
    PageFault { addr: u64, error_code: u32 },
}

impl Exception {
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::InvalidOpcode => 6,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
        }
    }

    pub fn error_code(self) -> Option<u32> {
        match self {
            Exception::GeneralProtection(code) => Some(u32::from(code)),
            Exception::PageFault { error_code, .. } => Some(error_code),
            _ => None,
        }
    }
}

impl From<PageFault> for Exception {
    fn from(pf: PageFault) -> Self {
        Exception::PageFault {
            addr: pf.addr,
            error_code: pf.error_code,
        }
    }
}

/// Why the address translator could not produce a fetch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FetchFault {
    #[error("non-canonical instruction pointer {rip:#x}")]
    NonCanonical { rip: u64 },
    #[error("instruction pointer {eip:#x} beyond code segment limit {limit:#x}")]
    SegmentLimit { eip: u64, limit: u32 },
    #[error(transparent)]
    Page(#[from] PageFault),
    #[error("instruction fetch from unbacked physical address {paddr:#x}")]
    Unbacked { paddr: u64 },
}

/// Decode paths that ran out of bytes or buffer space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResourceExhaustion {
    /// The decoder wanted more bytes although a full maximum-length instruction was available.
    #[error("instruction still incomplete with {remaining} bytes available")]
    TooManyPrefixes { remaining: usize },
    /// The stitched buffer across a page boundary did not decode.
    #[error("instruction spanning a page boundary did not decode from {available} bytes")]
    BoundaryDecodeFailed { available: usize },
}

/// Everything that can unwind out of the middle of a trace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("instruction fetch fault: {0}")]
    Fetch(#[from] FetchFault),
    #[error("undecodable instruction at rip {rip:#x}")]
    Decode { rip: u64 },
    #[error("guest exception {0}")]
    Semantic(#[from] Exception),
    #[error("resource exhaustion: {0}")]
    Exhausted(#[from] ResourceExhaustion),
    #[error("bus error: {0}")]
    Bus(#[from] GuestMemoryError),
}

impl Fault {
    /// Returns the exception the guest observes for this fault, or `None` if the fault cannot be
    /// expressed architecturally and must stop the processor.
    pub fn guest_exception(&self) -> Option<Exception> {
        match self {
            Fault::Fetch(FetchFault::NonCanonical { .. })
            | Fault::Fetch(FetchFault::SegmentLimit { .. }) => {
                Some(Exception::GeneralProtection(0))
            }
            Fault::Fetch(FetchFault::Page(pf)) => Some(Exception::from(*pf)),
            Fault::Fetch(FetchFault::Unbacked { .. }) => None,
            Fault::Decode { .. } => Some(Exception::InvalidOpcode),
            Fault::Semantic(exception) => Some(*exception),
            Fault::Exhausted(_) => Some(Exception::GeneralProtection(0)),
            Fault::Bus(_) => None,
        }
    }
}

/// Invalid processor or scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("trace_slots must be a non-zero power of two (got {0})")]
    TraceSlots(usize),
    #[error("max_trace_len must be between 1 and {max} (got {got})")]
    MaxTraceLen { got: usize, max: usize },
    #[error("record_pool ({pool}) must hold at least one maximum-length trace ({needed})")]
    RecordPool { pool: usize, needed: usize },
    #[error("rep_event_interval must be non-zero")]
    RepEventInterval,
    #[error("{0} must be non-zero")]
    ZeroQuantum(&'static str),
    #[error("a machine needs at least one processor")]
    NoProcessors,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_map_to_guest_exceptions() {
        assert_eq!(
            Fault::from(ResourceExhaustion::TooManyPrefixes { remaining: 15 }).guest_exception(),
            Some(Exception::GeneralProtection(0))
        );
        assert_eq!(
            Fault::Decode { rip: 0x10 }.guest_exception(),
            Some(Exception::InvalidOpcode)
        );
        let pf = PageFault {
            addr: 0x4000,
            error_code: 0x10,
        };
        assert_eq!(
            Fault::from(FetchFault::from(pf)).guest_exception(),
            Some(Exception::PageFault {
                addr: 0x4000,
                error_code: 0x10
            })
        );
        assert_eq!(
            Fault::from(FetchFault::Unbacked { paddr: 0 }).guest_exception(),
            None
        );
    }

    #[test]
    fn vectors_match_architecture() {
        assert_eq!(Exception::GeneralProtection(0).vector(), 13);
        assert_eq!(Exception::Breakpoint.vector(), 3);
        assert_eq!(Exception::InvalidOpcode.error_code(), None);
    }
}
