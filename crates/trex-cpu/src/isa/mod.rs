//! Reference decoder and semantics for a small subset of x86.
//!
//! The subset is enough to drive the trace cache end to end: straight-line register and memory
//! writes, conditional and unconditional branches, HLT/INT3/UD2, and the string instructions with
//! every repeat prefix. Anything else decodes as invalid.

mod decode;
mod exec;

pub use decode::X86SubsetDecoder;
pub use exec::execute;
