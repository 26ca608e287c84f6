//! Decoded instruction records and the decoder interface.

use crate::fetch::FetchMode;
use crate::linker::TraceLink;
use crate::state::Reg;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepMode {
    #[default]
    None,
    Rep,
    Repe,
    Repne,
}

impl RepMode {
    /// Whether the ZF predicate ends the repetition after an iteration.
    pub fn terminates_on(self, zf: bool) -> bool {
        match self {
            RepMode::None | RepMode::Rep => false,
            RepMode::Repe => !zf,
            RepMode::Repne => zf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSize {
    A16,
    A32,
    A64,
}

impl AddrSize {
    pub fn bits(self) -> u32 {
        match self {
            AddrSize::A16 => 16,
            AddrSize::A32 => 32,
            AddrSize::A64 => 64,
        }
    }

    pub fn mask(self) -> u64 {
        crate::state::width_mask(self.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringOp {
    Movs,
    Stos,
    Cmps,
    Scas,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Always,
    Zero,
    NotZero,
}

/// Operation and operands of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    Hlt,
    Int3,
    Ud2,
    Inc { reg: Reg },
    Dec { reg: Reg },
    MovImm { reg: Reg, imm: u64 },
    /// `mov byte [disp], imm8`; `disp` is relative to the next instruction when `rip_relative`.
    StoreImm8 { disp: u64, imm: u8, rip_relative: bool },
    /// `mov [moffs], al`
    StoreAl { moffs: u64 },
    CmpAlImm { imm: u8 },
    Jump { cond: Cond, rel: i64 },
    String { op: StringOp, width: u8 },
}

/// One decoded instruction.
///
/// Records are plain data: the dispatch loop copies them out of the record pool before running
/// them, so a handler never holds a borrow of the trace cache.
#[derive(Debug, Clone, Copy)]
pub struct InstructionRecord {
    pub op: Op,
    pub len: u8,
    /// Operand size in bits.
    pub op_bits: u8,
    pub addr_size: AddrSize,
    pub rep: RepMode,
    /// Control may leave the straight-line sequence after this record.
    pub ends_trace: bool,
    pub(crate) link: Option<TraceLink>,
}

impl InstructionRecord {
    pub fn new(op: Op, len: u8) -> Self {
        Self {
            op,
            len,
            op_bits: 32,
            addr_size: AddrSize::A32,
            rep: RepMode::None,
            ends_trace: false,
            link: None,
        }
    }
}

/// Two records are the same instruction if they decode identically; cached links are ignored.
impl PartialEq for InstructionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.len == other.len
            && self.op_bits == other.op_bits
            && self.addr_size == other.addr_size
            && self.rep == other.rep
            && self.ends_trace == other.ends_trace
    }
}

impl Eq for InstructionRecord {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Record(InstructionRecord),
    /// The instruction continues past the end of `bytes`.
    NeedsMoreBytes,
    Invalid,
}

/// Byte-level decoder.
///
/// `bytes` holds at most [`crate::fetch::MAX_INSTRUCTION_LEN`] bytes starting at the instruction.
/// A decoder returns `NeedsMoreBytes` only when the instruction is incomplete within `bytes`.
pub trait Decoder {
    fn decode(&self, bytes: &[u8], mode: FetchMode) -> DecodeOutcome;
}
