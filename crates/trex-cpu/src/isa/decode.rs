use crate::decoder::{
    AddrSize, Cond, DecodeOutcome, Decoder, InstructionRecord, Op, RepMode, StringOp,
};
use crate::fetch::{FetchMode, MAX_INSTRUCTION_LEN};
use crate::state::Reg;

#[derive(Debug, Default, Clone, Copy)]
struct Prefixes {
    operand_size: bool,
    address_size: bool,
    rep: Option<u8>,
    rex: Option<u8>,
}

impl Prefixes {
    fn rex_w(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x08 != 0)
    }

    fn rex_b(&self) -> u8 {
        self.rex.map_or(0, |r| r & 0x01)
    }
}

/// Cursor over the instruction bytes. Running off the end is reported as `NeedsMoreBytes`
/// unless a maximum-length instruction was available, which makes the encoding invalid.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn short(&self) -> DecodeOutcome {
        if self.bytes.len() >= MAX_INSTRUCTION_LEN {
            DecodeOutcome::Invalid
        } else {
            DecodeOutcome::NeedsMoreBytes
        }
    }

    fn u8(&mut self) -> Result<u8, DecodeOutcome> {
        if self.pos >= MAX_INSTRUCTION_LEN {
            return Err(DecodeOutcome::Invalid);
        }
        let b = *self.bytes.get(self.pos).ok_or_else(|| self.short())?;
        self.pos += 1;
        Ok(b)
    }

    fn le(&mut self, size: usize) -> Result<u64, DecodeOutcome> {
        let mut value = 0u64;
        for i in 0..size {
            value |= u64::from(self.u8()?) << (8 * i);
        }
        Ok(value)
    }

    fn signed(&mut self, size: usize) -> Result<i64, DecodeOutcome> {
        let raw = self.le(size)?;
        let shift = 64 - 8 * size as u32;
        Ok(((raw << shift) as i64) >> shift)
    }
}

/// Decoder for the subset of x86 the reference handlers implement.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86SubsetDecoder;

impl Decoder for X86SubsetDecoder {
    fn decode(&self, bytes: &[u8], mode: FetchMode) -> DecodeOutcome {
        let mut cursor = Cursor { bytes, pos: 0 };
        match decode_one(&mut cursor, mode) {
            Ok(mut rec) => {
                rec.len = cursor.pos as u8;
                DecodeOutcome::Record(rec)
            }
            Err(outcome) => outcome,
        }
    }
}

fn decode_one(c: &mut Cursor<'_>, mode: FetchMode) -> Result<InstructionRecord, DecodeOutcome> {
    let bits = mode.code_bits();
    let mut p = Prefixes::default();

    let mut opcode = loop {
        let b = c.u8()?;
        match b {
            0x66 => p.operand_size = true,
            0x67 => p.address_size = true,
            0xF2 | 0xF3 => p.rep = Some(b),
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 => {}
            _ => break b,
        }
    };
    if bits == 64 && (0x40..=0x4F).contains(&opcode) {
        p.rex = Some(opcode);
        opcode = c.u8()?;
    }

    let op_bits: u32 = match bits {
        64 if p.rex_w() => 64,
        16 => {
            if p.operand_size {
                32
            } else {
                16
            }
        }
        _ => {
            if p.operand_size {
                16
            } else {
                32
            }
        }
    };
    let addr_size = match (bits, p.address_size) {
        (16, false) | (32, true) => AddrSize::A16,
        (64, false) => AddrSize::A64,
        _ => AddrSize::A32,
    };
    let full_reg = |low: u8| Reg::new(low | (p.rex_b() << 3));
    let byte_reg = |low: u8| Reg {
        index: low | (p.rex_b() << 3),
        high_byte: p.rex.is_none() && (4..8).contains(&low),
    };

    let mut width = op_bits;
    let mut rep = RepMode::None;
    let mut ends_trace = false;

    let op = match opcode {
        0x90 => Op::Nop,
        0xF4 => {
            ends_trace = true;
            Op::Hlt
        }
        0xCC => {
            ends_trace = true;
            Op::Int3
        }
        0x0F => match c.u8()? {
            0x0B => {
                ends_trace = true;
                Op::Ud2
            }
            _ => return Err(DecodeOutcome::Invalid),
        },
        0x40..=0x4F if bits == 64 => return Err(DecodeOutcome::Invalid),
        0x40..=0x47 => Op::Inc {
            reg: Reg::new(opcode & 7),
        },
        0x48..=0x4F => Op::Dec {
            reg: Reg::new(opcode & 7),
        },
        0xFE | 0xFF => {
            let modrm = c.u8()?;
            if modrm >> 6 != 0b11 {
                return Err(DecodeOutcome::Invalid);
            }
            let rm = modrm & 7;
            let reg = if opcode == 0xFE {
                width = 8;
                byte_reg(rm)
            } else {
                full_reg(rm)
            };
            match (modrm >> 3) & 7 {
                0 => Op::Inc { reg },
                1 => Op::Dec { reg },
                _ => return Err(DecodeOutcome::Invalid),
            }
        }
        0xB0..=0xB7 => {
            width = 8;
            Op::MovImm {
                reg: byte_reg(opcode & 7),
                imm: c.le(1)?,
            }
        }
        0xB8..=0xBF => {
            let imm = c.le(op_bits as usize / 8)?;
            Op::MovImm {
                reg: full_reg(opcode & 7),
                imm,
            }
        }
        0xA2 => {
            width = 8;
            Op::StoreAl {
                moffs: c.le(addr_size.bits() as usize / 8)?,
            }
        }
        0xC6 => {
            width = 8;
            let modrm = c.u8()?;
            if (modrm >> 3) & 7 != 0 {
                return Err(DecodeOutcome::Invalid);
            }
            // Only the absolute (or RIP-relative) displacement form.
            let (disp, rip_relative) = match (addr_size, modrm & 0xC7) {
                (AddrSize::A16, 0x06) => (c.le(2)?, false),
                (AddrSize::A16, _) => return Err(DecodeOutcome::Invalid),
                (_, 0x05) => (c.signed(4)? as u64, bits == 64),
                _ => return Err(DecodeOutcome::Invalid),
            };
            Op::StoreImm8 {
                disp,
                imm: c.u8()?,
                rip_relative,
            }
        }
        0x3C => {
            width = 8;
            Op::CmpAlImm { imm: c.u8()? }
        }
        0x74 | 0x75 | 0xEB => {
            ends_trace = true;
            let cond = match opcode {
                0x74 => Cond::Zero,
                0x75 => Cond::NotZero,
                _ => Cond::Always,
            };
            Op::Jump {
                cond,
                rel: c.signed(1)?,
            }
        }
        0xE9 => {
            ends_trace = true;
            let size = if op_bits == 16 { 2 } else { 4 };
            Op::Jump {
                cond: Cond::Always,
                rel: c.signed(size)?,
            }
        }
        0xA4..=0xA7 | 0xAA | 0xAB | 0xAE | 0xAF => {
            let op = match opcode {
                0xA4 | 0xA5 => StringOp::Movs,
                0xA6 | 0xA7 => StringOp::Cmps,
                0xAA | 0xAB => StringOp::Stos,
                _ => StringOp::Scas,
            };
            if opcode & 1 == 0 {
                width = 8;
            }
            rep = match (p.rep, op) {
                (None, _) => RepMode::None,
                (Some(_), StringOp::Movs | StringOp::Stos) => RepMode::Rep,
                (Some(0xF3), _) => RepMode::Repe,
                (Some(_), _) => RepMode::Repne,
            };
            Op::String {
                op,
                width: (width / 8) as u8,
            }
        }
        _ => return Err(DecodeOutcome::Invalid),
    };

    Ok(InstructionRecord {
        op,
        len: 0,
        op_bits: width as u8,
        addr_size,
        rep,
        ends_trace,
        link: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], bits: u32) -> DecodeOutcome {
        X86SubsetDecoder.decode(bytes, FetchMode::new(bits, 0))
    }

    fn record(bytes: &[u8], bits: u32) -> InstructionRecord {
        match decode(bytes, bits) {
            DecodeOutcome::Record(rec) => rec,
            other => panic!("expected record for {bytes:02x?}, got {other:?}"),
        }
    }

    #[test]
    fn decodes_moves_with_operand_size() {
        let rec = record(&[0xB8, 0x78, 0x56, 0x34, 0x12], 32);
        assert_eq!(
            rec.op,
            Op::MovImm {
                reg: Reg::new(0),
                imm: 0x1234_5678
            }
        );
        assert_eq!(rec.len, 5);

        let rec = record(&[0x66, 0xB9, 0x34, 0x12], 32);
        assert_eq!(rec.op_bits, 16);
        assert_eq!(rec.len, 4);

        let rec = record(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8], 64);
        assert_eq!(rec.op_bits, 64);
        assert_eq!(rec.len, 10);
    }

    #[test]
    fn high_byte_registers_need_no_rex() {
        let rec = record(&[0xB4, 0x7F], 32);
        assert_eq!(
            rec.op,
            Op::MovImm {
                reg: Reg {
                    index: 4,
                    high_byte: true
                },
                imm: 0x7F
            }
        );
        let rec = record(&[0x40, 0xB4, 0x7F], 64);
        assert!(matches!(rec.op, Op::MovImm { reg, .. } if !reg.high_byte));
    }

    #[test]
    fn string_prefixes_pick_repeat_mode() {
        let rec = record(&[0xF3, 0xA4], 32);
        assert_eq!(rec.rep, RepMode::Rep);
        assert_eq!(
            rec.op,
            Op::String {
                op: StringOp::Movs,
                width: 1
            }
        );
        assert_eq!(record(&[0xF3, 0xA6], 32).rep, RepMode::Repe);
        assert_eq!(record(&[0xF2, 0xAE], 32).rep, RepMode::Repne);
        assert_eq!(record(&[0xF2, 0xAB], 32).rep, RepMode::Rep);
        assert_eq!(record(&[0x67, 0xF3, 0xA5], 32).addr_size, AddrSize::A16);
        assert_eq!(record(&[0xF3, 0x90], 32).rep, RepMode::None);
    }

    #[test]
    fn branches_end_traces() {
        let rec = record(&[0x75, 0xFC], 32);
        assert!(rec.ends_trace);
        assert_eq!(
            rec.op,
            Op::Jump {
                cond: Cond::NotZero,
                rel: -4
            }
        );
        let rec = record(&[0xE9, 0x00, 0x01], 16);
        assert_eq!(rec.len, 3);
        assert!(!record(&[0x40], 32).ends_trace);
    }

    #[test]
    fn truncated_input_needs_more_bytes() {
        assert_eq!(decode(&[0xB8, 0x01], 32), DecodeOutcome::NeedsMoreBytes);
        assert_eq!(decode(&[0x66], 32), DecodeOutcome::NeedsMoreBytes);
        assert_eq!(decode(&[], 32), DecodeOutcome::NeedsMoreBytes);
    }

    #[test]
    fn overlong_or_unknown_encodings_are_invalid() {
        assert_eq!(decode(&[0x66; 15], 32), DecodeOutcome::Invalid);
        assert_eq!(decode(&[0x0F, 0x05], 64), DecodeOutcome::Invalid);
        assert_eq!(decode(&[0xFF, 0x00], 32), DecodeOutcome::Invalid);
        assert_eq!(decode(&[0xD9, 0x00], 32), DecodeOutcome::Invalid);
    }

    #[test]
    fn rip_relative_store_in_long_mode() {
        let rec = record(&[0xC6, 0x05, 0xF0, 0xFF, 0xFF, 0xFF, 0x90], 64);
        assert_eq!(
            rec.op,
            Op::StoreImm8 {
                disp: (-16i64) as u64,
                imm: 0x90,
                rip_relative: true
            }
        );
        assert_eq!(rec.len, 7);
    }
}
