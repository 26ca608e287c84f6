//! Architectural register state visible to the execution core.

use bitflags::bitflags;

use crate::fetch::FetchMode;

/// General-purpose register indices.
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
    pub const R8: usize = 8;
    pub const R15: usize = 15;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RFlags: u64 {
        const CF = 1 << 0;
        const RESERVED1 = 1 << 1;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const RF = 1 << 16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    /// Protected mode; the code size follows `cs.big`.
    Protected,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// D/B bit: 32-bit default operand and address size.
    pub big: bool,
}

impl Segment {
    pub const fn real(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u64) << 4,
            limit: 0xFFFF,
            big: false,
        }
    }

    pub const fn flat32(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            big: true,
        }
    }
}

/// 8-bit register operand. Without a REX prefix, encodings 4..=7 name AH, CH, DH and BH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub index: u8,
    pub high_byte: bool,
}

impl Reg {
    pub const fn new(index: u8) -> Self {
        Self {
            index,
            high_byte: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    pub gpr: [u64; 16],
    pub rip: u64,
    pub rflags: RFlags,
    pub mode: CpuMode,
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub cpl: u8,
    pub halted: bool,
}

impl CpuState {
    pub fn new(mode: CpuMode) -> Self {
        let (cs, data) = match mode {
            CpuMode::Real => (Segment::real(0), Segment::real(0)),
            CpuMode::Protected => (Segment::flat32(0x08), Segment::flat32(0x10)),
            CpuMode::Long => (
                Segment {
                    big: false,
                    ..Segment::flat32(0x08)
                },
                Segment::flat32(0x10),
            ),
        };
        Self {
            gpr: [0; 16],
            rip: 0,
            rflags: RFlags::RESERVED1,
            mode,
            cs,
            ds: data,
            es: data,
            cpl: 0,
            halted: false,
        }
    }

    /// Code size in bits: 16, 32 or 64.
    pub fn bitness(&self) -> u32 {
        match self.mode {
            CpuMode::Real => 16,
            CpuMode::Protected if self.cs.big => 32,
            CpuMode::Protected => 16,
            CpuMode::Long => 64,
        }
    }

    pub fn fetch_mode(&self) -> FetchMode {
        FetchMode::new(self.bitness(), self.cpl)
    }

    pub fn ip_mask(&self) -> u64 {
        match self.bitness() {
            16 => 0xFFFF,
            32 => 0xFFFF_FFFF,
            _ => u64::MAX,
        }
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip & self.ip_mask();
    }

    pub fn zf(&self) -> bool {
        self.rflags.contains(RFlags::ZF)
    }

    pub fn df(&self) -> bool {
        self.rflags.contains(RFlags::DF)
    }

    /// Reads `bits` (8, 16, 32 or 64) of a general-purpose register.
    pub fn read_reg(&self, reg: Reg, bits: u32) -> u64 {
        let full = self.gpr[usize::from(reg.index & 0xF)];
        match bits {
            8 if reg.high_byte => (full >> 8) & 0xFF,
            8 => full & 0xFF,
            16 => full & 0xFFFF,
            32 => full & 0xFFFF_FFFF,
            _ => full,
        }
    }

    /// Writes `bits` of a general-purpose register with x86 merge rules: 8- and 16-bit writes keep
    /// the untouched bytes, 32-bit writes zero-extend in long mode.
    pub fn write_reg(&mut self, reg: Reg, bits: u32, value: u64) {
        let long = self.mode == CpuMode::Long;
        let slot = &mut self.gpr[usize::from(reg.index & 0xF)];
        *slot = match bits {
            8 if reg.high_byte => (*slot & !0xFF00) | ((value & 0xFF) << 8),
            8 => (*slot & !0xFF) | (value & 0xFF),
            16 => (*slot & !0xFFFF) | (value & 0xFFFF),
            32 if long => value & 0xFFFF_FFFF,
            32 => (*slot & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
            _ => value,
        };
    }

    /// Sets ZF and SF from a `bits`-wide result.
    pub fn set_result_flags(&mut self, result: u64, bits: u32) {
        let mask = width_mask(bits);
        self.rflags.set(RFlags::ZF, result & mask == 0);
        self.rflags.set(RFlags::SF, (result >> (bits - 1)) & 1 != 0);
    }
}

pub(crate) fn width_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_register_writes_merge() {
        let mut state = CpuState::new(CpuMode::Protected);
        state.gpr[gpr::RAX] = 0x1122_3344_5566_7788;
        state.write_reg(Reg::new(0), 8, 0xAB);
        assert_eq!(state.gpr[gpr::RAX], 0x1122_3344_5566_77AB);
        state.write_reg(
            Reg {
                index: 4,
                high_byte: true,
            },
            8,
            0xCD,
        );
        assert_eq!(state.gpr[gpr::RSP], 0xCD00);
        state.write_reg(Reg::new(0), 32, 0xDEAD_BEEF);
        assert_eq!(state.gpr[gpr::RAX], 0x1122_3344_DEAD_BEEF);
    }

    #[test]
    fn long_mode_32bit_write_zero_extends() {
        let mut state = CpuState::new(CpuMode::Long);
        state.gpr[gpr::RCX] = u64::MAX;
        state.write_reg(Reg::new(1), 32, 5);
        assert_eq!(state.gpr[gpr::RCX], 5);
    }

    #[test]
    fn rip_wraps_to_code_size() {
        let mut state = CpuState::new(CpuMode::Real);
        state.set_rip(0x1_0002);
        assert_eq!(state.rip, 2);
        assert_eq!(state.bitness(), 16);
        assert_eq!(CpuState::new(CpuMode::Long).bitness(), 64);
    }
}
