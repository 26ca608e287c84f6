//! Repeat-prefix loop shared by every string instruction.
//!
//! The count register is CX, ECX or RCX depending on the address size. The loop yields back to
//! the dispatch loop every `rep_event_interval` iterations if an event is pending or the quantum
//! ran out; in that case `rip` is rewound to the instruction so it restarts with the remaining
//! count, which is what hardware does when it takes an interrupt mid-`rep`.

use crate::bus::CpuBus;
use crate::decoder::{AddrSize, InstructionRecord, RepMode};
use crate::error::Fault;
use crate::exec::{ExecCtx, Flow};
use crate::state::{gpr, CpuState, Reg};

pub fn read_count(state: &CpuState, addr_size: AddrSize) -> u64 {
    state.gpr[gpr::RCX] & addr_size.mask()
}

/// Writes the count register. ECX writes clear the upper half of RCX.
pub fn write_count(state: &mut CpuState, addr_size: AddrSize, value: u64) {
    match addr_size {
        AddrSize::A16 => state.write_reg(Reg::new(gpr::RCX as u8), 16, value),
        AddrSize::A32 => state.gpr[gpr::RCX] = value & 0xFFFF_FFFF,
        AddrSize::A64 => state.gpr[gpr::RCX] = value,
    }
}

/// Runs `iteration` under the record's repeat prefix.
///
/// Without a prefix the iteration runs exactly once. With one, each pass runs the iteration if the
/// count is non-zero and decrements it, then completes when the count reaches zero or the ZF
/// predicate (REPE/REPNE) says stop. Every iteration after the first counts as one executed
/// instruction; the dispatch loop retires the last one.
pub fn repeat<B, F>(
    ctx: &mut ExecCtx<'_, B>,
    rec: &InstructionRecord,
    mut iteration: F,
) -> Result<Flow, Fault>
where
    B: CpuBus + ?Sized,
    F: FnMut(&mut ExecCtx<'_, B>) -> Result<(), Fault>,
{
    if rec.rep == RepMode::None {
        iteration(ctx)?;
        return Ok(Flow::Next);
    }

    let interval = ctx.rep_event_interval().max(1);
    let mut since_check = 0u32;
    loop {
        let count = read_count(ctx.state, rec.addr_size);
        if count != 0 {
            iteration(ctx)?;
            write_count(ctx.state, rec.addr_size, count - 1);
        }
        if read_count(ctx.state, rec.addr_size) == 0 || rec.rep.terminates_on(ctx.state.zf()) {
            return Ok(Flow::Next);
        }

        ctx.retire_iteration();
        since_check += 1;
        if since_check >= interval {
            since_check = 0;
            if ctx.should_yield() {
                break;
            }
        }
    }

    let rip = ctx.instruction_rip();
    ctx.state.rip = rip;
    Ok(Flow::RepYield)
}
