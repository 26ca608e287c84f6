use crate::bus::CpuBus;
use crate::decoder::{Cond, InstructionRecord, Op, StringOp};
use crate::error::{Exception, Fault};
use crate::exec::{ExecCtx, Flow};
use crate::rep;
use crate::state::{gpr, width_mask, Reg, RFlags};

/// Runs the semantics of one reference-subset instruction.
pub fn execute<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    rec: &InstructionRecord,
) -> Result<Flow, Fault> {
    let bits = u32::from(rec.op_bits);
    match rec.op {
        Op::Nop => Ok(Flow::Next),
        Op::Hlt => {
            if ctx.state.cpl != 0 {
                return Err(Exception::GeneralProtection(0).into());
            }
            ctx.state.halted = true;
            Ok(Flow::Halt)
        }
        Op::Int3 => Err(Exception::Breakpoint.into()),
        Op::Ud2 => Err(Exception::InvalidOpcode.into()),
        Op::Inc { reg } => {
            let value = ctx.state.read_reg(reg, bits).wrapping_add(1);
            ctx.state.write_reg(reg, bits, value);
            ctx.state.set_result_flags(value, bits);
            Ok(Flow::Next)
        }
        Op::Dec { reg } => {
            let value = ctx.state.read_reg(reg, bits).wrapping_sub(1);
            ctx.state.write_reg(reg, bits, value);
            ctx.state.set_result_flags(value, bits);
            Ok(Flow::Next)
        }
        Op::MovImm { reg, imm } => {
            ctx.state.write_reg(reg, bits, imm);
            Ok(Flow::Next)
        }
        Op::StoreImm8 {
            disp,
            imm,
            rip_relative,
        } => {
            let offset = if rip_relative {
                ctx.state.rip.wrapping_add(disp)
            } else {
                disp & rec.addr_size.mask()
            };
            let linear = ctx.linear(ctx.state.ds.base, offset);
            ctx.write(linear, &[imm])?;
            Ok(Flow::Next)
        }
        Op::StoreAl { moffs } => {
            let al = ctx.state.read_reg(Reg::new(0), 8) as u8;
            let linear = ctx.linear(ctx.state.ds.base, moffs);
            ctx.write(linear, &[al])?;
            Ok(Flow::Next)
        }
        Op::CmpAlImm { imm } => {
            let al = ctx.state.read_reg(Reg::new(0), 8);
            compare(ctx, al, u64::from(imm), 8);
            Ok(Flow::Next)
        }
        Op::Jump { cond, rel } => {
            let taken = match cond {
                Cond::Always => true,
                Cond::Zero => ctx.state.zf(),
                Cond::NotZero => !ctx.state.zf(),
            };
            if taken {
                let mut target = ctx.state.rip.wrapping_add(rel as u64);
                if bits == 16 {
                    target &= 0xFFFF;
                }
                ctx.state.set_rip(target);
            }
            Ok(Flow::Branch { taken })
        }
        Op::String { op, width } => rep::repeat(ctx, rec, |ctx| {
            string_iteration(ctx, rec, op, usize::from(width))
        }),
    }
}

fn compare<B: CpuBus + ?Sized>(ctx: &mut ExecCtx<'_, B>, lhs: u64, rhs: u64, bits: u32) {
    let mask = width_mask(bits);
    let result = lhs.wrapping_sub(rhs) & mask;
    ctx.state.set_result_flags(result, bits);
    ctx.state.rflags.set(RFlags::CF, (lhs & mask) < (rhs & mask));
}

/// One element of a string instruction; pointer registers wrap at the address size.
fn string_iteration<B: CpuBus + ?Sized>(
    ctx: &mut ExecCtx<'_, B>,
    rec: &InstructionRecord,
    op: StringOp,
    width: usize,
) -> Result<(), Fault> {
    let addr_mask = rec.addr_size.mask();
    let addr_bits = rec.addr_size.bits();
    let step = if ctx.state.df() {
        (width as u64).wrapping_neg()
    } else {
        width as u64
    };
    let si = ctx.state.gpr[gpr::RSI] & addr_mask;
    let di = ctx.state.gpr[gpr::RDI] & addr_mask;
    let src = ctx.linear(ctx.state.ds.base, si);
    let dst = ctx.linear(ctx.state.es.base, di);
    let elem_bits = (width * 8) as u32;

    let (advance_si, advance_di) = match op {
        StringOp::Movs => {
            let value = ctx.read_uint(src, width)?;
            ctx.write_uint(dst, width, value)?;
            (true, true)
        }
        StringOp::Stos => {
            let value = ctx.state.gpr[gpr::RAX];
            ctx.write_uint(dst, width, value)?;
            (false, true)
        }
        StringOp::Cmps => {
            let lhs = ctx.read_uint(src, width)?;
            let rhs = ctx.read_uint(dst, width)?;
            compare(ctx, lhs, rhs, elem_bits);
            (true, true)
        }
        StringOp::Scas => {
            let lhs = ctx.state.gpr[gpr::RAX] & width_mask(elem_bits);
            let rhs = ctx.read_uint(dst, width)?;
            compare(ctx, lhs, rhs, elem_bits);
            (false, true)
        }
    };

    if advance_si {
        let next = si.wrapping_add(step);
        ctx.state.write_reg(Reg::new(gpr::RSI as u8), addr_bits, next);
    }
    if advance_di {
        let next = di.wrapping_add(step);
        ctx.state.write_reg(Reg::new(gpr::RDI as u8), addr_bits, next);
    }
    Ok(())
}
