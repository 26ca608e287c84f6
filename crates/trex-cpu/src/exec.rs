//! Execution context handed to instruction handlers.

use trex_mem::{PAGE_OFFSET_MASK, PAGE_SIZE};

use crate::bus::{AccessKind, CpuBus};
use crate::error::{Exception, Fault};
use crate::events::EventLine;
use crate::guard::{Guard, WatchKind};
use crate::state::CpuState;

/// How control continues after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    /// A control transfer ran; `taken` is false for a conditional branch that fell through.
    Branch { taken: bool },
    Halt,
    /// A repeated instruction yielded before finishing. `rip` points back at it.
    RepYield,
}

/// Everything a handler may touch while it runs.
///
/// `rip` has already been advanced past the instruction; [`ExecCtx::instruction_rip`] holds the
/// address of the instruction itself.
pub struct ExecCtx<'a, B: CpuBus + ?Sized> {
    pub state: &'a mut CpuState,
    pub bus: &'a mut B,
    guard: &'a mut dyn Guard,
    events: &'a EventLine,
    instruction_rip: u64,
    icount: &'a mut u64,
    icount_limit: u64,
    rep_event_interval: u32,
    write_watch_hit: bool,
}

impl<'a, B: CpuBus + ?Sized> ExecCtx<'a, B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        state: &'a mut CpuState,
        bus: &'a mut B,
        guard: &'a mut dyn Guard,
        events: &'a EventLine,
        instruction_rip: u64,
        icount: &'a mut u64,
        icount_limit: u64,
        rep_event_interval: u32,
    ) -> Self {
        Self {
            state,
            bus,
            guard,
            events,
            instruction_rip,
            icount,
            icount_limit,
            rep_event_interval,
            write_watch_hit: false,
        }
    }

    pub fn instruction_rip(&self) -> u64 {
        self.instruction_rip
    }

    pub fn rep_event_interval(&self) -> u32 {
        self.rep_event_interval
    }

    pub(crate) fn write_watch_hit(&self) -> bool {
        self.write_watch_hit
    }

    /// Counts one completed iteration of a repeated instruction.
    pub fn retire_iteration(&mut self) {
        *self.icount += 1;
    }

    /// Whether a long-running instruction should give control back to the dispatch loop.
    pub fn should_yield(&self) -> bool {
        self.events.any() || *self.icount >= self.icount_limit
    }

    /// Linear address of `offset` in a segment with base `base`, truncated outside long mode.
    pub fn linear(&self, base: u64, offset: u64) -> u64 {
        let linear = base.wrapping_add(offset);
        if self.state.bitness() == 64 {
            linear
        } else {
            linear & 0xFFFF_FFFF
        }
    }

    pub fn read(&mut self, linear: u64, dst: &mut [u8]) -> Result<(), Fault> {
        let mut done = 0;
        while done < dst.len() {
            let addr = linear.wrapping_add(done as u64);
            let n = piece_len(addr, dst.len() - done);
            let paddr = self.translate(addr, AccessKind::Read)?;
            self.bus.read_phys(paddr, &mut dst[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    pub fn write(&mut self, linear: u64, src: &[u8]) -> Result<(), Fault> {
        if self.guard.watchpoint_hit(linear, src.len(), WatchKind::Write) {
            self.write_watch_hit = true;
        }
        if piece_len(linear, src.len()) == src.len() {
            let paddr = self.translate(linear, AccessKind::Write)?;
            self.bus.write_phys(paddr, src)?;
            return Ok(());
        }

        // A store that faults on a later page must not have changed the earlier ones.
        let mut done = 0;
        while done < src.len() {
            let addr = linear.wrapping_add(done as u64);
            self.translate(addr, AccessKind::Write)?;
            done += piece_len(addr, src.len() - done);
        }
        let mut done = 0;
        while done < src.len() {
            let addr = linear.wrapping_add(done as u64);
            let n = piece_len(addr, src.len() - done);
            let paddr = self.translate(addr, AccessKind::Write)?;
            self.bus.write_phys(paddr, &src[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    pub fn read_uint(&mut self, linear: u64, width: usize) -> Result<u64, Fault> {
        let mut buf = [0u8; 8];
        self.read(linear, &mut buf[..width])?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_uint(&mut self, linear: u64, width: usize, value: u64) -> Result<(), Fault> {
        self.write(linear, &value.to_le_bytes()[..width])
    }

    fn translate(&mut self, linear: u64, access: AccessKind) -> Result<u64, Fault> {
        self.bus
            .translate(linear, access, self.state.cpl)
            .map_err(|pf| Fault::Semantic(Exception::from(pf)))
    }
}

fn piece_len(addr: u64, left: usize) -> usize {
    let to_page_end = PAGE_SIZE - (addr & PAGE_OFFSET_MASK);
    (left as u64).min(to_page_end) as usize
}
