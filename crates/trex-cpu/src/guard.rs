//! Debugger hooks consulted by the dispatch loop.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Execute,
    Read,
    Write,
}

/// Breakpoint and watchpoint oracle.
///
/// `should_stop_before` runs at every instruction boundary, so implementations keep it cheap.
pub trait Guard {
    /// Returns `true` to stop with [`crate::ExitReason::BreakpointHit`] before executing `rip`.
    fn should_stop_before(&mut self, rip: u64) -> bool {
        let _ = rip;
        false
    }

    /// Returns `true` if a watchpoint covers any byte of `[addr, addr + len)` for `kind`.
    ///
    /// Execute ranges are offered once per fetch window, write ranges once per store.
    fn watchpoint_hit(&mut self, addr: u64, len: usize, kind: WatchKind) -> bool {
        let _ = (addr, len, kind);
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoGuard;

impl Guard for NoGuard {}
