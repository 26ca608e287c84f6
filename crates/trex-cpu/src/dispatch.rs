//! The per-processor dispatch loop.

use std::sync::Arc;

use tracing::{debug, warn};
use trex_mem::WriteStampTable;

use crate::bus::CpuBus;
use crate::cache::{FetchSite, TraceCache};
use crate::config::CpuConfig;
use crate::decoder::Decoder;
use crate::error::{ConfigError, Fault};
use crate::events::{Delivery, EventDelivery, EventLine, FaultAction, PendingEvents};
use crate::exec::{ExecCtx, Flow};
use crate::fetch::{prefetch, FetchWindow};
use crate::guard::{Guard, WatchKind};
use crate::isa::{self, X86SubsetDecoder};
use crate::linker::TraceLinker;
use crate::state::CpuState;

/// Why [`Processor::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The guard asked to stop before an instruction, a watched store retired, or a debugger stop
    /// request was pending.
    BreakpointHit,
    /// The delivery collaborator handed a pending event back to the caller.
    AsyncEvent,
    QuantumExhausted,
    Halted,
    FatalError(Fault),
}

/// One virtual processor: architectural state plus its private trace cache.
pub struct Processor {
    id: usize,
    pub state: CpuState,
    config: CpuConfig,
    events: Arc<EventLine>,
    window: FetchWindow,
    cache: TraceCache,
    linker: TraceLinker,
    decoder: Box<dyn Decoder + Send>,
    icount: u64,
    resume_flag: bool,
}

impl Processor {
    /// Creates a processor that decodes with [`X86SubsetDecoder`].
    pub fn new(
        id: usize,
        config: CpuConfig,
        state: CpuState,
        stamps: Arc<WriteStampTable>,
    ) -> Result<Self, ConfigError> {
        Self::with_decoder(id, config, state, stamps, Box::new(X86SubsetDecoder))
    }

    pub fn with_decoder(
        id: usize,
        config: CpuConfig,
        state: CpuState,
        stamps: Arc<WriteStampTable>,
        decoder: Box<dyn Decoder + Send>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            id,
            state,
            cache: TraceCache::new(&config, stamps),
            linker: TraceLinker::new(&config),
            config,
            events: Arc::new(EventLine::new()),
            window: FetchWindow::invalid(),
            decoder,
            icount: 0,
            resume_flag: false,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Handle for raising events on this processor from elsewhere.
    pub fn events(&self) -> &Arc<EventLine> {
        &self.events
    }

    /// Instructions retired since creation. Repeated string iterations count individually.
    pub fn icount(&self) -> u64 {
        self.icount
    }

    pub fn cache(&self) -> &TraceCache {
        &self.cache
    }

    pub fn linker(&self) -> &TraceLinker {
        &self.linker
    }

    pub fn set_linking(&mut self, enabled: bool) {
        self.linker.set_enabled(enabled);
    }

    /// Drops every cached trace and the cached fetch window.
    pub fn flush_cache(&mut self) {
        self.cache.flush();
        self.window.invalidate();
    }

    /// Skips the breakpoint check at the next instruction boundary, like `RFLAGS.RF`.
    pub fn resume_past_breakpoint(&mut self) {
        self.resume_flag = true;
    }

    /// Runs until `budget` more instructions retired or something needs the caller's attention.
    pub fn run<B, D>(
        &mut self,
        bus: &mut B,
        delivery: &mut D,
        guard: &mut dyn Guard,
        budget: u64,
    ) -> ExitReason
    where
        B: CpuBus,
        D: EventDelivery<B> + ?Sized,
    {
        let limit = self.icount.saturating_add(budget);
        loop {
            self.linker.reset();

            let pending = self.events.pending();
            if !pending.is_empty() {
                self.events.clear(PendingEvents::STOP_TRACE);
                if !self.events.take(PendingEvents::DEBUG_STOP).is_empty() {
                    return ExitReason::BreakpointHit;
                }
                if pending.intersects(PendingEvents::INTERRUPT | PendingEvents::NMI)
                    && delivery.deliver_events(&mut self.state, bus, &self.events) == Delivery::Exit
                {
                    return ExitReason::AsyncEvent;
                }
            }
            if self.state.halted {
                return ExitReason::Halted;
            }
            if self.icount >= limit {
                return ExitReason::QuantumExhausted;
            }

            let rip = self.state.rip;
            let slot = match self.fetch_trace(bus, guard) {
                Ok(slot) => slot,
                Err(fault) => match self.unwind(fault, rip, bus, delivery) {
                    Some(exit) => return exit,
                    None => continue,
                },
            };
            if let Some(exit) = self.run_traces(slot, bus, delivery, guard, limit) {
                return exit;
            }
        }
    }

    fn window_offset<B: CpuBus>(&self, rip: u64, bus: &B) -> Option<u32> {
        if self.window.mapping_generation() != bus.mapping_generation() {
            return None;
        }
        self.window.offset_of(rip)
    }

    fn fetch_trace<B: CpuBus>(&mut self, bus: &mut B, guard: &mut dyn Guard) -> Result<usize, Fault> {
        let rip = self.state.rip;
        let offset = match self.window_offset(rip, bus) {
            Some(offset) => offset,
            None => {
                self.window = prefetch(&self.state, rip, bus, guard)?;
                self.window.entry_offset()
            }
        };
        let site = FetchSite {
            paddr: self.window.paddr(offset),
            mode: self.state.fetch_mode(),
            rip,
            remaining: self.window.remaining(offset),
        };

        let Self {
            cache,
            state,
            decoder,
            ..
        } = self;
        let state: &CpuState = state;
        cache.lookup_or_build(bus, decoder.as_ref(), site, |bus, next_rip| {
            Ok(prefetch(state, next_rip, bus, guard)?)
        })
    }

    /// Executes the trace in `slot` and whatever it chains into. Returns `None` to go back to the
    /// top of the dispatch loop.
    fn run_traces<B, D>(
        &mut self,
        mut slot: usize,
        bus: &mut B,
        delivery: &mut D,
        guard: &mut dyn Guard,
        limit: u64,
    ) -> Option<ExitReason>
    where
        B: CpuBus,
        D: EventDelivery<B> + ?Sized,
    {
        loop {
            let records = self.cache.trace(slot)?.records();
            let generation = self.cache.stamps().generation();
            let mut taken_branch = None;

            for idx in records {
                let rec = *self.cache.record(idx);
                let rip = self.state.rip;
                if self.stop_before(rip, usize::from(rec.len), guard) {
                    return Some(ExitReason::BreakpointHit);
                }
                self.state.set_rip(rip.wrapping_add(u64::from(rec.len)));

                let mut ctx = ExecCtx::new(
                    &mut self.state,
                    bus,
                    guard,
                    &self.events,
                    rip,
                    &mut self.icount,
                    limit,
                    self.config.rep_event_interval,
                );
                let result = isa::execute(&mut ctx, &rec);
                let write_watch_hit = ctx.write_watch_hit();
                let flow = match result {
                    Ok(flow) => flow,
                    Err(fault) => return self.unwind(fault, rip, bus, delivery),
                };

                if flow != Flow::RepYield {
                    self.icount += 1;
                }
                if write_watch_hit {
                    return Some(ExitReason::BreakpointHit);
                }
                match flow {
                    Flow::Halt | Flow::RepYield => return None,
                    Flow::Branch { taken } => taken_branch = taken.then_some(idx),
                    Flow::Next => {}
                }
                // A store into cached code may have rewritten the bytes of the records ahead.
                if self.events.any()
                    || self.icount >= limit
                    || self.cache.stamps().generation() != generation
                {
                    return None;
                }
            }

            let terminal = taken_branch?;
            let rip = self.state.rip;
            let offset = self.window_offset(rip, bus)?;
            let paddr = self.window.paddr(offset);
            let may_continue = !self.events.any() && self.icount < limit;
            slot = self.linker.chain(
                &mut self.cache,
                terminal,
                paddr,
                self.state.fetch_mode(),
                may_continue,
            )?;
        }
    }

    fn stop_before(&mut self, rip: u64, len: usize, guard: &mut dyn Guard) -> bool {
        if self.resume_flag {
            self.resume_flag = false;
            return false;
        }
        if guard.should_stop_before(rip) {
            return true;
        }
        if self.window.watched() {
            let linear = if self.state.bitness() == 64 {
                rip
            } else {
                self.state.cs.base.wrapping_add(rip) & 0xFFFF_FFFF
            };
            return guard.watchpoint_hit(linear, len, WatchKind::Execute);
        }
        false
    }

    /// Hands a fault to the delivery collaborator. Returns an exit reason if the processor must stop.
    fn unwind<B, D>(
        &mut self,
        fault: Fault,
        instruction_rip: u64,
        bus: &mut B,
        delivery: &mut D,
    ) -> Option<ExitReason>
    where
        B: CpuBus,
        D: EventDelivery<B> + ?Sized,
    {
        // Faults count toward the quantum so a fault loop cannot starve other processors.
        self.icount += 1;
        if matches!(fault, Fault::Fetch(_)) {
            self.window.invalidate();
        }
        debug!(cpu = self.id, rip = instruction_rip, %fault, "fault unwound trace");
        match delivery.deliver_fault(&mut self.state, bus, &fault, instruction_rip) {
            FaultAction::Retry => {
                self.state.rip = instruction_rip;
                None
            }
            FaultAction::Delivered => None,
            FaultAction::Escalate => {
                warn!(cpu = self.id, rip = instruction_rip, %fault, "unhandled fault");
                self.state.rip = instruction_rip;
                Some(ExitReason::FatalError(fault))
            }
        }
    }
}
