//! Asynchronous event line and the collaborator that delivers events and faults to the guest.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::bus::CpuBus;
use crate::error::Fault;
use crate::state::CpuState;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PendingEvents: u32 {
        /// External maskable interrupt.
        const INTERRUPT = 1 << 0;
        const NMI = 1 << 1;
        /// A debugger asked the processor to stop at the next instruction boundary.
        const DEBUG_STOP = 1 << 2;
        /// Leave the current trace without delivering anything, e.g. after a cache flush.
        const STOP_TRACE = 1 << 31;
    }
}

/// Pending-event word of one processor.
///
/// Other processors, timers and devices raise events from any thread; the owning processor polls
/// the word at instruction boundaries.
#[derive(Debug, Default)]
pub struct EventLine(AtomicU32);

impl EventLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, events: PendingEvents) {
        self.0.fetch_or(events.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, events: PendingEvents) {
        self.0.fetch_and(!events.bits(), Ordering::AcqRel);
    }

    /// Clears `events` and returns those that were pending.
    pub fn take(&self, events: PendingEvents) -> PendingEvents {
        let prev = self.0.fetch_and(!events.bits(), Ordering::AcqRel);
        PendingEvents::from_bits_truncate(prev) & events
    }

    pub fn pending(&self) -> PendingEvents {
        PendingEvents::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn any(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

/// What the dispatch loop does after offering pending events to the delivery collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep executing. Events still pending are offered again at the next boundary.
    Resume,
    /// Return to the caller with [`crate::ExitReason::AsyncEvent`].
    Exit,
}

/// What the dispatch loop does after a fault unwound a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Restart the faulting instruction (the fault was resolved outside the guest).
    Retry,
    /// The collaborator redirected the processor (e.g. into an exception handler).
    Delivered,
    /// The fault cannot be handled; stop with [`crate::ExitReason::FatalError`].
    Escalate,
}

/// Interrupt and exception delivery. Descriptor-table walks and stack frames live behind this seam.
pub trait EventDelivery<B: CpuBus> {
    fn deliver_events(&mut self, cpu: &mut CpuState, bus: &mut B, events: &EventLine) -> Delivery;

    /// Called with `rip` already advanced past the faulting instruction, which starts at
    /// `instruction_rip`. Traps such as INT3 return to `rip`; faults restart `instruction_rip`.
    fn deliver_fault(
        &mut self,
        cpu: &mut CpuState,
        bus: &mut B,
        fault: &Fault,
        instruction_rip: u64,
    ) -> FaultAction;
}

/// Delivery that hands every event and fault back to the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitOnEvent;

impl<B: CpuBus> EventDelivery<B> for ExitOnEvent {
    fn deliver_events(&mut self, cpu: &mut CpuState, _bus: &mut B, events: &EventLine) -> Delivery {
        if !events.take(PendingEvents::INTERRUPT | PendingEvents::NMI).is_empty() {
            cpu.halted = false;
        }
        Delivery::Exit
    }

    fn deliver_fault(
        &mut self,
        _cpu: &mut CpuState,
        _bus: &mut B,
        _fault: &Fault,
        _instruction_rip: u64,
    ) -> FaultAction {
        FaultAction::Escalate
    }
}
