use std::sync::Arc;

use tracing::{debug, trace};
use trex_cpu::{
    ConfigError, CpuBus, CpuState, EventDelivery, ExitReason, Guard, NoGuard, PendingEvents,
    Processor,
};
use trex_mem::WriteStampTable;

use crate::config::SchedulerConfig;
use crate::error::MachineError;
use crate::timer::TimerQueue;

/// How one processor's quantum ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorExit {
    pub cpu: usize,
    pub exit: ExitReason,
    /// Instructions retired during the quantum.
    pub executed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub exits: Vec<ProcessorExit>,
    /// Ticks the shared counter moved this round.
    pub ticks_advanced: u64,
}

impl RoundReport {
    pub fn all_halted(&self) -> bool {
        self.exits.iter().all(|e| e.exit == ExitReason::Halted)
    }
}

/// A set of processors sharing one bus, one write-stamp table and one tick counter.
pub struct Machine<B, D> {
    config: SchedulerConfig,
    bus: B,
    delivery: D,
    guard: Box<dyn Guard>,
    cpus: Vec<Processor>,
    timers: TimerQueue,
    ticks: u64,
    rounds: u64,
}

impl<B, D> Machine<B, D>
where
    B: CpuBus,
    D: EventDelivery<B>,
{
    /// Creates one processor per entry of `states`, all sharing the bus's write-stamp table.
    pub fn new(
        config: SchedulerConfig,
        bus: B,
        delivery: D,
        states: Vec<CpuState>,
    ) -> Result<Self, MachineError> {
        config.validate()?;
        if states.is_empty() {
            return Err(ConfigError::NoProcessors.into());
        }
        let cpu_config = config.processor_config(states.len());
        let stamps = bus.write_stamps().clone();
        let cpus = states
            .into_iter()
            .enumerate()
            .map(|(id, state)| Processor::new(id, cpu_config.clone(), state, stamps.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            processors = cpus.len(),
            linking = cpu_config.link_traces,
            max_trace_len = cpu_config.max_trace_len,
            "machine created"
        );

        Ok(Self {
            config,
            bus,
            delivery,
            guard: Box::new(NoGuard),
            cpus,
            timers: TimerQueue::new(),
            ticks: 0,
            rounds: 0,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn delivery_mut(&mut self) -> &mut D {
        &mut self.delivery
    }

    pub fn set_guard(&mut self, guard: Box<dyn Guard>) {
        self.guard = guard;
    }

    pub fn processors(&self) -> &[Processor] {
        &self.cpus
    }

    pub fn processor(&self, cpu: usize) -> Option<&Processor> {
        self.cpus.get(cpu)
    }

    pub fn processor_mut(&mut self, cpu: usize) -> Option<&mut Processor> {
        self.cpus.get_mut(cpu)
    }

    pub fn write_stamps(&self) -> &Arc<WriteStampTable> {
        self.bus.write_stamps()
    }

    /// Shared time counter, in retired-instruction ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Raises `events` on processor `cpu` once the tick counter reaches `tick`.
    pub fn schedule_event(
        &mut self,
        tick: u64,
        cpu: usize,
        events: PendingEvents,
    ) -> Result<(), MachineError> {
        if cpu >= self.cpus.len() {
            return Err(MachineError::NoSuchProcessor {
                cpu,
                processors: self.cpus.len(),
            });
        }
        self.timers.schedule(tick, cpu, events);
        Ok(())
    }

    /// Instruction budget each processor gets this round.
    fn quantum(&self) -> u64 {
        if self.cpus.len() > 1 {
            return self.config.smp_quantum;
        }
        match self.timers.next_tick() {
            Some(deadline) => self
                .config
                .uniprocessor_quantum
                .min(deadline.saturating_sub(self.ticks).max(1)),
            None => self.config.uniprocessor_quantum,
        }
    }

    /// Runs every processor for one quantum, in id order.
    pub fn run_round(&mut self) -> RoundReport {
        let quantum = self.quantum();
        let mut exits = Vec::with_capacity(self.cpus.len());
        for cpu in &mut self.cpus {
            let before = cpu.icount();
            let exit = cpu.run(&mut self.bus, &mut self.delivery, self.guard.as_mut(), quantum);
            let executed = cpu.icount() - before;
            trace!(cpu = cpu.id(), executed, ?exit, "quantum finished");
            exits.push(ProcessorExit {
                cpu: cpu.id(),
                exit,
                executed,
            });
        }

        // Never stand still, or an all-halted machine would never reach its next timer.
        let ticks_advanced = exits.iter().map(|e| e.executed).max().unwrap_or(0).max(1);
        self.ticks = self.ticks.saturating_add(ticks_advanced);
        self.rounds += 1;
        self.fire_timers();

        RoundReport {
            exits,
            ticks_advanced,
        }
    }

    /// Runs rounds until every processor halts or `max_rounds` rounds ran. Returns the rounds run.
    pub fn run_until_halted(&mut self, max_rounds: u64) -> u64 {
        for round in 1..=max_rounds {
            if self.run_round().all_halted() && self.timers.is_empty() {
                return round;
            }
        }
        max_rounds
    }

    fn fire_timers(&mut self) {
        while let Some(deadline) = self.timers.pop_due(self.ticks) {
            debug!(
                tick = self.ticks,
                cpu = deadline.cpu,
                events = ?deadline.events(),
                "timer fired"
            );
            if let Some(cpu) = self.cpus.get(deadline.cpu) {
                cpu.events().raise(deadline.events());
            }
        }
    }

    /// Reports a store that reached RAM without going through a processor's bus accessors, such
    /// as device DMA.
    pub fn notify_write(&self, paddr: u64, len: usize) {
        self.bus.write_stamps().on_store(paddr, len);
    }

    /// Stores `bytes` at `paddr` through the bus, as a processor store would.
    pub fn load(&mut self, paddr: u64, bytes: &[u8]) -> Result<(), MachineError> {
        self.bus.write_phys(paddr, bytes)?;
        Ok(())
    }

    /// Drops every processor's trace cache and resets the write-stamp table.
    pub fn flush_all(&mut self) {
        for cpu in &mut self.cpus {
            cpu.flush_cache();
            cpu.events().raise(PendingEvents::STOP_TRACE);
        }
        self.bus.write_stamps().on_flush();
        debug!(processors = self.cpus.len(), "flushed every trace cache");
    }
}
