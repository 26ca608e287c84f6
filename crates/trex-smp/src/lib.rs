//! Round-robin scheduling of several trace-caching processors over one shared bus.
//!
//! [`Machine`] owns the bus, the processors and a tick counter. Each call to
//! [`Machine::run_round`] gives every processor one quantum, then advances the tick counter by the
//! largest number of instructions any processor retired (at least one, so timers keep firing
//! while every processor is halted) and raises the events of timers that came due.

pub mod config;
pub mod error;
pub mod machine;
pub mod timer;

pub use config::SchedulerConfig;
pub use error::MachineError;
pub use machine::{Machine, ProcessorExit, RoundReport};
pub use timer::{Deadline, TimerQueue};
