//! Trace-caching execution core of an x86 virtual processor.
//!
//! A [`Processor`] fetches through a cached [`fetch::FetchWindow`], looks up or decodes a
//! [`trace::Trace`] keyed on physical address and fetch mode, and runs its instruction records
//! back to back. Stores into cached code are caught lazily through the shared
//! [`trex_mem::WriteStampTable`]; taken branches chain directly into the next cached trace when
//! the processor runs alone.

pub mod bus;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod exec;
pub mod fetch;
pub mod guard;
pub mod isa;
pub mod linker;
pub mod rep;
pub mod state;
pub mod trace;

pub use bus::{AccessKind, CpuBus, FlatBus, PageFault, PageMapping};
pub use cache::{TraceCache, TraceCacheStats};
pub use config::CpuConfig;
pub use dispatch::{ExitReason, Processor};
pub use error::{ConfigError, Exception, Fault, FetchFault, ResourceExhaustion};
pub use events::{Delivery, EventDelivery, EventLine, ExitOnEvent, FaultAction, PendingEvents};
pub use guard::{Guard, NoGuard, WatchKind};
pub use state::{gpr, CpuMode, CpuState, RFlags};
