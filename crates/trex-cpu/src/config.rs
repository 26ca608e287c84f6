use crate::error::ConfigError;

/// Upper bound on records per trace. Record ranges are stored as `u16` lengths.
pub const MAX_TRACE_LEN_LIMIT: usize = u16::MAX as usize;

/// Tunables of one virtual processor's execution core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    /// Number of direct-mapped trace slots. Must be a power of two.
    pub trace_slots: usize,
    /// Capacity of the shared instruction-record pool. Reaching it flushes the whole cache.
    pub record_pool: usize,
    /// Maximum number of records in one trace, merged traces included.
    pub max_trace_len: usize,
    /// Chain taken direct branches to their successor trace without going back to the top of
    /// the dispatch loop.
    pub link_traces: bool,
    /// Maximum number of traces chained before control returns to the dispatch loop.
    pub max_link_depth: u32,
    /// Iterations of a repeated string instruction between checks for pending events and quantum
    /// exhaustion.
    pub rep_event_interval: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            trace_slots: 64 * 1024,
            record_pool: 576 * 1024,
            max_trace_len: 32,
            link_traces: true,
            max_link_depth: 1000,
            rep_event_interval: 31,
        }
    }
}

impl CpuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trace_slots == 0 || !self.trace_slots.is_power_of_two() {
            return Err(ConfigError::TraceSlots(self.trace_slots));
        }
        if self.max_trace_len == 0 || self.max_trace_len > MAX_TRACE_LEN_LIMIT {
            return Err(ConfigError::MaxTraceLen {
                got: self.max_trace_len,
                max: MAX_TRACE_LEN_LIMIT,
            });
        }
        // Merges may append up to a full trace to a partially built one.
        let needed = self.max_trace_len + 1;
        if self.record_pool < needed || u32::try_from(self.record_pool).is_err() {
            return Err(ConfigError::RecordPool {
                pool: self.record_pool,
                needed,
            });
        }
        if self.rep_event_interval == 0 {
            return Err(ConfigError::RepEventInterval);
        }
        Ok(())
    }
}
