//! Chaining of taken branches into the next cached trace.
//!
//! The first time a branch at the end of a trace is taken, the successor's slot is looked up and
//! remembered on the branch's record. Later executions jump straight to that slot as long as
//! nothing happened that could make it wrong: the cache's link epoch moves whenever a slot is
//! emptied or replaced, and the write-stamp generation moves whenever cached code is written.

use tracing::trace;

use crate::cache::TraceCache;
use crate::config::CpuConfig;
use crate::fetch::FetchMode;

/// Successor cached on the terminal record of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceLink {
    pub(crate) slot: u32,
    pub(crate) paddr: u64,
    pub(crate) epoch: u64,
    pub(crate) generation: u64,
}

#[derive(Debug, Clone)]
pub struct TraceLinker {
    enabled: bool,
    max_depth: u32,
    depth: u32,
}

impl TraceLinker {
    pub fn new(config: &CpuConfig) -> Self {
        Self {
            enabled: config.link_traces,
            max_depth: config.max_link_depth,
            depth: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.depth = 0;
    }

    /// Traces chained since the dispatch loop last took control.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn reset(&mut self) {
        self.depth = 0;
    }

    /// Returns the slot to continue in after the taken branch at record `terminal` landed on
    /// `paddr`, or `None` to go back to the dispatch loop.
    ///
    /// `may_continue` is false when an event is pending or the quantum is spent.
    pub fn chain(
        &mut self,
        cache: &mut TraceCache,
        terminal: usize,
        paddr: u64,
        mode: FetchMode,
        may_continue: bool,
    ) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        if !may_continue || self.depth >= self.max_depth {
            self.depth = 0;
            return None;
        }

        let slot = match cache.cached_link(terminal, paddr, mode) {
            Some(slot) => slot,
            None => {
                let slot = cache.lookup(paddr, mode)?;
                cache.store_link(terminal, slot, paddr);
                trace!(terminal, slot, paddr, "linked trace");
                slot
            }
        };
        self.depth += 1;
        cache.stats.links_followed += 1;
        Some(slot)
    }
}
