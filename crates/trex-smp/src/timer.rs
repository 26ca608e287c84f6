//! Tick deadlines that raise events on a processor.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use trex_cpu::PendingEvents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    pub tick: u64,
    seq: u64,
    pub cpu: usize,
    events: u32,
}

impl Deadline {
    pub fn events(&self) -> PendingEvents {
        PendingEvents::from_bits_truncate(self.events)
    }
}

/// Deadlines ordered by tick, then by insertion order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn schedule(&mut self, tick: u64, cpu: usize, events: PendingEvents) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Deadline {
            tick,
            seq,
            cpu,
            events: events.bits(),
        }));
    }

    /// Tick of the earliest deadline.
    pub fn next_tick(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(d)| d.tick)
    }

    /// Removes and returns the earliest deadline if it is due at `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<Deadline> {
        if self.next_tick()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(d)| d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_due_deadlines_in_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(10, 1, PendingEvents::INTERRUPT);
        timers.schedule(5, 0, PendingEvents::NMI);
        timers.schedule(5, 2, PendingEvents::INTERRUPT);

        assert_eq!(timers.next_tick(), Some(5));
        assert!(timers.pop_due(4).is_none());

        let first = timers.pop_due(7).unwrap();
        assert_eq!((first.tick, first.cpu), (5, 0));
        assert_eq!(first.events(), PendingEvents::NMI);
        assert_eq!(timers.pop_due(7).unwrap().cpu, 2);
        assert!(timers.pop_due(7).is_none());
        assert_eq!(timers.len(), 1);
    }
}
