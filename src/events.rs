use super::packet::Packet;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Work scheduled for a future cycle.
///
/// Every handler that must not run inside the call stack that requested it
/// (bus grants, snoop dispatch, CPU responses, memory responses) goes through
/// this queue with a one-cycle delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// the bus is free to promote the next queued requestor
    BusGrant,
    /// drain the bus memory-request queue: snoop peers, then talk to memory
    MemDispatch,
    /// drain a cache's pending CPU responses
    CpuResp { cache_id: usize },
    /// memory finished an access; deliver to the granted cache
    MemResponse { packet: Packet },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    tick: u64,
    seq: u64,
    event: Event,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.tick, self.seq).cmp(&(other.tick, other.seq))
    }
}

/// Tick-ordered event queue.
///
/// Events scheduled for the same tick drain in scheduling order, so snoops
/// and responses keep the order their producers established.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, tick: u64, event: Event) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(Scheduled { tick, seq, event }));
    }

    /// Pop the next event due at or before `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<Event> {
        match self.heap.peek() {
            Some(Reverse(scheduled)) if scheduled.tick <= now => {
                self.heap.pop().map(|Reverse(s)| s.event)
            }
            _ => None,
        }
    }

    /// Tick of the earliest scheduled event.
    #[must_use]
    pub fn next_tick(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(s)| s.tick)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
