//! Time-ordered queue of the engine's internally scheduled events.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::time::Instant;

/// Something the engine does at a given wall-clock instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Hand a frame to the host device of node `to`.
    Deliver { to: u32, frame: Arc<[u8]> },
    /// Log channel counters and reschedule.
    StatusReport,
}

#[derive(Debug)]
pub struct ScheduledEvent {
    pub deadline: Instant,
    seq: u64,
    pub event: TimerEvent,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and the earliest deadline must
        // pop first. Equal deadlines pop in scheduling order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of [`TimerEvent`]s keyed by deadline, FIFO within a deadline.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<ScheduledEvent>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, event: TimerEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEvent {
            deadline,
            seq,
            event,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|scheduled| scheduled.deadline)
    }

    /// Pop the earliest event if its deadline is not after `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<ScheduledEvent> {
        if self.next_deadline()? <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop every pending event, returning how many frame deliveries were lost.
    pub fn discard(&mut self) -> u64 {
        self.heap
            .drain()
            .filter(|scheduled| matches!(scheduled.event, TimerEvent::Deliver { .. }))
            .count() as u64
    }
}
