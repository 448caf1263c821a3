use std::collections::BinaryHeap;

use crate::units::Time;

use super::data_structs::{SimAction, SimEvent};

/// Discrete event clock. Events at the same time pop in the order they were pushed.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    queue: BinaryHeap<SimEvent>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time: Time, action: SimAction) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.queue.push(SimEvent { time, seq, action });
    }

    pub fn pop(&mut self) -> Option<SimEvent> {
        self.queue.pop()
    }

    pub fn peek_time(&self) -> Option<Time> {
        self.queue.peek().map(|x| x.time)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every pending event, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }
}
