//! Delayed-task queue, private to the consumer thread.
//!
//! A min-heap ordered by due time with a strictly increasing sequence number
//! as tie-break, so timers scheduled for the same instant run in the order
//! they were posted. Cross-thread callers never touch this structure; the
//! runner forwards their requests to the consumer thread as posted tasks.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::slab::Task;

pub(crate) struct DelayQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on both keys: BinaryHeap is a max-heap and we want the
        // earliest due time (then lowest sequence) on top.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl DelayQueue {
    pub fn new() -> Self {
        DelayQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, due: Instant, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { due, seq, task });
    }

    /// The earliest due time, if any task is queued.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.due)
    }

    /// Pops the earliest task whose due time has arrived.
    pub fn pop_due(&mut self, now: Instant) -> Option<Task> {
        if self.heap.peek()?.due <= now {
            Some(self.heap.pop().expect("peeked entry vanished").task)
        } else {
            None
        }
    }

}
