use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use super::Task;

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
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
        // Equal deadlines fire in insertion order.
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Deadline-ordered tasks owned by one loop.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl TimerQueue {
    /// Queues `task` for `deadline`. Returns `true` if it is now the earliest entry.
    pub(crate) fn push(&mut self, deadline: Instant, task: Task) -> bool {
        let seq = self.seq;
        self.seq += 1;
        let earliest = self
            .heap
            .peek()
            .is_none_or(|Reverse(first)| deadline < first.deadline);
        self.heap.push(Reverse(Entry {
            deadline,
            seq,
            task,
        }));
        earliest
    }

    /// How long the loop may block before the next timer is due.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(entry)| entry.deadline.saturating_duration_since(now))
    }

    /// Removes and returns every task due at `now`, earliest first.
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<Task> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.deadline <= now)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.task);
            }
        }
        due
    }

    /// Empties the queue, returning every task regardless of deadline.
    pub(crate) fn take_all(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.heap)
            .into_iter()
            .map(|Reverse(entry)| entry.task)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
