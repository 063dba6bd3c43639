//! Bounded in-memory priority queue backing the scheduler's drain loop.

use std::collections::VecDeque;

use super::error::SchedulerError;
use super::task::Priority;

/// Priority list with FIFO ordering inside each priority level.
///
/// A new entry is spliced ahead of every entry with a strictly lower
/// priority and behind every entry of equal or higher priority, so
/// equal-priority entries drain in submission order while higher-priority
/// arrivals jump the line. Dequeuing always takes the head.
pub struct PriorityQueue<E> {
    capacity: usize,
    items: VecDeque<(Priority, E)>,
}

impl<E> PriorityQueue<E> {
    /// Create a queue rejecting entries beyond `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Enqueue an entry, failing fast when the queue is at capacity.
    pub fn push(&mut self, priority: Priority, entry: E) -> Result<(), SchedulerError> {
        if self.items.len() >= self.capacity {
            return Err(SchedulerError::QueueFull(self.capacity));
        }
        self.splice(priority, entry);
        Ok(())
    }

    /// Enqueue a group of entries: either the whole group fits within
    /// capacity or nothing is added.
    pub fn push_all(&mut self, entries: Vec<(Priority, E)>) -> Result<(), SchedulerError> {
        if self.items.len() + entries.len() > self.capacity {
            return Err(SchedulerError::QueueFull(self.capacity));
        }
        for (priority, entry) in entries {
            self.splice(priority, entry);
        }
        Ok(())
    }

    fn splice(&mut self, priority: Priority, entry: E) {
        let at = self
            .items
            .iter()
            .position(|(p, _)| *p < priority)
            .unwrap_or(self.items.len());
        self.items.insert(at, (priority, entry));
    }

    /// Remove and return the head entry.
    pub fn pop(&mut self) -> Option<E> {
        self.items.pop_front().map(|(_, e)| e)
    }

    /// Remove every queued entry, preserving drain order.
    pub fn drain(&mut self) -> Vec<E> {
        self.items.drain(..).map(|(_, e)| e).collect()
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum depth before submissions are rejected.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
