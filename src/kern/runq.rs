//! Run Queue Management
//!
//! The run queue holds every `Ready` schob of a host. It is a strict
//! multi-level priority queue:
//!
//! - a higher numeric priority always runs before a lower one;
//! - within one priority level, schobs run in the order they became ready.
//!
//! With every schob at the default priority this degenerates to a plain FIFO.
//! A busy high-priority level starves lower ones; nothing ages priorities.
//!
//! The queue has no lock of its own. The host keeps it under the run-queue
//! mutex together with the shutdown flag, so that workers can wait on the
//! run-queue condition variable.

use std::collections::{BTreeMap, VecDeque};

/// Anything that can sit on a run queue
pub trait Prioritized {
    fn priority(&self) -> u32;
}

// ============================================================================
// Priority Queue (single priority level)
// ============================================================================

/// Entries at a single priority level, FIFO
#[derive(Debug)]
pub struct PriorityQueue<T> {
    entries: VecDeque<T>,
}

impl<T> PriorityQueue<T> {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Add to the back (FIFO)
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
    }

    /// Remove from the front
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.entries.front()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Run Queue
// ============================================================================

/// Multi-level run queue, highest priority first
#[derive(Debug)]
pub struct RunQueue<T> {
    /// Non-empty levels only
    levels: BTreeMap<u32, PriorityQueue<T>>,
    count: usize,
}

impl<T: Prioritized> RunQueue<T> {
    pub const fn new() -> Self {
        Self {
            levels: BTreeMap::new(),
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Append at the entry's priority level
    pub fn enqueue(&mut self, entry: T) {
        self.levels.entry(entry.priority()).or_default().push(entry);
        self.count += 1;
    }

    /// Remove the oldest entry of the highest non-empty level
    pub fn dequeue(&mut self) -> Option<T> {
        let mut level = self.levels.last_entry()?;
        let entry = level.get_mut().pop();
        if level.get().is_empty() {
            level.remove();
        }
        if entry.is_some() {
            self.count -= 1;
        }
        entry
    }

    /// Peek at what `dequeue` would return
    pub fn peek(&self) -> Option<&T> {
        self.levels.values().next_back()?.front()
    }

    /// Highest priority currently queued
    pub fn highest_priority(&self) -> Option<u32> {
        self.levels.keys().next_back().copied()
    }

    pub fn count_at_priority(&self, prio: u32) -> usize {
        self.levels.get(&prio).map_or(0, PriorityQueue::len)
    }

    /// Move every entry of `source` onto the queue, preserving its order
    pub fn extend<I: IntoIterator<Item = T>>(&mut self, source: I) {
        for entry in source {
            self.enqueue(entry);
        }
    }

    /// Remove everything, highest priority first
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.count);
        while let Some(entry) = self.dequeue() {
            out.push(entry);
        }
        out
    }
}

impl<T: Prioritized> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
