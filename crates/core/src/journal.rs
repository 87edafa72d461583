//! Bounded invocation journal.
//!
//! Append order equals response-completion order, which is what ordered
//! verification reasons about. When the bound is reached the oldest
//! entries fall off; fulfillment counts are tracked on the expectations
//! themselves, so eviction only limits diagnostics, never correctness.

use std::collections::VecDeque;

use cmdmox_common::wire::Invocation;

/// One finalized invocation plus the expectation it matched, if any.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub invocation: Invocation,
    /// Declaration index of the matched expectation; `None` marks an
    /// unexpected call.
    pub matched: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Journal {
    entries: VecDeque<JournalEntry>,
    capacity: usize,
}

impl Journal {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: JournalEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<JournalEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
