//! Trailing window of committed operations.
//!
//! The room keeps the last `limit` operations so a submission built against
//! an older revision can be transformed forward. Anything older than the
//! window is gone; such submissions are rejected and the client resyncs.

use std::collections::VecDeque;

use scribe_core::{Operation, Tagged};

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub revision: u64,
    pub origin: String,
    pub operation: Operation,
}

impl HistoryEntry {
    pub fn tagged(&self) -> Tagged<'_> {
        Tagged::new(&self.operation, &self.origin)
    }
}

#[derive(Debug, Clone)]
pub struct OperationHistory {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
    /// Revision of the newest committed operation (or the starting revision).
    head: u64,
}

impl OperationHistory {
    /// An empty window whose head is `revision`.
    pub fn new(revision: u64, limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            limit,
            head: revision,
        }
    }

    /// Record the operation committed at `revision`, which must be `head + 1`.
    pub fn push(&mut self, revision: u64, origin: impl Into<String>, operation: Operation) {
        debug_assert_eq!(revision, self.head + 1, "history revisions must be contiguous");
        self.head = revision;
        if self.limit == 0 {
            return;
        }
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            revision,
            origin: origin.into(),
            operation,
        });
    }

    /// Everything committed after `base`, oldest first.
    ///
    /// `None` when `base` is ahead of the head or the window no longer
    /// reaches back to `base + 1`.
    pub fn since(&self, base: u64) -> Option<impl Iterator<Item = &HistoryEntry>> {
        if base > self.head {
            return None;
        }
        let missing = (self.head - base) as usize;
        if missing > self.entries.len() {
            return None;
        }
        Some(self.entries.iter().skip(self.entries.len() - missing))
    }

    /// Oldest revision a submission may still be based on.
    pub fn oldest_base(&self) -> u64 {
        self.head - self.entries.len() as u64
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
