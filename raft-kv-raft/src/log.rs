//! Raft Log Implementation
//!
//! This module implements the Raft log, which stores commands to be replicated
//! and applied to the state machine. Indexes are 0-based; an empty log has no
//! last index and no last term.

use raft_kv_core::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term in which the leader created the entry
    pub term: Term,
    /// The command to apply to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: Term, command: Vec<u8>) -> Self {
        Self { term, command }
    }
}

/// The Raft log structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// Create a new empty log
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild a log from persisted entries
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }

    /// Append an entry and return its index
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        let index = (self.entries.len() - 1) as LogIndex;
        debug!("Appended entry at index {}", index);
        index
    }

    /// Get a log entry by index
    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.entries.get(index as usize)
    }

    /// Term of the entry at `index`, if present
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.entry_at(index).map(|e| e.term)
    }

    /// Index of the last entry, `None` when empty
    pub fn last_index(&self) -> Option<LogIndex> {
        self.entries.len().checked_sub(1).map(|i| i as LogIndex)
    }

    /// Term of the last entry, `None` when empty
    pub fn last_term(&self) -> Option<Term> {
        self.entries.last().map(|e| e.term)
    }

    /// Drop every entry at or after `index`
    pub fn truncate_from(&mut self, index: LogIndex) {
        let index = index as usize;
        if index < self.entries.len() {
            debug!(
                "Truncating log from index {} ({} entries dropped)",
                index,
                self.entries.len() - index
            );
            self.entries.truncate(index);
        }
    }

    /// Entries from `index` to the end of the log
    pub fn entries_from(&self, index: LogIndex) -> &[LogEntry] {
        let start = (index as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Entries in the inclusive range `[from, to]`
    pub fn entries_between(&self, from: LogIndex, to: LogIndex) -> &[LogEntry] {
        let end = (to as usize + 1).min(self.entries.len());
        let start = (from as usize).min(end);
        &self.entries[start..end]
    }

    /// All entries
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Get the number of entries in the log
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[Term]) -> RaftLog {
        let mut log = RaftLog::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(LogEntry::new(*term, vec![i as u8]));
        }
        log
    }

    #[test]
    fn test_empty_log() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), None);
        assert_eq!(log.last_term(), None);
        assert!(log.entry_at(0).is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn test_append_returns_index() {
        let mut log = RaftLog::new();
        assert_eq!(log.append(LogEntry::new(1, vec![1])), 0);
        assert_eq!(log.append(LogEntry::new(1, vec![2])), 1);
        assert_eq!(log.append(LogEntry::new(2, vec![3])), 2);

        assert_eq!(log.last_index(), Some(2));
        assert_eq!(log.last_term(), Some(2));
        assert_eq!(log.entry_at(1).unwrap().command, vec![2]);
        assert!(log.entry_at(3).is_none());
    }

    #[test]
    fn test_truncate() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        log.truncate_from(2);

        assert_eq!(log.len(), 2);
        assert_eq!(log.last_term(), Some(1));
        assert!(log.entry_at(2).is_none());

        // Past the end is a no-op
        log.truncate_from(10);
        assert_eq!(log.len(), 2);

        log.truncate_from(0);
        assert!(log.is_empty());
    }

    #[test]
    fn test_entries_from() {
        let log = log_with_terms(&[1, 1, 2]);

        assert_eq!(log.entries_from(0).len(), 3);
        let suffix = log.entries_from(1);
        assert_eq!(suffix.len(), 2);
        assert_eq!(suffix[0].command, vec![1]);
        assert!(log.entries_from(3).is_empty());
        assert!(log.entries_from(7).is_empty());
    }

    #[test]
    fn test_entries_between() {
        let log = log_with_terms(&[1, 1, 2, 3]);

        let range = log.entries_between(1, 2);
        assert_eq!(range.len(), 2);
        assert_eq!(range[1].term, 2);

        assert_eq!(log.entries_between(2, 9).len(), 2);
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(log.term_at(4), None);
    }
}
