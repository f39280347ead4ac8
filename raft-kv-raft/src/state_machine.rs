//! Raft State Machine
//!
//! This module defines the state machine interface and the key-value
//! implementation the store replicates.

use raft_kv_core::KvCommand;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// Trait for a Raft state machine
///
/// The state machine applies commands from the Raft log in order.
/// Implementations must ensure that applying the same sequence of
/// commands always produces the same result, and that applying a command a
/// second time (replay after a crash) leaves the state unchanged.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command. Commands that cannot be interpreted are
    /// skipped; the consensus engine never sees a failure.
    fn apply(&mut self, command: &[u8]);

    /// Clear all application state and replay `history` in order
    fn reset(&mut self, history: &[Vec<u8>]);
}

/// A stored value together with the request that wrote it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: String,
    pub request_id: Uuid,
}

/// In-memory key-value state machine
///
/// Remembers the request id of every applied command, so a duplicate of an
/// already-applied command is a no-op and a writer can wait until its own
/// request becomes visible.
///
/// The id set holds at most one id per applied log entry. The log is never
/// compacted, so the set grows with it and is rebuilt from the replayed
/// history on `reset`.
#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, VersionedValue>,
    // One id per applied entry; trimming it would need log compaction
    applied_requests: HashSet<Uuid>,
    applied_count: u64,
}

impl KvStateMachine {
    /// Create a new empty state machine
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|v| v.value.as_str())
    }

    /// Get a value with the id of the request that wrote it
    pub fn get_versioned(&self, key: &str) -> Option<&VersionedValue> {
        self.data.get(key)
    }

    /// Whether the command carrying `request_id` has been applied
    pub fn is_applied(&self, request_id: &Uuid) -> bool {
        self.applied_requests.contains(request_id)
    }

    /// Number of commands that actually changed state
    pub fn applied_count(&self) -> u64 {
        self.applied_count
    }

    /// Number of request ids remembered for deduplication
    pub fn tracked_requests(&self) -> usize {
        self.applied_requests.len()
    }

    /// Get all keys
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn apply_command(&mut self, command: KvCommand) {
        let request_id = command.request_id();
        if !self.applied_requests.insert(request_id) {
            debug!("Skipping already applied request {}", request_id);
            return;
        }

        match command {
            KvCommand::Set {
                key,
                value,
                request_id,
            } => {
                self.data.insert(key, VersionedValue { value, request_id });
            }
            KvCommand::Delete { key, .. } => {
                self.data.remove(&key);
            }
        }
        self.applied_count += 1;
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, command: &[u8]) {
        match KvCommand::decode(command) {
            Ok(cmd) => self.apply_command(cmd),
            Err(e) => warn!("Skipping undecodable command ({} bytes): {}", command.len(), e),
        }
    }

    fn reset(&mut self, history: &[Vec<u8>]) {
        self.data.clear();
        self.applied_requests.clear();
        self.applied_count = 0;
        for command in history {
            self.apply(command);
        }
        debug!("State machine reset with {} replayed commands", history.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(cmd: &KvCommand) -> Vec<u8> {
        cmd.encode().unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let mut sm = KvStateMachine::new();
        let cmd = KvCommand::set("key1", "v1");
        sm.apply(&encoded(&cmd));

        assert_eq!(sm.get("key1"), Some("v1"));
        assert_eq!(sm.get_versioned("key1").unwrap().request_id, cmd.request_id());
        assert!(sm.is_applied(&cmd.request_id()));
        assert_eq!(sm.len(), 1);
    }

    #[test]
    fn test_missing_key() {
        let sm = KvStateMachine::new();
        assert_eq!(sm.get("nope"), None);
    }

    #[test]
    fn test_delete() {
        let mut sm = KvStateMachine::new();
        sm.apply(&encoded(&KvCommand::set("key1", "v1")));
        sm.apply(&encoded(&KvCommand::delete("key1")));

        assert!(sm.get("key1").is_none());
        assert!(sm.is_empty());
    }

    #[test]
    fn test_duplicate_apply_is_noop() {
        let mut sm = KvStateMachine::new();
        let first = encoded(&KvCommand::set("k", "a"));
        let second = encoded(&KvCommand::set("k", "b"));

        sm.apply(&first);
        sm.apply(&second);
        // Replaying the older command must not resurrect its value
        sm.apply(&first);

        assert_eq!(sm.get("k"), Some("b"));
        assert_eq!(sm.applied_count(), 2);
    }

    #[test]
    fn test_tracked_requests_bounded_by_applied_history() {
        let mut sm = KvStateMachine::new();
        let mut history = Vec::new();
        for i in 0..50 {
            let cmd = encoded(&KvCommand::set("hot", format!("v{}", i)));
            sm.apply(&cmd);
            history.push(cmd);
        }
        let delete = encoded(&KvCommand::delete("hot"));
        sm.apply(&delete);
        sm.apply(&delete);
        history.push(delete);

        assert!(sm.is_empty());
        assert_eq!(sm.tracked_requests(), history.len());

        // A reset keeps only what the replayed history carries
        sm.reset(&history[45..]);
        assert_eq!(sm.tracked_requests(), history.len() - 45);
        assert!(sm.is_empty());
    }

    #[test]
    fn test_undecodable_command_is_skipped() {
        let mut sm = KvStateMachine::new();
        sm.apply(&[1, 2, 3, 4, 5]);
        assert!(sm.is_empty());
        assert_eq!(sm.applied_count(), 0);
    }

    #[test]
    fn test_reset_replays_history() {
        let mut sm = KvStateMachine::new();
        sm.apply(&encoded(&KvCommand::set("stale", "x")));

        let history = vec![
            encoded(&KvCommand::set("a", "1")),
            encoded(&KvCommand::set("b", "2")),
            encoded(&KvCommand::delete("a")),
        ];
        sm.reset(&history);

        assert_eq!(sm.get("stale"), None);
        assert_eq!(sm.get("a"), None);
        assert_eq!(sm.get("b"), Some("2"));
        assert_eq!(sm.applied_count(), 3);
    }

    #[test]
    fn test_replaying_history_twice_matches_once() {
        let history = vec![
            encoded(&KvCommand::set("a", "1")),
            encoded(&KvCommand::set("a", "2")),
        ];

        let mut once = KvStateMachine::new();
        once.reset(&history);

        let mut twice = KvStateMachine::new();
        twice.reset(&history);
        for cmd in &history {
            twice.apply(cmd);
        }

        assert_eq!(once.get("a"), twice.get("a"));
        assert_eq!(once.applied_count(), twice.applied_count());
    }
}
