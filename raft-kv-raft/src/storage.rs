//! Durable Raft state
//!
//! `currentTerm`, `votedFor` and the log must reach stable storage before a
//! node answers any RPC or grants any vote. The engine talks to storage only
//! through [`Persister`].

use crate::log::LogEntry;
use parking_lot::Mutex;
use raft_kv_core::{LogIndex, NodeId, RaftKvError, Result, Term};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// State recovered after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
    /// Highest index known committed when the state was written. Committed
    /// entries are permanent, so replaying up to here on recovery is safe.
    pub commit_index: Option<LogIndex>,
}

/// Borrowed view of the state to write; encodes identically to [`HardState`]
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HardStateRef<'a> {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: &'a [LogEntry],
    pub commit_index: Option<LogIndex>,
}

impl HardStateRef<'_> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

impl HardState {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| RaftKvError::Persistence(format!("corrupt hard state: {}", e)))
    }

    pub fn borrowed(&self) -> HardStateRef<'_> {
        HardStateRef {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: &self.log,
            commit_index: self.commit_index,
        }
    }
}

/// Stable storage for the hard state
///
/// `save` must not return before the state is durable. An error aborts the
/// operation that needed the write.
pub trait Persister: Send + Sync + 'static {
    fn save(&self, state: HardStateRef<'_>) -> Result<()>;

    fn load(&self) -> Result<Option<HardState>>;
}

/// Volatile persister for tests and single-process clusters
///
/// Keeps the encoded bytes so a node rebuilt from the same persister sees
/// exactly what a disk would have returned. Writes can be made to fail.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    bytes: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
    saves: AtomicU64,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `save` fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: HardStateRef<'_>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RaftKvError::Persistence("injected write failure".to_string()));
        }
        let encoded = state.encode()?;
        *self.bytes.lock() = Some(encoded);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Option<HardState>> {
        self.bytes
            .lock()
            .as_deref()
            .map(HardState::decode)
            .transpose()
    }
}
