//! Commands replicated through the Raft log
//!
//! Every write carries a request id so the state machine can recognise a
//! command it has already applied.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A mutation of the key-value map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    /// Store `value` under `key`
    Set {
        key: String,
        value: String,
        request_id: Uuid,
    },
    /// Remove `key`
    Delete { key: String, request_id: Uuid },
}

impl KvCommand {
    /// Build a Set command with a fresh request id
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
            request_id: Uuid::new_v4(),
        }
    }

    /// Build a Delete command with a fresh request id
    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete {
            key: key.into(),
            request_id: Uuid::new_v4(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            KvCommand::Set { request_id, .. } | KvCommand::Delete { request_id, .. } => *request_id,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            KvCommand::Set { key, .. } | KvCommand::Delete { key, .. } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
