//! Raft KV Core Library
//!
//! Shared types for the replicated key-value store: node identifiers,
//! the error taxonomy, the command format replicated through the log and
//! the length-prefixed wire framing used by every TCP endpoint.

pub mod command;
pub mod error;
pub mod protocol;
pub mod types;

pub use command::*;
pub use error::*;
pub use protocol::*;
pub use types::*;
