//! Raft KV Client Library
//!
//! Async client for the replicated key-value store. Requests go to one known
//! node at a time; on a redirect or a failure the client moves on to the
//! next node and tries again.

pub mod client;
pub mod connection;

pub use client::{ClientConfig, KvClient};
pub use connection::KvConnection;
