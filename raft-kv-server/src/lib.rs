//! Raft KV Server
//!
//! Wires the consensus engine, its TCP transport and durable storage into a
//! key-value node, and serves the client front door.

pub mod api;
pub mod config;
pub mod kv_service;
pub mod node;

pub use api::KvServer;
pub use config::NodeConfig;
pub use kv_service::KvService;
pub use node::KvNode;
