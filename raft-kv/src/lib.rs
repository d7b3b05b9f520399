//! Raft-replicated key-value store.
//!
//! Every node keeps a full copy of a string-to-string map. Writes go through
//! the leader's raft log and are applied in commit order on every replica;
//! reads are served from the local copy, optionally after the leader confirms
//! it still holds leadership.
//!
//! # Architecture
//!
//! - **Worker thread**: owns the raft node, persists the log, applies
//!   committed entries and resolves waiting callers
//! - **Transport threads**: one listener plus one sender per peer, moving
//!   prost-encoded raft messages over TCP
//! - **Observer thread**: publishes the leader's HTTP address after every
//!   election it wins
//! - **HTTP server**: axum on tokio; blocking store calls run on the blocking pool
//!
//! Threads talk over crossbeam channels. Everyone else reads raft state
//! through the [`status::StatusBoard`] the worker publishes to.
//!
//! # Modules
//!
//! - [`command`]: commands replicated through the raft log
//! - [`fsm`]: the key-value and node metadata maps
//! - [`wal`] / [`snapshot`] / [`storage`]: durable log, snapshot files, raft storage
//! - [`node`]: the raft node wrapper
//! - [`transport`]: TCP plumbing between nodes
//! - [`runtime`]: worker loop and node handle
//! - [`membership`]: joining and removing voters
//! - [`store`]: the store facade and consistency levels
//! - [`api`]: HTTP routes and the join client

pub mod api;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod fsm;
pub mod membership;
pub mod node;
pub mod runtime;
pub mod snapshot;
pub mod status;
pub mod storage;
pub mod store;
pub mod transport;
pub mod wal;

/// Raft node id. Zero is reserved by raft for "no node".
pub type NodeId = u64;
