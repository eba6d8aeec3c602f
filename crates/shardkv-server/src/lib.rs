//! # shardkv-server
//!
//! The worker runtime on top of the `shardkv-queue` fabric: a network
//! worker speaking framed TCP, store workers executing KV commands, and
//! the peer-to-peer channel wiring between them.
//!
//! ## Modules
//!
//! - `worker` - worker trait, peer registration, lifecycle handles
//! - `networker` - the TCP-facing dispatcher worker (id 0)
//! - `storeworker` - KV-executing workers (ids 1..)
//! - `envelope` - request/response envelopes crossing the channels
//! - `dispatch` - round-robin and first-key-digit policies
//! - `store` - the KV engine and its seed-then-freeze lifecycle
//! - `latency` - per-request entry/exit traces
//! - `config` - server configuration
//! - `pin` - worker thread pinning

pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod latency;
pub mod networker;
pub mod pin;
pub mod store;
pub mod storeworker;
pub mod worker;

// Re-exports for convenience
pub use config::ServerConfig;
pub use dispatch::{Dispatcher, Policy};
pub use networker::NetWorker;
pub use store::KvStore;
pub use storeworker::StoreWorker;
pub use worker::{launch, register_peers, Topology, Worker, WorkerId, NET_WORKER_ID};
