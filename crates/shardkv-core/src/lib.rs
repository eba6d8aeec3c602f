//! # shardkv-core
//!
//! Core types for the shardkv dispatch fabric. This crate is
//! platform-agnostic: sockets, epoll and everything else that talks to
//! the OS lives in `shardkv-queue`.
//!
//! ## Modules
//!
//! - `sga` - scatter-gather payloads, the universal message type
//! - `channel` - one-slot SPSC hand-off between two worker threads
//! - `token` - completion tokens for in-flight queue operations
//! - `error` - error types shared across the fabric

pub mod channel;
pub mod error;
pub mod sga;
pub mod token;

// Re-exports for convenience
pub use channel::SharedChannel;
pub use error::{QueueError, QueueResult};
pub use sga::{Sga, MAX_SGA_SEGMENTS};
pub use token::{OpCode, QToken, TokenMinter};
