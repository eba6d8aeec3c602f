//! # shardkv-queue
//!
//! The io-queue fabric: a unified asynchronous push/pop contract over
//! two transports (framed nonblocking TCP sockets and one-slot
//! in-process channels), multiplexed per thread by a completion-token
//! scheduler.
//!
//! ## Modules
//!
//! - `socket` - nonblocking TCP wrappers over libc
//! - `poller` - epoll readiness facility and interest masks
//! - `framing` - on-wire frame encoder/decoder state machines
//! - `netq` - socket-backed queue variant
//! - `sharedq` - shared-channel queue variant
//! - `service` - the per-thread service unit and scheduler

pub mod framing;
pub mod poller;
pub mod service;
pub mod socket;

mod completion;
mod netq;
mod sharedq;

// Re-exports for convenience
pub use framing::{encode_frame, FRAME_HEADER_LEN, FRAME_MAGIC, MAX_FRAME_PAYLOAD};
pub use poller::{Interest, Poller};
pub use service::{QResult, QValue, Qd, ServiceUnit};
