//! Queue-internal completion records
//!
//! Queues complete tokens into these raw records; the service unit
//! promotes them into public [`crate::service::QResult`]s (registering
//! freshly accepted sockets along the way).

use std::net::SocketAddrV4;
use std::os::fd::RawFd;

use shardkv_core::{OpCode, QueueError, Sga};

#[derive(Debug)]
pub(crate) enum RawValue {
    Sga(Sga),
    /// Accepted socket not yet promoted to a queue descriptor.
    Accepted { fd: RawFd, addr: SocketAddrV4 },
    Connected,
    Pushed,
}

#[derive(Debug)]
pub(crate) struct RawCompletion {
    pub opcode: OpCode,
    pub value: Result<RawValue, QueueError>,
}

impl RawCompletion {
    pub fn ok(opcode: OpCode, value: RawValue) -> Self {
        Self {
            opcode,
            value: Ok(value),
        }
    }

    pub fn err(opcode: OpCode, err: QueueError) -> Self {
        Self {
            opcode,
            value: Err(err),
        }
    }
}
