//! Request dispatch policies
//!
//! The network worker picks a destination store worker per request.
//! Both policies are deterministic: round-robin walks the peer list,
//! first-key-digit hashes on the byte right after the first space of
//! the request text.

use core::fmt;

use crate::worker::WorkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    FirstKeyDigit,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::RoundRobin => write!(f, "RR"),
            Policy::FirstKeyDigit => write!(f, "KEY"),
        }
    }
}

/// Per-NetWorker dispatcher state.
#[derive(Debug)]
pub struct Dispatcher {
    policy: Policy,
    offset: usize,
}

impl Dispatcher {
    pub fn new(policy: Policy) -> Self {
        Self { policy, offset: 0 }
    }

    /// Pick the peer the request goes to. `None` only when no peers
    /// are registered.
    pub fn choose(&mut self, peers: &[WorkerId], request: &[u8]) -> Option<WorkerId> {
        if peers.is_empty() {
            return None;
        }
        match self.policy {
            Policy::RoundRobin => {
                let id = peers[self.offset % peers.len()];
                self.offset = (self.offset + 1) % peers.len();
                Some(id)
            }
            Policy::FirstKeyDigit => {
                // Byte after the first space, minus '0'. Requests with
                // no space (or nothing after it) map to digit 0;
                // Euclidean remainder keeps non-digit bytes in range.
                let digit = request
                    .iter()
                    .position(|&b| b == b' ')
                    .and_then(|i| request.get(i + 1))
                    .map(|&b| b as i32 - '0' as i32)
                    .unwrap_or(0);
                let idx = digit.rem_euclid(peers.len() as i32) as usize;
                Some(peers[idx])
            }
        }
    }
}
