//! Socket-backed IO queue
//!
//! A [`NetworkQueue`] owns one nonblocking TCP socket, its additive
//! readiness mask, and the in-flight operations against it. Push-class
//! and pop-class operations live in separate FIFO work queues so a pop
//! waiting for the client's next request can never wedge the response
//! push behind it; within each direction completion order equals
//! enqueue order and a stuck head blocks only its own connection.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;

use shardkv_core::{OpCode, QToken, QueueError, Sga};
use tracing::trace;

use crate::completion::{RawCompletion, RawValue};
use crate::framing::{PopState, PushState};
use crate::poller::Interest;
use crate::socket;

#[derive(Debug)]
enum NetPending {
    Push(PushState),
    Pop(PopState),
    Accept,
    Connect,
}

impl NetPending {
    fn opcode(&self) -> OpCode {
        match self {
            NetPending::Push(_) => OpCode::Push,
            NetPending::Pop(_) => OpCode::Pop,
            NetPending::Accept => OpCode::Accept,
            NetPending::Connect => OpCode::Connect,
        }
    }
}

#[derive(Debug)]
pub(crate) struct NetworkQueue {
    fd: RawFd,
    mask: Interest,
    push_q: VecDeque<QToken>,
    pop_q: VecDeque<QToken>,
    pending: HashMap<QToken, NetPending>,
    done: HashMap<QToken, RawCompletion>,
}

impl NetworkQueue {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            mask: Interest::NONE,
            push_q: VecDeque::new(),
            pop_q: VecDeque::new(),
            pending: HashMap::new(),
            done: HashMap::new(),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Grow the readiness mask; returns the new mask when it changed.
    pub fn add_interest(&mut self, interest: Interest) -> Option<Interest> {
        let grown = self.mask | interest;
        if grown == self.mask {
            return None;
        }
        self.mask = grown;
        Some(grown)
    }

    pub fn enqueue_push(&mut self, qt: QToken, sga: Sga) {
        self.pending.insert(qt, NetPending::Push(PushState::new(sga)));
        self.push_q.push_back(qt);
        if self.push_q.len() == 1 {
            // Sockets are nonblocking; give the fresh head one try now.
            self.process_side(true, 1);
        }
    }

    pub fn enqueue_pop(&mut self, qt: QToken) {
        self.pending.insert(qt, NetPending::Pop(PopState::new()));
        self.pop_q.push_back(qt);
        if self.pop_q.len() == 1 {
            self.process_side(false, 1);
        }
    }

    pub fn enqueue_accept(&mut self, qt: QToken) {
        self.pending.insert(qt, NetPending::Accept);
        self.pop_q.push_back(qt);
        if self.pop_q.len() == 1 {
            self.process_side(false, 1);
        }
    }

    pub fn enqueue_connect(&mut self, qt: QToken) {
        self.pending.insert(qt, NetPending::Connect);
        self.push_q.push_back(qt);
        if self.push_q.len() == 1 {
            self.process_side(true, 1);
        }
    }

    /// Service up to `max_requests` head operations per direction.
    pub fn process(&mut self, max_requests: usize) {
        self.process_side(false, max_requests);
        self.process_side(true, max_requests);
    }

    fn process_side(&mut self, push_side: bool, max_requests: usize) {
        for _ in 0..max_requests {
            let queue = if push_side { &self.push_q } else { &self.pop_q };
            let Some(&qt) = queue.front() else { break };

            let pending = self.pending.get_mut(&qt).expect("work queue token has state");
            let outcome = match pending {
                NetPending::Push(state) => match state.poll(self.fd) {
                    Ok(None) => None,
                    Ok(Some(_)) => Some(RawCompletion::ok(OpCode::Push, RawValue::Pushed)),
                    Err(e) => Some(RawCompletion::err(OpCode::Push, e)),
                },
                NetPending::Pop(state) => match state.poll(self.fd) {
                    Ok(None) => None,
                    Ok(Some(sga)) => Some(RawCompletion::ok(OpCode::Pop, RawValue::Sga(sga))),
                    Err(e) => Some(RawCompletion::err(OpCode::Pop, e)),
                },
                NetPending::Accept => match socket::accept(self.fd) {
                    Ok((fd, addr)) => {
                        if let Err(e) = socket::set_nodelay(fd) {
                            trace!(fd, "failed to set TCP_NODELAY on accepted socket: {e}");
                        }
                        Some(RawCompletion::ok(OpCode::Accept, RawValue::Accepted { fd, addr }))
                    }
                    Err(e) => match QueueError::from(e) {
                        QueueError::WouldBlock => None,
                        other => Some(RawCompletion::err(OpCode::Accept, other)),
                    },
                },
                NetPending::Connect => match poll_connect(self.fd) {
                    Ok(false) => None,
                    Ok(true) => Some(RawCompletion::ok(OpCode::Connect, RawValue::Connected)),
                    Err(e) => Some(RawCompletion::err(OpCode::Connect, e)),
                },
            };

            match outcome {
                Some(completion) => {
                    self.pending.remove(&qt);
                    self.done.insert(qt, completion);
                    if push_side {
                        self.push_q.pop_front();
                    } else {
                        self.pop_q.pop_front();
                    }
                }
                // Incomplete heads stay put; the queue is not rotated.
                None => break,
            }
        }
    }

    pub fn take_completion(&mut self, qt: QToken) -> Option<RawCompletion> {
        self.done.remove(&qt)
    }

    /// Tear down for close: report every token still tracked here so
    /// the service unit can complete them as aborted, and release any
    /// accepted-but-unclaimed sockets.
    pub fn drain_tokens(&mut self) -> Vec<(QToken, OpCode)> {
        let mut tokens: Vec<(QToken, OpCode)> = self
            .pending
            .iter()
            .map(|(qt, pending)| (*qt, pending.opcode()))
            .collect();
        for (qt, completion) in self.done.drain() {
            if let Ok(RawValue::Accepted { fd, .. }) = completion.value {
                socket::close(fd);
            }
            tokens.push((qt, completion.opcode));
        }
        self.pending.clear();
        self.push_q.clear();
        self.pop_q.clear();
        tokens
    }
}

impl Drop for NetworkQueue {
    fn drop(&mut self) {
        for (_, completion) in self.done.drain() {
            if let Ok(RawValue::Accepted { fd, .. }) = completion.value {
                socket::close(fd);
            }
        }
        socket::close(self.fd);
    }
}

/// A nonblocking connect completes once the socket is writable with no
/// pending error.
fn poll_connect(fd: RawFd) -> Result<bool, QueueError> {
    if !socket::poll_writable(fd)? {
        return Ok(false);
    }
    socket::take_socket_error(fd)?;
    Ok(true)
}
