//! Service unit: the per-thread queue API and completion scheduler
//!
//! A [`ServiceUnit`] bundles everything one worker thread needs: the
//! descriptor table of IO queues (socket- or channel-backed), the token
//! table of in-flight operations, and the lazily created readiness
//! facility. Service units are never shared between threads;
//! cross-thread traffic flows only through the shared channels wired
//! into shared queues.
//!
//! The scheduler is cooperative: `wait` busy-polls the owning queue
//! until its token completes, and `wait_any` makes a single round-robin
//! pass over a token set, advancing its start offset on every call so a
//! hot token cannot starve the rest.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::Arc;

use shardkv_core::{OpCode, QToken, QueueError, QueueResult, Sga, SharedChannel, TokenMinter};

use crate::completion::{RawCompletion, RawValue};
use crate::netq::NetworkQueue;
use crate::poller::{Interest, Poller};
use crate::sharedq::SharedQueue;
use crate::socket;

/// Head operations attempted per direction on each scheduler poll.
const MAX_REQUESTS_PER_POLL: usize = 1;

/// Opaque descriptor for an IO queue within one service unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Qd(u32);

impl Qd {
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Qd(raw)
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Qd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qd:{}", self.0)
    }
}

/// Successful completion payload.
#[derive(Debug)]
pub enum QValue {
    /// A popped message.
    Sga(Sga),
    /// A freshly accepted connection, already registered as a queue.
    Accepted { qd: Qd, addr: SocketAddrV4 },
    Connected,
    /// The pushed message left this side; its buffers went with it
    /// (shared queues) or were dropped after the final write (sockets).
    Pushed,
}

/// The record handed to a worker for one completed token.
#[derive(Debug)]
pub struct QResult {
    pub opcode: OpCode,
    pub qd: Qd,
    pub value: Result<QValue, QueueError>,
}

#[derive(Debug)]
enum IoQueue {
    Network(NetworkQueue),
    Shared(SharedQueue),
}

impl IoQueue {
    fn process(&mut self, max_requests: usize) {
        match self {
            IoQueue::Network(q) => q.process(max_requests),
            IoQueue::Shared(q) => q.process(max_requests),
        }
    }

    fn take_completion(&mut self, qt: QToken) -> Option<RawCompletion> {
        match self {
            IoQueue::Network(q) => q.take_completion(qt),
            IoQueue::Shared(q) => q.take_completion(qt),
        }
    }

    fn drain_tokens(&mut self) -> Vec<(QToken, OpCode)> {
        match self {
            IoQueue::Network(q) => q.drain_tokens(),
            IoQueue::Shared(q) => q.drain_tokens(),
        }
    }
}

/// Per-thread bundle of the queue API and the scheduler.
#[derive(Debug)]
pub struct ServiceUnit {
    queues: HashMap<Qd, IoQueue>,
    next_qd: u32,
    minter: TokenMinter,
    token_owner: HashMap<QToken, Qd>,
    /// Tokens orphaned by `close`, delivered as `Aborted` on wait.
    aborted: HashMap<QToken, (Qd, OpCode)>,
    /// Created on the first `socket()` call within the owning thread.
    poller: Option<Poller>,
}

impl ServiceUnit {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            next_qd: 1,
            minter: TokenMinter::new(),
            token_owner: HashMap::new(),
            aborted: HashMap::new(),
            poller: None,
        }
    }

    fn alloc_qd(&mut self) -> Qd {
        let qd = Qd(self.next_qd);
        self.next_qd += 1;
        qd
    }

    fn register_with_poller(&mut self, fd: RawFd, qd: Qd, interest: Interest) -> QueueResult<()> {
        if self.poller.is_none() {
            self.poller = Some(Poller::new().map_err(QueueError::from)?);
        }
        let poller = self.poller.as_ref().expect("poller just created");
        poller
            .register(fd, qd.as_raw() as u64, interest)
            .map_err(QueueError::from)
    }

    fn network_mut(&mut self, qd: Qd) -> QueueResult<&mut NetworkQueue> {
        match self.queues.get_mut(&qd) {
            Some(IoQueue::Network(q)) => Ok(q),
            _ => Err(QueueError::Aborted),
        }
    }

    /// Grow a network queue's readiness mask and mirror it into epoll.
    fn arm(&mut self, qd: Qd, interest: Interest) {
        if let Some(IoQueue::Network(net)) = self.queues.get_mut(&qd) {
            if let Some(mask) = net.add_interest(interest) {
                let fd = net.fd();
                if let Some(poller) = &self.poller {
                    let _ = poller.reregister(fd, qd.as_raw() as u64, mask);
                }
            }
        }
    }

    // ── Queue API ──

    /// Open a nonblocking TCP socket queue.
    pub fn socket(&mut self) -> QueueResult<Qd> {
        let fd = socket::tcp_socket().map_err(QueueError::from)?;
        let qd = self.alloc_qd();
        if let Err(e) = self.register_with_poller(fd, qd, Interest::NONE) {
            socket::close(fd);
            return Err(e);
        }
        self.queues.insert(qd, IoQueue::Network(NetworkQueue::new(fd)));
        Ok(qd)
    }

    pub fn bind(&mut self, qd: Qd, addr: SocketAddrV4) -> QueueResult<()> {
        let fd = self.network_mut(qd)?.fd();
        socket::set_reuseaddr(fd)?;
        socket::bind(fd, addr)?;
        Ok(())
    }

    pub fn listen(&mut self, qd: Qd, backlog: i32) -> QueueResult<()> {
        let fd = self.network_mut(qd)?.fd();
        socket::listen(fd, backlog)?;
        Ok(())
    }

    /// The address a bound socket queue actually landed on.
    pub fn local_addr(&mut self, qd: Qd) -> QueueResult<SocketAddrV4> {
        let fd = self.network_mut(qd)?.fd();
        Ok(socket::local_addr(fd)?)
    }

    pub fn accept(&mut self, qd: Qd) -> QueueResult<QToken> {
        let qt = self.minter.next_pop();
        self.network_mut(qd)?.enqueue_accept(qt);
        self.arm(qd, Interest::READABLE);
        self.token_owner.insert(qt, qd);
        Ok(qt)
    }

    pub fn connect(&mut self, qd: Qd, addr: SocketAddrV4) -> QueueResult<QToken> {
        let fd = self.network_mut(qd)?.fd();
        // Issue the nonblocking connect now; the pending op completes
        // once the socket turns writable with no error.
        socket::connect(fd, addr)?;
        let qt = self.minter.next_push();
        self.network_mut(qd)?.enqueue_connect(qt);
        self.arm(qd, Interest::WRITABLE);
        self.token_owner.insert(qt, qd);
        Ok(qt)
    }

    pub fn push(&mut self, qd: Qd, sga: Sga) -> QueueResult<QToken> {
        let qt = self.minter.next_push();
        match self.queues.get_mut(&qd) {
            Some(IoQueue::Network(q)) => q.enqueue_push(qt, sga),
            Some(IoQueue::Shared(q)) => q.enqueue_push(qt, sga),
            None => return Err(QueueError::Aborted),
        }
        self.arm(qd, Interest::WRITABLE);
        self.token_owner.insert(qt, qd);
        Ok(qt)
    }

    pub fn pop(&mut self, qd: Qd) -> QueueResult<QToken> {
        let qt = self.minter.next_pop();
        match self.queues.get_mut(&qd) {
            Some(IoQueue::Network(q)) => q.enqueue_pop(qt),
            Some(IoQueue::Shared(q)) => q.enqueue_pop(qt),
            None => return Err(QueueError::Aborted),
        }
        self.arm(qd, Interest::READABLE);
        self.token_owner.insert(qt, qd);
        Ok(qt)
    }

    /// Create a shared-variant queue: pushes land in `outbound`, pops
    /// drain `inbound`.
    pub fn shared_queue(&mut self, outbound: Arc<SharedChannel>, inbound: Arc<SharedChannel>) -> Qd {
        let qd = self.alloc_qd();
        self.queues
            .insert(qd, IoQueue::Shared(SharedQueue::new(outbound, inbound)));
        qd
    }

    /// Close a queue. In-flight tokens complete with `Aborted`;
    /// closing an unknown descriptor is a no-op.
    pub fn close(&mut self, qd: Qd) {
        let Some(mut queue) = self.queues.remove(&qd) else {
            return;
        };
        if let IoQueue::Network(net) = &queue {
            if let Some(poller) = &self.poller {
                let _ = poller.deregister(net.fd());
            }
        }
        for (qt, opcode) in queue.drain_tokens() {
            self.token_owner.remove(&qt);
            self.aborted.insert(qt, (qd, opcode));
        }
        // Dropping a NetworkQueue releases its socket.
    }

    // ── Scheduler ──

    /// One poll of the token's owning queue. `None` means still in
    /// flight. Waiting on a token this unit never minted (or one whose
    /// completion was already taken) is a programmer error.
    pub fn try_wait(&mut self, qt: QToken) -> Option<QResult> {
        if let Some((qd, opcode)) = self.aborted.remove(&qt) {
            return Some(QResult {
                opcode,
                qd,
                value: Err(QueueError::Aborted),
            });
        }
        let qd = *self
            .token_owner
            .get(&qt)
            .unwrap_or_else(|| panic!("wait on unknown token {qt}"));
        let queue = self.queues.get_mut(&qd).expect("token owner has a queue");
        queue.process(MAX_REQUESTS_PER_POLL);
        let completion = queue.take_completion(qt)?;
        self.token_owner.remove(&qt);
        Some(self.promote(qd, completion))
    }

    /// Busy-poll until the token completes.
    pub fn wait(&mut self, qt: QToken) -> QResult {
        loop {
            if let Some(result) = self.try_wait(qt) {
                return result;
            }
            std::hint::spin_loop();
        }
    }

    /// Single round-robin pass over `tokens` starting at
    /// `*start_offset % tokens.len()`. Returns the first completed
    /// token and its index; the caller removes it from the set.
    pub fn wait_any(
        &mut self,
        tokens: &[QToken],
        start_offset: &mut usize,
    ) -> Option<(usize, QResult)> {
        if tokens.is_empty() {
            return None;
        }
        let len = tokens.len();
        let begin = *start_offset % len;
        for i in 0..len {
            let idx = (begin + i) % len;
            if let Some(result) = self.try_wait(tokens[idx]) {
                *start_offset = idx + 1;
                return Some((idx, result));
            }
        }
        *start_offset = begin + 1;
        None
    }

    fn promote(&mut self, qd: Qd, completion: RawCompletion) -> QResult {
        let value = match completion.value {
            Ok(RawValue::Sga(sga)) => Ok(QValue::Sga(sga)),
            Ok(RawValue::Connected) => Ok(QValue::Connected),
            Ok(RawValue::Pushed) => Ok(QValue::Pushed),
            Ok(RawValue::Accepted { fd, addr }) => {
                let new_qd = self.alloc_qd();
                match self.register_with_poller(fd, new_qd, Interest::NONE) {
                    Ok(()) => {
                        self.queues
                            .insert(new_qd, IoQueue::Network(NetworkQueue::new(fd)));
                        Ok(QValue::Accepted { qd: new_qd, addr })
                    }
                    Err(e) => {
                        socket::close(fd);
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };
        QResult {
            opcode: completion.opcode,
            qd,
            value,
        }
    }
}

impl Default for ServiceUnit {
    fn default() -> Self {
        Self::new()
    }
}
