//! Network worker
//!
//! The single TCP-facing worker (id 0). It owns the listening socket,
//! keeps one accept token and one pop token per store-worker channel
//! outstanding, and multiplexes everything with `wait_any`. Incoming
//! requests are wrapped in a [`KvRequest`] envelope and handed to a
//! store worker chosen by the dispatch policy; envelopes coming back
//! are unwrapped and their payload pushed to the recorded client queue.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use shardkv_core::{OpCode, QToken, QueueError, QueueResult, Sga};
use shardkv_queue::service::{QResult, QValue, Qd};
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatcher, Policy};
use crate::envelope::{KvRequest, KvResponse};
use crate::latency::LatencyLog;
use crate::worker::{Worker, WorkerCore, WorkerId, NET_WORKER_ID};

const LISTEN_BACKLOG: i32 = 128;

pub struct NetWorker {
    core: WorkerCore,
    bind_addr: SocketAddrV4,
    dispatcher: Dispatcher,
    lqd: Option<Qd>,
    /// Every outstanding token: the accept, one pop per peer channel,
    /// one pop per client connection, plus parked response pushes.
    tokens: Vec<QToken>,
    start_offset: usize,
    latency: Option<LatencyLog>,
    /// Published once the listener is bound; lets the launcher report
    /// (and tests discover) the actual address.
    bound: Arc<OnceLock<SocketAddrV4>>,
}

impl NetWorker {
    pub fn new(bind_addr: SocketAddrV4, policy: Policy, latency_log: Option<PathBuf>) -> Self {
        Self {
            core: WorkerCore::new(NET_WORKER_ID),
            bind_addr,
            dispatcher: Dispatcher::new(policy),
            lqd: None,
            tokens: Vec::new(),
            start_offset: 0,
            latency: latency_log.map(LatencyLog::new),
            bound: Arc::new(OnceLock::new()),
        }
    }

    /// Handle resolving to the bound listener address after setup.
    pub fn bound_addr(&self) -> Arc<OnceLock<SocketAddrV4>> {
        Arc::clone(&self.bound)
    }

    /// A qd that is neither the listener nor a peer channel is a
    /// client connection.
    fn is_client(&self, qd: Qd) -> bool {
        Some(qd) != self.lqd && self.core.peer_id(qd).is_none()
    }

    fn rearm_accept(&mut self) -> QueueResult<()> {
        let lqd = self.lqd.expect("listener created in setup");
        let qt = self.core.unit.accept(lqd)?;
        self.tokens.push(qt);
        Ok(())
    }

    fn handle_accept(&mut self, result: QResult) -> QueueResult<()> {
        match result.value {
            Ok(QValue::Accepted { qd, addr }) => {
                debug!("accepted connection from {addr} at {qd}");
                self.rearm_accept()?;
                let qt = self.core.unit.pop(qd)?;
                self.tokens.push(qt);
            }
            Ok(other) => {
                warn!("unexpected completion on listener: {other:?}");
                self.rearm_accept()?;
            }
            Err(e) => {
                warn!("accept failed: {e}");
                self.rearm_accept()?;
            }
        }
        Ok(())
    }

    /// A fresh request popped from a client connection.
    fn handle_request(&mut self, qd: Qd, value: Result<QValue, QueueError>) -> QueueResult<()> {
        match value {
            Ok(QValue::Sga(sga)) => {
                if let Some(latency) = &mut self.latency {
                    latency.record_entry();
                }
                let first_seg = sga.segment(0).cloned().unwrap_or_else(Bytes::new);
                let peers = self.core.peer_ids().to_vec();
                let Some(peer) = self.dispatcher.choose(&peers, &first_seg) else {
                    warn!("no store workers registered; dropping request");
                    let qt = self.core.unit.pop(qd)?;
                    self.tokens.push(qt);
                    return Ok(());
                };

                let envelope = KvRequest { client_qd: qd, sga };
                match envelope.into_sga() {
                    Ok(wrapped) => {
                        if let Err(e) = self.core.push_to_peer(peer, wrapped) {
                            warn!("could not push to worker {peer}: {e}");
                        } else {
                            debug!("dispatched request from {qd} to worker {peer}");
                        }
                    }
                    Err(e) => warn!("request from {qd} does not fit an envelope: {e}"),
                }

                let qt = self.core.unit.pop(qd)?;
                self.tokens.push(qt);
            }
            Ok(other) => warn!("unexpected pop completion on {qd}: {other:?}"),
            Err(e) => {
                // Framing or socket damage: drop the connection, the
                // rest of the clients are unaffected.
                warn!("closing client {qd}: {e}");
                self.core.unit.close(qd);
            }
        }
        Ok(())
    }

    /// A response envelope popped from a store-worker channel.
    fn handle_response(
        &mut self,
        peer: WorkerId,
        value: Result<QValue, QueueError>,
    ) -> QueueResult<()> {
        match value {
            Ok(QValue::Sga(sga)) => {
                match KvResponse::from_sga(sga) {
                    Ok(response) => {
                        let client_qd = response.client_qd;
                        let body = Sga::from_segment(response.body);
                        match self.core.unit.push(client_qd, body) {
                            Ok(qt) => match self.core.unit.try_wait(qt) {
                                Some(done) => {
                                    if let Err(e) = done.value {
                                        warn!("closing client {client_qd}: {e}");
                                        self.core.unit.close(client_qd);
                                    }
                                }
                                // Socket back-pressured; finish later.
                                None => self.tokens.push(qt),
                            },
                            Err(e) => {
                                debug!("client {client_qd} went away before its reply: {e}")
                            }
                        }
                        if let Some(latency) = &mut self.latency {
                            latency.record_exit();
                        }
                    }
                    Err(e) => error!("malformed envelope from worker {peer}: {e}"),
                }
                let qt = self.core.pop_from_peer(peer)?;
                self.tokens.push(qt);
            }
            Ok(other) => warn!("unexpected completion from worker {peer}: {other:?}"),
            Err(e) => {
                warn!("pop from worker {peer} failed: {e}");
                let qt = self.core.pop_from_peer(peer)?;
                self.tokens.push(qt);
            }
        }
        Ok(())
    }
}

impl Worker for NetWorker {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WorkerCore {
        &mut self.core
    }

    fn setup(&mut self) -> QueueResult<()> {
        let lqd = self.core.unit.socket()?;
        self.core.unit.bind(lqd, self.bind_addr)?;
        self.core.unit.listen(lqd, LISTEN_BACKLOG)?;
        self.lqd = Some(lqd);

        let addr = self.core.unit.local_addr(lqd)?;
        let _ = self.bound.set(addr);
        info!("listening on {addr}");

        self.rearm_accept()?;
        for peer in self.core.peer_ids().to_vec() {
            let qt = self.core.pop_from_peer(peer)?;
            self.tokens.push(qt);
        }
        Ok(())
    }

    fn dequeue(&mut self) -> Option<QResult> {
        let (idx, result) = self
            .core
            .unit
            .wait_any(&self.tokens, &mut self.start_offset)?;
        self.tokens.remove(idx);

        if result.value.as_ref().is_err_and(|e| *e == QueueError::ConnAborted) {
            // Peer reset mid-operation; treated like would-block after
            // the connection is torn down.
            if self.is_client(result.qd) {
                debug!("client {} hung up", result.qd);
                self.core.unit.close(result.qd);
            } else if Some(result.qd) == self.lqd {
                if let Err(e) = self.rearm_accept() {
                    error!("could not re-arm accept: {e}");
                }
            }
            return None;
        }
        Some(result)
    }

    fn work(&mut self, result: QResult) -> QueueResult<()> {
        if Some(result.qd) == self.lqd {
            return self.handle_accept(result);
        }
        match result.opcode {
            OpCode::Push => {
                // Buffers travel with the completion and drop here.
                if let Err(e) = result.value {
                    warn!("closing client {}: push failed: {e}", result.qd);
                    if self.is_client(result.qd) {
                        self.core.unit.close(result.qd);
                    }
                }
            }
            OpCode::Pop => match self.core.peer_id(result.qd) {
                Some(peer) => self.handle_response(peer, result.value)?,
                None => self.handle_request(result.qd, result.value)?,
            },
            opcode => warn!("unexpected {opcode} completion on {}", result.qd),
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(latency) = &self.latency {
            match latency.dump() {
                Ok(rows) => info!("wrote {rows} trace rows to {}", latency.path().display()),
                Err(e) => error!("could not write {}: {e}", latency.path().display()),
            }
        }
    }
}
